use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "email-server";
/// Rotated files kept on disk, the current one included.
pub const MAX_LOG_FILES: usize = 5;

/// Platform log directory: `%LOCALAPPDATA%\EmailTestingServer\logs` on Windows,
/// `/var/log/email-testing-server` elsewhere.
pub fn system_log_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::data_local_dir()
            .unwrap_or_default()
            .join("EmailTestingServer")
            .join("logs")
    } else {
        PathBuf::from("/var/log/email-testing-server")
    }
}

/// `~/.email-testing-server/logs`, used when the system directory is not writable.
pub fn home_log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".email-testing-server").join("logs"))
}

/// First candidate that exists or can be created.
pub fn prepare_log_dir(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .find(|dir| fs::create_dir_all(dir).is_ok())
}

/// Daily-rotated `email-server.*.log` files, at most [`MAX_LOG_FILES`] kept.
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
}

/// Installs JSON logging to stdout and, when a log directory is usable, to
/// rotating files. `preferred` is tried before the platform defaults.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(preferred: Option<PathBuf>) -> Option<WorkerGuard> {
    let candidates = preferred
        .into_iter()
        .chain([system_log_dir()])
        .chain(home_log_dir());

    let (file_layer, guard) = match prepare_log_dir(candidates).map(|dir| file_appender(&dir)) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .with(file_layer)
        .init();
    guard
}
