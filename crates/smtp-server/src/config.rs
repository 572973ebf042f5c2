use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1025;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one server instance. Fixed once the server has started;
/// changing them means building a new server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Name announced in the greeting and EHLO reply.
    pub hostname: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub use_tls: bool,
    pub cert_dir: PathBuf,
    pub max_messages: usize,
    pub max_message_size: usize,
    #[serde(skip)]
    pub health_check_interval: Duration,
    #[serde(skip)]
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            hostname: "localhost".to_string(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
            cert_dir: PathBuf::from("certs"),
            max_messages: mailbox::DEFAULT_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Reads `SMTP_*` variables, falling back to defaults for anything unset or invalid.
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: std::env::var("SMTP_HOST").unwrap_or(defaults.host),
            port: env_parse("SMTP_PORT", defaults.port),
            hostname: std::env::var("SMTP_HOSTNAME").unwrap_or(defaults.hostname),
            username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
            use_tls: std::env::var("SMTP_TLS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.use_tls),
            cert_dir: std::env::var("SMTP_CERT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cert_dir),
            max_messages: env_parse("SMTP_MAX_MESSAGES", defaults.max_messages),
            max_message_size: env_parse("SMTP_MAX_MESSAGE_SIZE", defaults.max_message_size),
            ..defaults
        }
    }

    /// Authentication is enforced only when both credentials are set.
    pub fn auth_required(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join("cert.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join("key.pem")
    }
}

/// What `get_config()` reports back to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    /// Effective settings; `port` is the one actually bound.
    #[serde(flatten)]
    pub config: ServerConfig,
    pub requested_port: u16,
    pub auth_enabled: bool,
    pub connection_count: u64,
    pub running: bool,
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, value);
            default
        }),
        Err(_) => default,
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
