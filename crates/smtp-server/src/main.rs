use smtp_server::{logging, EmailServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file. Ignore error if it's not present, as env vars can be set directly.
    dotenvy::dotenv().ok();
    // JSON to stdout, plus rotating files; the guard flushes them on exit.
    let log_guard = logging::init(std::env::var_os("SMTP_LOG_DIR").map(PathBuf::from));
    if log_guard.is_none() {
        warn!("No writable log directory, logging to stdout only");
    }

    let mut server = EmailServer::new(ServerConfig::from_env());
    let port = match server.start().await {
        Ok(port) => port,
        Err(e) => {
            error!("Failed to start SMTP server: {}", e);
            return Err(e.into());
        }
    };

    let snapshot = server.get_config();
    info!(
        port,
        config = %serde_json::to_string(&snapshot)?,
        "SMTP server ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await?;

    let captured = server.list_messages().len();
    info!("Discarding {} captured message(s)", captured);
    Ok(())
}
