use std::path::PathBuf;
use thiserror::Error;

/// Lifecycle errors surfaced by `start()` / `stop()`.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("No available port in {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },
    #[error("TLS certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Server is already running")]
    AlreadyRunning,
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificate found in {}", .0.display())]
    MissingCertificate(PathBuf),
    #[error("No private key found in {}", .0.display())]
    MissingKey(PathBuf),
    #[error("Invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Connection-level failures. Logged by the accept loop; they only ever
/// discard the session that raised them.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Client idle for too long")]
    Timeout,
    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("Connection closed during DATA, transaction aborted")]
    TransactionAborted,
}
