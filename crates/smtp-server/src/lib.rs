//! Local SMTP sink: accepts mail from any client on a loopback port and keeps
//! the most recent messages in memory for inspection.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod port;
pub mod session;
pub mod supervisor;
pub mod tls;

pub use config::{ServerConfig, ServerSnapshot};
pub use error::{CertificateError, ServerError, SessionError};
pub use mailbox::{Envelope, Message, MessageId, MessageStore, StoreError};
pub use supervisor::EmailServer;
