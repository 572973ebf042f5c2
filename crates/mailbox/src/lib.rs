//! In-memory mailbox for captured SMTP messages.
//!
//! `models` holds the message types, `services` the content extractor and the
//! bounded store that the SMTP sessions write into.

pub mod models;
pub mod services;

pub use models::message::{Envelope, Message, MessageId, NewMessage};
pub use services::error::{ExtractError, StoreError};
pub use services::extract::{extract_content, parse_message, Content, BODY_ERROR};
pub use services::store::{MessageStore, DEFAULT_CAPACITY};
