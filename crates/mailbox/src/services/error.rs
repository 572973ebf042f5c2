use crate::models::message::MessageId;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Message {0} not found")]
    NotFound(MessageId),
}

/// Failures while turning raw message bytes into displayable content.
/// These never leave the extractor; they degrade to the error body.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Message could not be parsed")]
    Unparseable,

    #[error("Message has no readable body")]
    NoBody,

    #[error("Body part is not valid text")]
    Undecodable,

    #[error("HTML conversion failed: {0}")]
    Html(#[from] html2text::Error),
}
