use shared::domain::MessageId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("nothing to send")]
    Empty,
    #[error("attachment upload failed: {0:#}")]
    Upload(#[source] anyhow::Error),
    #[error("message submit failed: {0:#}")]
    Submit(#[source] anyhow::Error),
    #[error("client is logged out")]
    Session,
}

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("reaction submit failed: {0:#}")]
    Submit(#[source] anyhow::Error),
    #[error("client is logged out")]
    Session,
}
