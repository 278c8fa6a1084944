use crate::core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Error type for queue backends.
///
/// Any of these surfacing from a poll is treated by the runners as a
/// transport failure rather than a problem with a single message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A stored row could not be decoded.
    #[error("invalid stored message: {0}")]
    InvalidRow(String),

    /// The message is not in flight (never delivered, or already acked).
    #[error("message not in flight: {0}")]
    MessageNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, QueueError>;
