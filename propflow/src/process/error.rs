use crate::core::{CoreError, ProcessStatus};
use crate::queue::QueueError;
use thiserror::Error;
use uuid::Uuid;

/// Error type for long-running-process tracking.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// No record with this id exists.
    #[error("long-running process not found: {0}")]
    NotFound(Uuid),

    /// The operation is not allowed in the record's current state.
    #[error("cannot {operation} long-running process {id} in state {status}")]
    InvalidTransition {
        id: Uuid,
        status: ProcessStatus,
        operation: &'static str,
    },

    /// Progress reports must be finite numbers.
    #[error("invalid progress value: {0}")]
    InvalidProgress(f64),

    /// The record store failed.
    #[error("process store error: {0}")]
    Store(String),

    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    /// The long-running-process queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A record or payload could not be (de)serialized.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
