use crate::core::{CoreError, ElementKind};
use crate::graph::GraphError;
use crate::queue::QueueError;
use thiserror::Error;

/// Error type for dispatching property changes to workers.
///
/// Every variant aborts the message being dispatched. Errors raised by a
/// worker's `execute` never appear here; the execution wrapper absorbs them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The message was malformed or could not be decoded.
    #[error("invalid message: {0}")]
    Core(#[from] CoreError),

    /// The element named by the message could not be resolved.
    #[error("{kind} {id} could not be resolved")]
    ElementNotFound { kind: ElementKind, id: String },

    /// The graph store failed during resolution or flush.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// The queue transport failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A job was submitted to, or dropped by, a stopped worker.
    #[error("worker {0} is stopped")]
    WorkerStopped(String),

    /// A worker's `prepare` failed while building the runner.
    #[error("worker {worker} failed to prepare: {reason}")]
    Prepare { worker: String, reason: String },

    /// A consumer task panicked or was aborted.
    #[error("consumer task failed: {0}")]
    ConsumerFailed(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
