use thiserror::Error;

/// Core error type for the propflow pipeline.
///
/// Covers the wire-level model: encoding and decoding of messages and
/// records, and validation of message invariants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value to bytes.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding bytes to a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// A message violated one of its structural invariants.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// An invalid process status string was encountered during parsing.
    #[error("invalid process status: {0}")]
    InvalidStatus(String),

    /// An invalid priority string was encountered during parsing.
    #[error("invalid priority: {0}")]
    InvalidPriority(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
