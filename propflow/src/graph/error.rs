//! Error types for property graph access
//!
//! The graph store is an external collaborator. These errors describe how a
//! call into it failed without exposing the store's own error types.

use crate::core::ElementKind;
use thiserror::Error;

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur while reading or writing the property graph
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum GraphError {
    /// The element does not exist or is not visible with the given authorizations
    #[error("{kind} not found: {id}")]
    ElementNotFound {
        /// Vertex or edge
        kind: ElementKind,
        /// The element id that was looked up
        id: String,
    },

    /// The store could not complete the operation
    #[error("graph store failure: {reason}")]
    Store {
        /// Store-specific description of the failure
        reason: String,
    },
}

impl GraphError {
    /// Creates an element not found error
    pub fn element_not_found(kind: ElementKind, id: impl Into<String>) -> Self {
        Self::ElementNotFound { kind, id: id.into() }
    }

    /// Creates a store failure error
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }
}
