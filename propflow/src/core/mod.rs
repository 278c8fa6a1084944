//! Core types and utilities for the propflow pipeline.
//!
//! # Domain Model
//! - [`PropertyChangeMessage`]: a change to one property of an element, or the element as a whole
//! - [`Priority`]: scheduling hint carried by every queued message
//! - [`LongRunningProcessRecord`]: persisted state of a long-running process
//! - [`BroadcastMessage`]: notifications sent on the broadcast channel
//!
//! # Serialization
//! - [`serialize_value`]: Convert Rust types to JSON bytes for queues and stores
//! - [`deserialize_value`]: Convert JSON bytes back to Rust types
//!
//! # Error Handling
//! - [`CoreError`]: Core error type with proper error chains
//! - [`Result<T>`]: Type alias for Results using CoreError

mod broadcast;
mod error;
mod message;
mod process;
mod serialization;

pub use broadcast::{BroadcastMessage, BroadcastPermissions, ProcessDeleted, PropertyChanged};
pub use error::{CoreError, Result};
pub use message::{ElementKind, ElementOrPropertyStatus, Priority, PropertyChangeMessage};
pub use process::{LongRunningProcessRecord, ProcessStatus};
pub use serialization::{deserialize_value, serialize_value};
