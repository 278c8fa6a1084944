//! Long-running process tracking.
//!
//! A long-running process is a background job (an import, a bulk export)
//! whose state outlives the request that started it. The
//! [`LongRunningProcessTracker`] owns the state machine and persists every
//! change through a [`ProcessStore`]; subscribers follow along on the
//! queue's broadcast channel. A [`ProcessRunner`] consumes the
//! long-running-process queue and hands records to registered
//! [`LongRunningProcessWorker`]s.
//!
//! # Example
//!
//! ```ignore
//! let tracker = Arc::new(LongRunningProcessTracker::new(store, queue.clone(), "longRunningProcess"));
//! let id = tracker.enqueue("import", json!({"file": "people.csv"}), "alice").await?;
//!
//! let handle = ProcessRunner::new(tracker.clone(), queue)
//!     .register(CsvImporter)
//!     .start();
//! ```

mod error;
mod memory;
mod runner;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;
mod tracker;

pub use error::{ProcessError, Result};
pub use memory::InMemoryProcessStore;
pub use runner::{
    LongRunningProcessWorker, ProcessContext, ProcessRunner, ProcessRunnerHandle,
    ProcessRunnerStatus, ProcessWorkerError,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProcessStore;
pub use store::{ProcessStore, ProcessTransition};
pub use tracker::{LongRunningProcessTracker, ProcessQueueItem, DEFAULT_PROGRESS_FLUSH_THRESHOLD};
