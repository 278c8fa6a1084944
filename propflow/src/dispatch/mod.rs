//! Dispatching property changes to worker plugins.
//!
//! A [`DispatchRunner`] consumes the graph property queue. For each message
//! it resolves the element, picks the properties the message covers and
//! offers every `(element, property)` pair to every registered
//! [`PropertyWorker`]. Workers that accept a pair get a job on their own
//! [`WorkerWrapper`], which contains their failures and tracks metrics.
//!
//! ```text
//! queue ──▶ consumer ──▶ DispatchRunner::process ──▶ WorkerWrapper ──▶ PropertyWorker
//!                                                 └─▶ WorkerWrapper ──▶ PropertyWorker
//! ```

mod error;
mod metrics;
mod publisher;
mod runner;
mod worker;
mod wrapper;

pub use error::{DispatchError, Result};
pub use metrics::{ProcessingTimer, TimerSnapshot, WorkerMetrics, WorkerStatus};
pub use publisher::PropertyChangePublisher;
pub use runner::{DispatchRunner, DispatchRunnerBuilder, RunnerHandle};
pub use worker::{PrepareContext, PropertyWorker, WorkData, WorkerError};
pub use wrapper::{JobOutcome, JobTicket, WorkerWrapper};
