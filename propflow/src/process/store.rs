use super::error::Result;
use crate::core::{LongRunningProcessRecord, ProcessStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// A status change applied to a stored record only if it is still in
/// `from`.
///
/// Fields left `None` keep their stored value. The cancel flag is never
/// touched by a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessTransition {
    pub from: ProcessStatus,
    pub to: ProcessStatus,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error: Option<String>,
    pub progress: Option<f64>,
}

impl ProcessTransition {
    pub fn new(from: ProcessStatus, to: ProcessStatus) -> Self {
        Self {
            from,
            to,
            start_time: None,
            end_time: None,
            error: None,
            progress: None,
        }
    }
}

/// Durable storage for long-running-process records.
///
/// Stores hold records and nothing else: which transitions happen is
/// decided by [`super::LongRunningProcessTracker`]. Every write is
/// conditional on the stored state, so concurrent callers cannot undo each
/// other's changes. Records are never removed except through
/// [`ProcessStore::delete`].
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Inserts a new record. Fails if a record with the same id exists.
    async fn insert(&self, record: &LongRunningProcessRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>>;

    /// Applies `transition` and returns the updated record.
    ///
    /// # Errors
    /// - `ProcessError::NotFound` if no record has this id
    /// - `ProcessError::InvalidTransition` if the stored status is not
    ///   `transition.from`
    async fn transition(
        &self,
        id: Uuid,
        transition: &ProcessTransition,
    ) -> Result<LongRunningProcessRecord>;

    /// Sets the cancel flag on a record that has not finished.
    ///
    /// Returns the updated record, or `None` if the flag was already set.
    ///
    /// # Errors
    /// - `ProcessError::NotFound` if no record has this id
    /// - `ProcessError::InvalidTransition` if the record has finished
    async fn set_canceled(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>>;

    /// Writes progress on a `RUNNING` record, leaving every other field as
    /// stored.
    ///
    /// Returns the updated record, or `None` if the record is not running.
    ///
    /// # Errors
    /// Returns `ProcessError::NotFound` if no record has this id.
    async fn update_progress(
        &self,
        id: Uuid,
        progress: f64,
        message: Option<&str>,
    ) -> Result<Option<LongRunningProcessRecord>>;

    /// Removes a record, returning it if it existed.
    async fn delete(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>>;

    /// Records owned by `user_id`, oldest first.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<LongRunningProcessRecord>>;
}
