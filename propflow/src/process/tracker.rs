use super::error::{ProcessError, Result};
use super::store::{ProcessStore, ProcessTransition};
use crate::config::PipelineConfig;
use crate::core::{
    serialize_value, BroadcastMessage, LongRunningProcessRecord, Priority, ProcessStatus,
};
use crate::queue::WorkQueue;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default minimum progress advance between broadcasts.
pub const DEFAULT_PROGRESS_FLUSH_THRESHOLD: f64 = 0.01;

/// Body of a long-running-process queue item. The record itself lives in
/// the [`ProcessStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessQueueItem {
    pub id: Uuid,
}

/// Tracks long-running processes through their lifecycle.
///
/// ```text
/// QUEUED ──begin_work──▶ RUNNING ──ack──▶ SUCCEEDED
///                           │    ──nak──▶ FAILED
///                           └─(cancel)── mark_canceled ──▶ CANCELED
/// ```
///
/// Every state change is written to the store first and broadcast after.
/// Terminal records only change by being deleted.
pub struct LongRunningProcessTracker {
    store: Arc<dyn ProcessStore>,
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
    flush_threshold: f64,
    /// Progress last broadcast per running process.
    last_flushed: DashMap<Uuid, f64>,
}

impl LongRunningProcessTracker {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn WorkQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.into(),
            flush_threshold: DEFAULT_PROGRESS_FLUSH_THRESHOLD,
            last_flushed: DashMap::new(),
        }
    }

    /// Creates a tracker on the configured queue and flush threshold.
    pub fn from_config(
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn WorkQueue>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(store, queue, config.long_running_process_queue.clone())
            .with_flush_threshold(config.progress_flush_threshold)
    }

    /// Sets the minimum progress advance before a report is broadcast.
    pub fn with_flush_threshold(mut self, threshold: f64) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.store
    }

    /// Persists a new `QUEUED` record and queues it for a worker.
    ///
    /// The record is stored before the queue item is pushed, so it exists
    /// even if no consumer is running.
    pub async fn enqueue(
        &self,
        process_type: &str,
        payload: serde_json::Value,
        user_id: &str,
    ) -> Result<Uuid> {
        let record = LongRunningProcessRecord::new(process_type, payload, user_id);
        self.store.insert(&record).await?;

        let item = serialize_value(&ProcessQueueItem { id: record.id })?;
        self.queue
            .push(&self.queue_name, item, Priority::Normal)
            .await?;

        info!(
            "Enqueued long-running process {} of type {} for {}",
            record.id, record.process_type, record.user_id
        );
        self.publish(&record).await;
        Ok(record.id)
    }

    /// `QUEUED -> RUNNING`.
    ///
    /// # Errors
    /// - `ProcessError::NotFound` if the record is missing (also logged)
    /// - `ProcessError::InvalidTransition` if the record is not `QUEUED`
    pub async fn begin_work(&self, id: Uuid) -> Result<LongRunningProcessRecord> {
        let mut start = ProcessTransition::new(ProcessStatus::Queued, ProcessStatus::Running);
        start.start_time = Some(Utc::now().timestamp_millis());
        let record = match self.store.transition(id, &start).await {
            Ok(record) => record,
            Err(ProcessError::NotFound(_)) => {
                warn!("Cannot begin work on missing long-running process {}", id);
                return Err(ProcessError::NotFound(id));
            }
            Err(e) => return Err(Self::during("begin work on", e)),
        };
        self.last_flushed.insert(id, 0.0);

        debug!("Long-running process {} is running", id);
        self.publish(&record).await;
        Ok(record)
    }

    /// Records progress on a `RUNNING` process.
    ///
    /// Reports that advanced less than the flush threshold since the last
    /// broadcast are coalesced and not written. A report reaching 1.0 is
    /// always written. Returns whether this report was written and
    /// broadcast. Reports on records that are not running are ignored.
    ///
    /// # Errors
    /// Returns `ProcessError::InvalidProgress` for NaN or infinite values.
    pub async fn report_progress(
        &self,
        id: Uuid,
        progress: f64,
        message: Option<&str>,
    ) -> Result<bool> {
        if !progress.is_finite() {
            return Err(ProcessError::InvalidProgress(progress));
        }
        let progress = progress.clamp(0.0, 1.0);
        let last = self.last_flushed.get(&id).map(|p| *p).unwrap_or(0.0);
        if progress < 1.0 && progress - last < self.flush_threshold {
            return Ok(false);
        }

        let Some(record) = self.store.update_progress(id, progress, message).await? else {
            debug!("Ignoring progress for long-running process {} that is not running", id);
            return Ok(false);
        };
        self.last_flushed.insert(id, progress);

        self.publish(&record).await;
        Ok(true)
    }

    /// `RUNNING -> SUCCEEDED`.
    pub async fn ack(&self, id: Uuid) -> Result<LongRunningProcessRecord> {
        self.finish(id, ProcessStatus::Succeeded, None, "ack").await
    }

    /// `RUNNING -> FAILED`, keeping `error` on the record.
    pub async fn nak(&self, id: Uuid, error: &str) -> Result<LongRunningProcessRecord> {
        self.finish(id, ProcessStatus::Failed, Some(error.to_string()), "nak")
            .await
    }

    /// Flags the process as canceled without changing its state.
    ///
    /// The worker running it is expected to notice and stop; see
    /// [`LongRunningProcessTracker::mark_canceled`]. Canceling twice is a
    /// no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<LongRunningProcessRecord> {
        match self
            .store
            .set_canceled(id)
            .await
            .map_err(|e| Self::during("cancel", e))?
        {
            Some(record) => {
                info!("Cancel requested for long-running process {}", id);
                self.publish(&record).await;
                Ok(record)
            }
            None => self.load(id).await,
        }
    }

    /// `RUNNING -> CANCELED` for a process whose cancel flag is set.
    pub async fn mark_canceled(&self, id: Uuid) -> Result<LongRunningProcessRecord> {
        // the flag is never cleared, so checking it first cannot race
        let record = self.load(id).await?;
        if !record.canceled {
            return Err(Self::invalid(&record, "mark canceled"));
        }
        self.finish(id, ProcessStatus::Canceled, None, "mark canceled")
            .await
    }

    /// Removes the record and broadcasts the deletion.
    pub async fn delete(&self, id: Uuid) -> Result<LongRunningProcessRecord> {
        let record = self
            .store
            .delete(id)
            .await?
            .ok_or(ProcessError::NotFound(id))?;
        self.last_flushed.remove(&id);

        info!("Deleted long-running process {}", id);
        match BroadcastMessage::process_deleted(id, &record.user_id).to_bytes() {
            Ok(payload) => self.send(payload).await,
            Err(e) => warn!("Could not encode deletion of {}: {}", id, e),
        }
        Ok(record)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        self.store.get(id).await
    }

    /// All records owned by `user_id`, oldest first.
    pub async fn get_all(&self, user_id: &str) -> Result<Vec<LongRunningProcessRecord>> {
        self.store.list_by_user(user_id).await
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ProcessStatus,
        error: Option<String>,
        operation: &'static str,
    ) -> Result<LongRunningProcessRecord> {
        let mut change = ProcessTransition::new(ProcessStatus::Running, status);
        change.end_time = Some(Utc::now().timestamp_millis());
        change.error = error;
        if status == ProcessStatus::Succeeded {
            change.progress = Some(1.0);
        }
        let record = self
            .store
            .transition(id, &change)
            .await
            .map_err(|e| Self::during(operation, e))?;
        self.last_flushed.remove(&id);

        match &record.error {
            Some(e) => warn!("Long-running process {} failed: {}", id, e),
            None => info!("Long-running process {} finished as {}", id, status),
        }
        self.publish(&record).await;
        Ok(record)
    }

    async fn load(&self, id: Uuid) -> Result<LongRunningProcessRecord> {
        self.store.get(id).await?.ok_or(ProcessError::NotFound(id))
    }

    fn invalid(record: &LongRunningProcessRecord, operation: &'static str) -> ProcessError {
        ProcessError::InvalidTransition {
            id: record.id,
            status: record.status,
            operation,
        }
    }

    /// Names the tracker operation in a rejected store write.
    fn during(operation: &'static str, error: ProcessError) -> ProcessError {
        match error {
            ProcessError::InvalidTransition { id, status, .. } => ProcessError::InvalidTransition {
                id,
                status,
                operation,
            },
            other => other,
        }
    }

    /// Broadcasts are best effort: a failure is logged and the state change
    /// stands.
    async fn publish(&self, record: &LongRunningProcessRecord) {
        match BroadcastMessage::process_changed(record).to_bytes() {
            Ok(payload) => self.send(payload).await,
            Err(e) => warn!("Could not encode change of {}: {}", record.id, e),
        }
    }

    async fn send(&self, payload: Vec<u8>) {
        if let Err(e) = self.queue.broadcast(payload).await {
            warn!("Broadcast failed: {}", e);
        }
    }
}
