use super::error::{ProcessError, Result};
use super::tracker::{LongRunningProcessTracker, ProcessQueueItem};
use crate::config::PipelineConfig;
use crate::core::{deserialize_value, LongRunningProcessRecord, ProcessStatus};
use crate::dispatch::{WorkerMetrics, WorkerStatus};
use crate::queue::{QueueError, QueueMessage, WorkQueue};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Error returned by long-running-process workers.
pub type ProcessWorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one kind of long-running process.
#[async_trait]
pub trait LongRunningProcessWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this worker handles `record`. Usually a check of
    /// `record.process_type`.
    fn is_handled(&self, record: &LongRunningProcessRecord) -> bool;

    /// Runs the process. Check [`ProcessContext::is_canceled`] at points
    /// where stopping early is safe and return `Ok(())` when it is set.
    async fn process(
        &self,
        record: &LongRunningProcessRecord,
        context: &ProcessContext,
    ) -> std::result::Result<(), ProcessWorkerError>;
}

/// What a running process can do to its own record.
pub struct ProcessContext {
    id: Uuid,
    tracker: Arc<LongRunningProcessTracker>,
    canceled: AtomicBool,
}

impl ProcessContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reports progress in `[0, 1]`. Debounced by the tracker.
    pub async fn report_progress(&self, progress: f64, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.tracker
            .report_progress(self.id, progress, Some(&message))
            .await?;
        Ok(())
    }

    /// Reads the cancel flag from the store. Once it has been seen set, it
    /// stays set for the rest of the run.
    pub async fn is_canceled(&self) -> Result<bool> {
        if self.canceled.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let canceled = self
            .tracker
            .find_by_id(self.id)
            .await?
            .map(|record| record.canceled)
            .unwrap_or(false);
        if canceled {
            self.canceled.store(true, Ordering::Relaxed);
        }
        Ok(canceled)
    }

    fn observed_cancel(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }
}

/// Status of a [`ProcessRunner`] and each of its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRunnerStatus {
    pub queue_name: String,
    pub consumer_count: usize,
    pub workers: Vec<WorkerStatus>,
}

struct RegisteredWorker {
    worker: Arc<dyn LongRunningProcessWorker>,
    metrics: Arc<WorkerMetrics>,
}

/// Consumes the long-running-process queue and drives each record through
/// the tracker.
///
/// The queue item is always acked once the record has an outcome; the
/// record, not the queue, carries success or failure.
pub struct ProcessRunner {
    tracker: Arc<LongRunningProcessTracker>,
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
    workers: Vec<RegisteredWorker>,
    poll_backoff: Duration,
    consumer_count: usize,
}

impl ProcessRunner {
    pub fn new(tracker: Arc<LongRunningProcessTracker>, queue: Arc<dyn WorkQueue>) -> Self {
        let config = PipelineConfig::default();
        Self {
            queue_name: tracker.queue_name().to_string(),
            tracker,
            queue,
            workers: Vec::new(),
            poll_backoff: config.poll_backoff(),
            consumer_count: 1,
        }
    }

    pub fn with_config(mut self, config: &PipelineConfig) -> Self {
        self.queue_name = config.long_running_process_queue.clone();
        self.poll_backoff = config.poll_backoff();
        self
    }

    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Sets how many consumer tasks [`ProcessRunner::start`] spawns. Each
    /// runs one process at a time.
    pub fn with_consumer_count(mut self, count: usize) -> Self {
        self.consumer_count = count.max(1);
        self
    }

    /// Adds a worker. The first registered worker that handles a record
    /// gets it.
    pub fn register<W: LongRunningProcessWorker + 'static>(mut self, worker: W) -> Self {
        self.workers.push(RegisteredWorker {
            worker: Arc::new(worker),
            metrics: Arc::new(WorkerMetrics::new()),
        });
        self
    }

    pub fn tracker(&self) -> &Arc<LongRunningProcessTracker> {
        &self.tracker
    }

    pub fn status(&self) -> ProcessRunnerStatus {
        ProcessRunnerStatus {
            queue_name: self.queue_name.clone(),
            consumer_count: self.consumer_count,
            workers: self
                .workers
                .iter()
                .map(|w| w.metrics.snapshot(w.worker.name()))
                .collect(),
        }
    }

    /// Runs one queue item to completion.
    ///
    /// Errors from the worker end up on the record. Only store and queue
    /// failures are returned.
    pub async fn run_item(&self, id: Uuid) -> Result<()> {
        let record = match self.tracker.find_by_id(id).await? {
            Some(record) => record,
            None => {
                warn!("Long-running process {} no longer exists, skipping", id);
                return Ok(());
            }
        };
        if record.is_finished() {
            warn!(
                "Long-running process {} is already {}, skipping",
                id, record.status
            );
            return Ok(());
        }

        let Some(registered) = self.workers.iter().find(|w| w.worker.is_handled(&record)) else {
            // nak needs a RUNNING record
            if record.status == ProcessStatus::Queued {
                self.tracker.begin_work(id).await?;
            }
            self.tracker
                .nak(
                    id,
                    &format!("no worker handles process type {}", record.process_type),
                )
                .await?;
            return Ok(());
        };

        let record = self.tracker.begin_work(id).await?;
        if record.canceled {
            self.tracker.mark_canceled(id).await?;
            return Ok(());
        }

        let context = ProcessContext {
            id,
            tracker: self.tracker.clone(),
            canceled: AtomicBool::new(false),
        };

        let worker = &registered.worker;
        info!("Worker {} processing {}", worker.name(), id);
        registered.metrics.job_started();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(worker.process(&record, &context))
            .catch_unwind()
            .await;
        registered
            .metrics
            .job_finished(started.elapsed(), matches!(outcome, Ok(Ok(()))));

        match outcome {
            Ok(Ok(())) if context.observed_cancel() => {
                self.tracker.mark_canceled(id).await?;
            }
            Ok(Ok(())) => {
                self.tracker.ack(id).await?;
            }
            Ok(Err(e)) => {
                self.tracker.nak(id, &e.to_string()).await?;
            }
            Err(_) => {
                self.tracker
                    .nak(id, &format!("worker {} panicked", worker.name()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_delivery(&self, delivery: QueueMessage) -> std::result::Result<(), QueueError> {
        let result = match deserialize_value::<ProcessQueueItem>(&delivery.payload) {
            Ok(item) => self.run_item(item.id).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => self.queue.ack(delivery.id).await,
            Err(ProcessError::Queue(e)) => Err(e),
            Err(e) => {
                error!("Failed to run queue item {}: {}", delivery.id, e);
                self.queue.fail(delivery.id).await
            }
        }
    }

    async fn consume(self: Arc<Self>, consumer_id: usize, token: CancellationToken) -> Result<()> {
        info!(
            "Process consumer {} started on queue {}",
            consumer_id, self.queue_name
        );
        while !token.is_cancelled() {
            match self.queue.next_message(&self.queue_name).await? {
                Some(delivery) => {
                    let span = tracing::info_span!(
                        "process_item",
                        consumer = consumer_id,
                        message.id = %delivery.id,
                    );
                    self.handle_delivery(delivery).instrument(span).await?;
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = self.queue.wait_for_work(self.poll_backoff) => {}
                    }
                }
            }
        }
        info!("Process consumer {} stopped", consumer_id);
        Ok(())
    }

    /// Spawns the configured number of consumer tasks.
    pub fn start(self) -> ProcessRunnerHandle {
        let runner = Arc::new(self);
        let token = CancellationToken::new();
        let consumers = (0..runner.consumer_count)
            .map(|consumer_id| tokio::spawn(runner.clone().consume(consumer_id, token.child_token())))
            .collect();
        ProcessRunnerHandle {
            runner,
            token,
            consumers,
        }
    }
}

/// Handle for a running [`ProcessRunner`].
pub struct ProcessRunnerHandle {
    runner: Arc<ProcessRunner>,
    token: CancellationToken,
    consumers: Vec<JoinHandle<Result<()>>>,
}

impl ProcessRunnerHandle {
    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.runner
    }

    /// Returns true while at least one consumer is still running.
    pub fn is_running(&self) -> bool {
        self.consumers.iter().any(|c| !c.is_finished())
    }

    /// Stops after the items being run, if any, have finished.
    ///
    /// # Errors
    /// Returns the first error a consumer stopped with, if any.
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();

        let mut first_error = None;
        for consumer in self.consumers {
            let result = match consumer.await {
                Ok(result) => result,
                Err(e) => Err(ProcessError::Store(format!("process runner task failed: {}", e))),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
