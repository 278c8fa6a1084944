//! Supervised execution loop for one registered worker.

use super::error::{DispatchError, Result};
use super::metrics::{WorkerMetrics, WorkerStatus};
use super::worker::{PropertyWorker, WorkData};
use crate::graph::{Element, Property};
use futures::FutureExt;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// How a submitted job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// `execute` returned an error or panicked. The wrapper has already
    /// logged it and counted it.
    Failed(String),
}

struct Job {
    data: Arc<WorkData>,
    done: oneshot::Sender<JobOutcome>,
}

/// Receives the outcome of one submitted job.
///
/// Resolves to [`DispatchError::WorkerStopped`] when the worker stopped
/// before taking the job.
pub struct JobTicket {
    worker: String,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub async fn outcome(self) -> Result<JobOutcome> {
        self.rx
            .await
            .map_err(|_| DispatchError::WorkerStopped(self.worker))
    }
}

/// Runs one worker on its own task with its own FIFO job queue.
///
/// A slow or blocked worker only backs up its own queue. Errors and panics
/// from `execute` are logged and counted here and never reach the
/// dispatcher or other workers.
///
/// [`WorkerWrapper::stop`] is cooperative: the loop checks the flag between
/// jobs, so a job already running always completes. Jobs still queued at
/// that point are dropped and their tickets resolve to
/// [`DispatchError::WorkerStopped`].
pub struct WorkerWrapper {
    name: String,
    worker: Arc<dyn PropertyWorker>,
    jobs: mpsc::UnboundedSender<Job>,
    metrics: Arc<WorkerMetrics>,
    stop_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerWrapper {
    /// Spawns the execution loop for `worker`.
    ///
    /// Local files are created in `temp_dir`, or the OS temp dir when `None`.
    pub fn start(worker: Arc<dyn PropertyWorker>, temp_dir: Option<PathBuf>) -> Self {
        let name = worker.name().to_string();
        let (jobs, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(WorkerMetrics::new());
        let stop_token = CancellationToken::new();

        let execution = ExecutionLoop {
            name: name.clone(),
            worker: worker.clone(),
            metrics: metrics.clone(),
            temp_dir: temp_dir.unwrap_or_else(std::env::temp_dir),
        };
        let handle = tokio::spawn(execution.run(rx, stop_token.clone()));

        info!("Started worker: {}", name);

        Self {
            name,
            worker,
            jobs,
            metrics,
            stop_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the wrapped worker whether it wants this pair.
    ///
    /// A worker that panics here is treated as not handling the pair.
    pub fn is_handled(&self, element: &Element, property: &Property) -> bool {
        match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.worker.is_handled(element, property)
        })) {
            Ok(handled) => handled,
            Err(_) => {
                error!(
                    "Worker {} panicked in is_handled for {} {} property {}:{}",
                    self.name, element.kind, element.id, property.key, property.name
                );
                false
            }
        }
    }

    /// Appends a job to this worker's queue.
    ///
    /// # Errors
    /// Returns `DispatchError::WorkerStopped` once [`WorkerWrapper::stop`]
    /// has been called.
    pub fn submit(&self, data: Arc<WorkData>) -> Result<JobTicket> {
        if self.stop_token.is_cancelled() {
            return Err(DispatchError::WorkerStopped(self.name.clone()));
        }
        let (done, rx) = oneshot::channel();
        self.jobs
            .send(Job { data, done })
            .map_err(|_| DispatchError::WorkerStopped(self.name.clone()))?;
        Ok(JobTicket {
            worker: self.name.clone(),
            rx,
        })
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    pub fn status(&self) -> WorkerStatus {
        self.metrics.snapshot(&self.name)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Stops taking jobs and waits for the in-flight job, if any, to finish.
    pub async fn stop(&self) {
        self.stop_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Worker {} loop ended abnormally: {}", self.name, e);
            }
        }
    }
}

struct ExecutionLoop {
    name: String,
    worker: Arc<dyn PropertyWorker>,
    metrics: Arc<WorkerMetrics>,
    temp_dir: PathBuf,
}

impl ExecutionLoop {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>, stop_token: CancellationToken) {
        loop {
            // biased: a stop request wins over queued jobs
            let job = tokio::select! {
                biased;
                _ = stop_token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let span = tracing::debug_span!(
                "worker_job",
                worker = %self.name,
                element.id = %job.data.element.id,
                property.key = %job.data.property.key,
                property.name = %job.data.property.name,
            );
            let outcome = self.execute(&job.data).instrument(span).await;
            // the dispatcher may have given up waiting
            let _ = job.done.send(outcome);
        }

        let dropped = {
            rx.close();
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            count
        };
        info!("Worker {} stopped ({} queued jobs dropped)", self.name, dropped);
    }

    async fn execute(&self, data: &Arc<WorkData>) -> JobOutcome {
        self.metrics.job_started();
        let started = Instant::now();

        let outcome = if self.worker.is_local_file_required() {
            match self.materialize(data).await {
                // temp file lives until the end of this arm, on every path
                Ok(local) => {
                    let mut with_file = WorkData::clone(data);
                    with_file.local_file = Some(local.path().to_path_buf());
                    self.call_worker(&with_file).await
                }
                Err(e) => JobOutcome::Failed(format!("could not create local file: {}", e)),
            }
        } else {
            self.call_worker(data).await
        };

        let elapsed = started.elapsed();
        self.metrics
            .job_finished(elapsed, outcome == JobOutcome::Succeeded);

        match &outcome {
            JobOutcome::Succeeded => debug!(
                "Worker {} processed {} {} in {:?}",
                self.name, data.element.id, data.property.name, elapsed
            ),
            JobOutcome::Failed(reason) => error!(
                "Worker {} failed on {} property {}:{}: {}",
                self.name, data.element.id, data.property.key, data.property.name, reason
            ),
        }
        outcome
    }

    async fn call_worker(&self, data: &WorkData) -> JobOutcome {
        match AssertUnwindSafe(self.worker.execute(data))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                JobOutcome::Failed(format!("worker panicked: {}", message))
            }
        }
    }

    async fn materialize(&self, data: &WorkData) -> std::io::Result<NamedTempFile> {
        let bytes = data.property.value.to_bytes();
        let dir = self.temp_dir.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix("propflow-")
                .tempfile_in(dir)?;
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}
