//! Routes property-change messages to the workers that want them.

use super::error::{DispatchError, Result};
use super::publisher::PropertyChangePublisher;
use super::worker::{PrepareContext, PropertyWorker, WorkData};
use super::wrapper::{JobOutcome, WorkerWrapper};
use crate::config::PipelineConfig;
use crate::core::PropertyChangeMessage;
use crate::graph::{
    Authorizations, DefaultVisibilityTranslator, Element, GraphStore, Property, Visibility,
    VisibilityTranslator,
};
use crate::queue::{QueueError, QueueMessage, WorkQueue};
use crate::status::PipelineStatus;
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Pause after a transport error when consumers are told to keep going.
const QUEUE_FAILURE_BACKOFF: Duration = Duration::from_secs(10);

/// Builds a [`DispatchRunner`] from an explicit list of workers.
///
/// # Example
///
/// ```ignore
/// let runner = DispatchRunnerBuilder::new(graph, queue)
///     .with_config(PipelineConfig::load("propflow.toml")?)
///     .register(TextExtractor::default())
///     .register(LanguageDetector::default())
///     .build()
///     .await?;
/// let handle = runner.start();
/// ```
pub struct DispatchRunnerBuilder {
    graph: Arc<dyn GraphStore>,
    queue: Arc<dyn WorkQueue>,
    translator: Arc<dyn VisibilityTranslator>,
    config: PipelineConfig,
    workers: Vec<Box<dyn PropertyWorker>>,
}

impl DispatchRunnerBuilder {
    pub fn new(graph: Arc<dyn GraphStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            graph,
            queue,
            translator: Arc::new(DefaultVisibilityTranslator),
            config: PipelineConfig::default(),
            workers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_visibility_translator(mut self, translator: Arc<dyn VisibilityTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// Sets the queue this runner consumes.
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.config.graph_property_queue = queue_name.into();
        self
    }

    /// Sets how many consumer tasks [`DispatchRunner::start`] spawns.
    pub fn with_consumer_count(mut self, count: usize) -> Self {
        self.config.consumer_count = count.max(1);
        self
    }

    /// Sets how long an idle consumer waits before polling again.
    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.config.poll_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_authorizations(mut self, authorizations: Authorizations) -> Self {
        self.config.authorizations = authorizations.labels().to_vec();
        self
    }

    /// Adds a worker. Workers are offered pairs in registration order.
    pub fn register<W: PropertyWorker + 'static>(mut self, worker: W) -> Self {
        self.workers.push(Box::new(worker));
        self
    }

    pub fn register_boxed(mut self, worker: Box<dyn PropertyWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Prepares every worker and starts its execution loop.
    ///
    /// # Errors
    /// Returns `DispatchError::Prepare` for the first worker whose
    /// `prepare` fails. Loops already started for earlier workers are
    /// stopped again.
    pub async fn build(self) -> Result<DispatchRunner> {
        let config = Arc::new(self.config);
        let authorizations = Authorizations::new(config.authorizations.iter().cloned());
        let context = PrepareContext {
            graph: self.graph.clone(),
            queue: self.queue.clone(),
            publisher: PropertyChangePublisher::new(
                self.queue.clone(),
                config.graph_property_queue.clone(),
            ),
            authorizations: authorizations.clone(),
            user_id: config.user_id.clone(),
            config: config.clone(),
        };

        let mut wrappers: Vec<Arc<WorkerWrapper>> = Vec::with_capacity(self.workers.len());
        for mut worker in self.workers {
            if let Err(e) = worker.prepare(&context).await {
                let name = worker.name().to_string();
                for wrapper in &wrappers {
                    wrapper.stop().await;
                }
                return Err(DispatchError::Prepare {
                    worker: name,
                    reason: e.to_string(),
                });
            }
            let worker: Arc<dyn PropertyWorker> = Arc::from(worker);
            wrappers.push(Arc::new(WorkerWrapper::start(
                worker,
                config.temp_dir.clone(),
            )));
        }

        info!(
            "Dispatch runner built with {} workers on queue {}",
            wrappers.len(),
            config.graph_property_queue
        );

        Ok(DispatchRunner {
            graph: self.graph,
            queue: self.queue,
            translator: self.translator,
            wrappers,
            authorizations,
            config,
            last_processed_property_time: AtomicI64::new(0),
        })
    }
}

/// Translates property-change messages into worker invocations.
///
/// Resolution failures abort the message; worker failures do not. Between
/// the two sits [`WorkerWrapper`], which runs each worker on its own loop.
pub struct DispatchRunner {
    graph: Arc<dyn GraphStore>,
    queue: Arc<dyn WorkQueue>,
    translator: Arc<dyn VisibilityTranslator>,
    wrappers: Vec<Arc<WorkerWrapper>>,
    authorizations: Authorizations,
    config: Arc<PipelineConfig>,
    /// Epoch millis; 0 until the first property has been processed.
    last_processed_property_time: AtomicI64,
}

impl DispatchRunner {
    pub fn workers(&self) -> &[Arc<WorkerWrapper>] {
        &self.wrappers
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Epoch millis of the last property dispatched, if any.
    pub fn last_processed_property_time(&self) -> Option<i64> {
        match self.last_processed_property_time.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        }
    }

    /// Dispatches one message and waits for every job it caused.
    ///
    /// Deletion and hidden messages carrying a `before_action_timestamp`
    /// resolve the element as it was at that time, so workers still see
    /// what was removed.
    ///
    /// # Errors
    /// - `DispatchError::Core` if the message breaks its invariants
    /// - `DispatchError::ElementNotFound` if the element cannot be resolved
    /// - `DispatchError::Graph` if the store fails during resolution or flush
    /// - `DispatchError::WorkerStopped` if a worker stopped before taking its job
    pub async fn process(&self, message: &PropertyChangeMessage) -> Result<()> {
        message.validate()?;

        let mut authorizations = self.authorizations.clone();
        if let Some(workspace_id) = &message.workspace_id {
            authorizations.add(workspace_id.clone());
        }

        let element = match message.before_action_timestamp {
            Some(timestamp) if message.reads_before_action() => {
                self.graph
                    .get_element_at(
                        message.element_kind,
                        &message.element_id,
                        timestamp,
                        &authorizations,
                    )
                    .await?
            }
            _ => {
                self.graph
                    .get_element(message.element_kind, &message.element_id, &authorizations)
                    .await?
            }
        };
        let element = Arc::new(element.ok_or_else(|| DispatchError::ElementNotFound {
            kind: message.element_kind,
            id: message.element_id.clone(),
        })?);

        let properties: Vec<Property> = match message.property() {
            Some((key, name)) => match element.property(key, name) {
                Some(property) => vec![property.clone()],
                None => {
                    warn!(
                        "Could not find property {}:{} on {} {}",
                        key, name, message.element_kind, message.element_id
                    );
                    return Ok(());
                }
            },
            None => element.properties.clone(),
        };

        let workspace_ids: Vec<String> = message.workspace_id.iter().cloned().collect();
        let visibility = self
            .translator
            .to_visibility(message.visibility_source.as_deref(), &workspace_ids);

        for property in properties {
            self.dispatch_property(message, &element, property, &visibility)
                .await?;
        }
        Ok(())
    }

    async fn dispatch_property(
        &self,
        message: &PropertyChangeMessage,
        element: &Arc<Element>,
        property: Property,
        visibility: &Visibility,
    ) -> Result<()> {
        let interested: Vec<&Arc<WorkerWrapper>> = self
            .wrappers
            .iter()
            .filter(|wrapper| wrapper.is_handled(element, &property))
            .collect();

        if interested.is_empty() {
            debug!(
                "No interested workers for {} {} property {}:{}",
                element.kind, element.id, property.key, property.name
            );
            return Ok(());
        }

        let data = Arc::new(WorkData {
            element: element.clone(),
            property,
            workspace_id: message.workspace_id.clone(),
            visibility_source: message.visibility_source.clone(),
            visibility: visibility.clone(),
            priority: message.priority,
            status: message.status,
            before_action_timestamp: message.before_action_timestamp,
            trace_enabled: message.trace_enabled,
            local_file: None,
        });

        let mut tickets = Vec::with_capacity(interested.len());
        for wrapper in interested {
            tickets.push(wrapper.submit(data.clone())?);
        }

        let mut stopped = None;
        for result in join_all(tickets.into_iter().map(|ticket| ticket.outcome())).await {
            match result {
                Ok(JobOutcome::Succeeded) | Ok(JobOutcome::Failed(_)) => {}
                Err(e) => stopped = Some(e),
            }
        }

        self.graph.flush().await?;
        self.last_processed_property_time
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        match stopped {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Decodes and dispatches one delivery, then acks or fails it.
    ///
    /// Only transport errors are returned; dispatch errors are logged and
    /// turned into a `fail`.
    async fn handle_delivery(&self, delivery: QueueMessage) -> std::result::Result<(), QueueError> {
        let outcome = match PropertyChangeMessage::from_bytes(&delivery.payload) {
            Ok(message) => self.process(&message).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(()) => self.queue.ack(delivery.id).await,
            Err(e) => {
                error!(
                    "Failed to dispatch message {} (attempt {}): {}",
                    delivery.id,
                    delivery.attempts + 1,
                    e
                );
                self.queue.fail(delivery.id).await
            }
        }
    }

    async fn consume(self: Arc<Self>, consumer_id: usize, token: CancellationToken) -> Result<()> {
        let queue_name = self.config.graph_property_queue.clone();
        let backoff = self.config.poll_backoff();
        info!("Consumer {} started on queue {}", consumer_id, queue_name);

        // Cancellation is only observed between deliveries, never during a
        // poll, so a message is not left in flight by shutdown.
        while !token.is_cancelled() {
            let result = match self.queue.next_message(&queue_name).await {
                Ok(Some(delivery)) => {
                    let span = tracing::info_span!(
                        "dispatch_message",
                        consumer = consumer_id,
                        message.id = %delivery.id,
                        priority = %delivery.priority,
                    );
                    self.handle_delivery(delivery).instrument(span).await
                }
                Ok(None) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = self.queue.wait_for_work(backoff) => {}
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if self.config.exit_on_queue_failure {
                    error!("Consumer {} stopping on queue failure: {}", consumer_id, e);
                    return Err(e.into());
                }
                error!(
                    "Consumer {} queue failure, retrying in {:?}: {}",
                    consumer_id, QUEUE_FAILURE_BACKOFF, e
                );
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(QUEUE_FAILURE_BACKOFF) => {}
                }
            }
        }

        info!("Consumer {} stopped", consumer_id);
        Ok(())
    }

    /// Spawns the configured number of consumer tasks.
    pub fn start(self) -> RunnerHandle {
        let runner = Arc::new(self);
        let token = CancellationToken::new();
        let consumers = (0..runner.config.consumer_count.max(1))
            .map(|consumer_id| tokio::spawn(runner.clone().consume(consumer_id, token.child_token())))
            .collect();

        RunnerHandle {
            runner,
            token,
            consumers,
        }
    }

    /// Stops every worker loop, waiting for in-flight jobs.
    pub async fn stop_workers(&self) {
        for wrapper in &self.wrappers {
            wrapper.stop().await;
        }
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        Ok(PipelineStatus {
            queues: self.queue.queues_status().await?,
            workers: self.wrappers.iter().map(|w| w.status()).collect(),
            last_processed_property_time: self.last_processed_property_time(),
        })
    }
}

/// Handle for a running [`DispatchRunner`].
pub struct RunnerHandle {
    runner: Arc<DispatchRunner>,
    token: CancellationToken,
    consumers: Vec<JoinHandle<Result<()>>>,
}

impl RunnerHandle {
    pub fn runner(&self) -> &Arc<DispatchRunner> {
        &self.runner
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true while at least one consumer is still running.
    pub fn is_running(&self) -> bool {
        self.consumers.iter().any(|c| !c.is_finished())
    }

    /// Stops consuming, lets in-flight messages finish, then stops workers.
    ///
    /// # Errors
    /// Returns the first error a consumer stopped with, if any.
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();

        let mut first_error = None;
        for consumer in self.consumers {
            let result = match consumer.await {
                Ok(result) => result,
                Err(e) => Err(DispatchError::ConsumerFailed(e.to_string())),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        self.runner.stop_workers().await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
