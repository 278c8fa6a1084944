//! End-to-end tests for the property dispatch pipeline
//!
//! These tests verify that:
//! 1. Element-level messages offer every property to every worker
//! 2. Single-property messages reach exactly the interested workers
//! 3. Resolution failures abort the message before any worker runs
//! 4. Worker failures stay inside their own wrapper
//! 5. The consumer loop acks, retries and dead-letters deliveries
//! 6. Deletion messages see the element as it was before the change

use async_trait::async_trait;
use propflow::prelude::*;
use propflow::queue::dead_letter_queue;
use propflow::{JobOutcome, PipelineStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Counts how often it is asked and how often it runs.
#[derive(Clone, Default)]
struct CountingWorker {
    name: &'static str,
    only: Option<&'static str>,
    asked: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl CountingWorker {
    fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn only(mut self, property_name: &'static str) -> Self {
        self.only = Some(property_name);
        self
    }
}

#[async_trait]
impl PropertyWorker for CountingWorker {
    fn name(&self) -> &str {
        self.name
    }

    fn is_handled(&self, _element: &Element, property: &Property) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.only.map_or(true, |name| property.name == name)
    }

    async fn execute(&self, data: &WorkData) -> Result<(), WorkerError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(data.property.name.clone());
        Ok(())
    }
}

struct BrokenWorker;

#[async_trait]
impl PropertyWorker for BrokenWorker {
    fn name(&self) -> &str {
        "broken"
    }

    fn is_handled(&self, _: &Element, _: &Property) -> bool {
        true
    }

    async fn execute(&self, data: &WorkData) -> Result<(), WorkerError> {
        if data.property.name == "p0" {
            panic!("cannot handle {}", data.property.name);
        }
        Err(format!("cannot handle {}", data.property.name).into())
    }
}

fn document(id: &str, property_count: usize) -> Element {
    (0..property_count).fold(Element::vertex(id), |element, i| {
        element.with_property(Property::new(
            "ingest",
            format!("p{}", i),
            PropertyValue::Text(format!("value {}", i)),
        ))
    })
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_element_message_offers_every_property() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 11));
    let worker = CountingWorker::named("counter");

    let runner = DispatchRunnerBuilder::new(graph.clone(), Arc::new(InMemoryWorkQueue::new()))
        .register(worker.clone())
        .build()
        .await
        .unwrap();

    let message = PropertyChangeMessage::for_element(ElementKind::Vertex, "doc1", Priority::Normal);
    runner.process(&message).await.unwrap();

    assert_eq!(worker.asked.load(Ordering::SeqCst), 11);
    assert_eq!(worker.executed.load(Ordering::SeqCst), 11);
    assert_eq!(graph.flush_count(), 11);
    runner.stop_workers().await;
}

#[tokio::test]
async fn test_every_worker_sees_every_property() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 4));
    let workers: Vec<CountingWorker> = ["a", "b", "c"]
        .into_iter()
        .map(CountingWorker::named)
        .collect();

    let runner = workers
        .iter()
        .fold(
            DispatchRunnerBuilder::new(graph, Arc::new(InMemoryWorkQueue::new())),
            |builder, worker| builder.register(worker.clone()),
        )
        .build()
        .await
        .unwrap();

    runner
        .process(&PropertyChangeMessage::for_element(
            ElementKind::Vertex,
            "doc1",
            Priority::Low,
        ))
        .await
        .unwrap();

    for worker in &workers {
        assert_eq!(worker.asked.load(Ordering::SeqCst), 4);
        assert_eq!(worker.executed.load(Ordering::SeqCst), 4);
        let mut seen = worker.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["p0", "p1", "p2", "p3"]);
    }
    runner.stop_workers().await;
}

#[tokio::test]
async fn test_property_message_reaches_only_interested_workers() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 3));
    let wants_p1 = CountingWorker::named("p1-only").only("p1");
    let wants_p2 = CountingWorker::named("p2-only").only("p2");
    let wants_all = CountingWorker::named("all");

    let runner = DispatchRunnerBuilder::new(graph, Arc::new(InMemoryWorkQueue::new()))
        .register(wants_p1.clone())
        .register(wants_p2.clone())
        .register(wants_all.clone())
        .build()
        .await
        .unwrap();

    let message = PropertyChangeMessage::for_property(
        ElementKind::Vertex,
        "doc1",
        "ingest",
        "p1",
        Priority::High,
    );
    runner.process(&message).await.unwrap();

    assert_eq!(wants_p1.executed.load(Ordering::SeqCst), 1);
    assert_eq!(wants_p2.executed.load(Ordering::SeqCst), 0);
    assert_eq!(wants_all.executed.load(Ordering::SeqCst), 1);
    // every worker was asked about the one property, once
    for worker in [&wants_p1, &wants_p2, &wants_all] {
        assert_eq!(worker.asked.load(Ordering::SeqCst), 1);
    }
    runner.stop_workers().await;
}

#[tokio::test]
async fn test_unresolvable_element_invokes_nobody() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    let worker = CountingWorker::named("counter");
    let runner = DispatchRunnerBuilder::new(graph.clone(), Arc::new(InMemoryWorkQueue::new()))
        .register(worker.clone())
        .build()
        .await
        .unwrap();

    let result = runner
        .process(&PropertyChangeMessage::for_element(
            ElementKind::Edge,
            "gone",
            Priority::Normal,
        ))
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::ElementNotFound { kind: ElementKind::Edge, ref id }) if id == "gone"
    ));
    assert_eq!(worker.asked.load(Ordering::SeqCst), 0);
    assert_eq!(worker.executed.load(Ordering::SeqCst), 0);
    assert_eq!(graph.flush_count(), 0);
    runner.stop_workers().await;
}

/// Records what each deletion it sees removed.
#[derive(Clone, Default)]
struct DeletionWatcher {
    removed: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[async_trait]
impl PropertyWorker for DeletionWatcher {
    fn name(&self) -> &str {
        "deletion-watcher"
    }

    fn is_handled(&self, _: &Element, property: &Property) -> bool {
        property.name == "title"
    }

    async fn execute(&self, data: &WorkData) -> Result<(), WorkerError> {
        if data.status == Some(ElementOrPropertyStatus::Deletion) {
            self.removed.lock().unwrap().push((
                data.property.name.clone(),
                data.property.value.as_text().map(str::to_string),
            ));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_deletion_message_sees_removed_property() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(Element::vertex("doc1").with_property(Property::new(
        "ingest",
        "title",
        PropertyValue::Text("Quarterly report".into()),
    )));
    let queue = Arc::new(InMemoryWorkQueue::new());
    let watcher = DeletionWatcher::default();

    let handle = DispatchRunnerBuilder::new(graph.clone(), queue.clone())
        .with_poll_backoff(Duration::from_millis(10))
        .register(watcher.clone())
        .build()
        .await
        .unwrap()
        .start();

    // the writer notes the time, removes the property, then publishes
    let before = chrono::Utc::now().timestamp_millis() - 1;
    let auths = Authorizations::default();
    graph
        .remove_property(ElementKind::Vertex, "doc1", "ingest", "title", &auths)
        .await
        .unwrap();
    graph.flush().await.unwrap();
    PropertyChangePublisher::new(queue.clone(), "graphProperty")
        .publish_property_deletion(
            ElementKind::Vertex,
            "doc1",
            "ingest",
            "title",
            before,
            Priority::High,
        )
        .await
        .unwrap();

    wait_until(|| {
        let watcher = watcher.clone();
        async move { !watcher.removed.lock().unwrap().is_empty() }
    })
    .await;
    handle.shutdown().await.unwrap();

    assert_eq!(
        watcher.removed.lock().unwrap().as_slice(),
        &[("title".to_string(), Some("Quarterly report".to_string()))]
    );
    let current = graph
        .get_element(ElementKind::Vertex, "doc1", &auths)
        .await
        .unwrap()
        .unwrap();
    assert!(current.property("ingest", "title").is_none());
}

/// Panics when asked about anything.
struct NosyWorker;

#[async_trait]
impl PropertyWorker for NosyWorker {
    fn name(&self) -> &str {
        "nosy"
    }

    fn is_handled(&self, _: &Element, property: &Property) -> bool {
        panic!("cannot inspect {}", property.name)
    }

    async fn execute(&self, _: &WorkData) -> Result<(), WorkerError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_panic_while_selecting_workers_is_contained() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 2));
    let queue = Arc::new(InMemoryWorkQueue::new());
    let worker = CountingWorker::named("counter");

    let handle = DispatchRunnerBuilder::new(graph, queue.clone())
        .with_poll_backoff(Duration::from_millis(10))
        .register(NosyWorker)
        .register(worker.clone())
        .build()
        .await
        .unwrap()
        .start();

    PropertyChangePublisher::new(queue.clone(), "graphProperty")
        .publish_element(ElementKind::Vertex, "doc1", Priority::Normal)
        .await
        .unwrap();

    wait_until(|| {
        let queue = queue.clone();
        async move {
            queue
                .queues_status()
                .await
                .unwrap()
                .message_count("graphProperty")
                == 0
        }
    })
    .await;
    assert!(handle.is_running());
    assert_eq!(worker.executed.load(Ordering::SeqCst), 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_interested_worker_is_success() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 2));
    let worker = CountingWorker::named("picky").only("nothing-here");
    let runner = DispatchRunnerBuilder::new(graph.clone(), Arc::new(InMemoryWorkQueue::new()))
        .register(worker.clone())
        .build()
        .await
        .unwrap();

    runner
        .process(&PropertyChangeMessage::for_element(
            ElementKind::Vertex,
            "doc1",
            Priority::Normal,
        ))
        .await
        .unwrap();

    assert_eq!(worker.asked.load(Ordering::SeqCst), 2);
    assert_eq!(worker.executed.load(Ordering::SeqCst), 0);
    assert!(runner.last_processed_property_time().is_none());
    runner.stop_workers().await;
}

#[tokio::test]
async fn test_failing_worker_does_not_affect_siblings() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 2));
    let healthy = CountingWorker::named("healthy");

    let runner = DispatchRunnerBuilder::new(graph, Arc::new(InMemoryWorkQueue::new()))
        .register(BrokenWorker)
        .register(healthy.clone())
        .build()
        .await
        .unwrap();

    runner
        .process(&PropertyChangeMessage::for_element(
            ElementKind::Vertex,
            "doc1",
            Priority::Normal,
        ))
        .await
        .unwrap();

    assert_eq!(healthy.executed.load(Ordering::SeqCst), 2);
    let status = runner.status().await.unwrap();
    let broken = status.worker("broken").unwrap();
    assert_eq!(broken.errors, 2);
    assert_eq!(broken.processed, 0);
    assert_eq!(status.worker("healthy").unwrap().processed, 2);

    // the broken worker's loop survived its panic
    let data = Arc::new(WorkData {
        element: Arc::new(document("doc1", 2)),
        property: Property::new("ingest", "p1", PropertyValue::Text("x".into())),
        workspace_id: None,
        visibility_source: None,
        visibility: Visibility::public(),
        priority: Priority::Normal,
        status: None,
        before_action_timestamp: None,
        trace_enabled: false,
        local_file: None,
    });
    let outcome = runner.workers()[0].submit(data).unwrap().outcome().await.unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(_)));
    runner.stop_workers().await;
}

#[tokio::test]
async fn test_consumer_loop_acks_and_dead_letters() {
    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 1));
    graph.insert_element(document("doc2", 1));
    let queue = Arc::new(InMemoryWorkQueue::new());
    let worker = CountingWorker::named("counter");

    let handle = DispatchRunnerBuilder::new(graph, queue.clone())
        .with_consumer_count(2)
        .with_poll_backoff(Duration::from_millis(10))
        .register(worker.clone())
        .build()
        .await
        .unwrap()
        .start();
    assert!(handle.is_running());

    let publisher = PropertyChangePublisher::new(queue.clone(), "graphProperty");
    publisher
        .publish_element(ElementKind::Vertex, "doc1", Priority::Normal)
        .await
        .unwrap();
    publisher
        .publish_element(ElementKind::Vertex, "missing", Priority::High)
        .await
        .unwrap();
    publisher
        .publish_element(ElementKind::Vertex, "doc2", Priority::Low)
        .await
        .unwrap();

    let dead = dead_letter_queue("graphProperty");
    wait_until(|| {
        let queue = queue.clone();
        let dead = dead.clone();
        async move {
            let status = queue.queues_status().await.unwrap();
            status.message_count("graphProperty") == 0 && status.message_count(&dead) == 1
        }
    })
    .await;

    assert_eq!(worker.executed.load(Ordering::SeqCst), 2);

    let status: PipelineStatus = handle.runner().status().await.unwrap();
    assert_eq!(status.workers.len(), 1);
    assert!(status.last_processed_property_time.is_some());

    handle.shutdown().await.unwrap();
    assert!(queue
        .next_message(&dead)
        .await
        .unwrap()
        .is_some_and(|m| m.attempts == 3));
}

#[tokio::test]
async fn test_cascading_publish_from_worker() {
    init_tracing();

    /// Writes a derived property and publishes the change.
    struct Deriver {
        publisher: Option<PropertyChangePublisher>,
        graph: Option<Arc<dyn GraphStore>>,
    }

    #[async_trait]
    impl PropertyWorker for Deriver {
        fn name(&self) -> &str {
            "deriver"
        }

        async fn prepare(&mut self, context: &PrepareContext) -> Result<(), WorkerError> {
            self.publisher = Some(context.publisher.clone());
            self.graph = Some(context.graph.clone());
            Ok(())
        }

        fn is_handled(&self, _: &Element, property: &Property) -> bool {
            property.name == "p0"
        }

        async fn execute(&self, data: &WorkData) -> Result<(), WorkerError> {
            let graph = self.graph.as_ref().ok_or("not prepared")?;
            let publisher = self.publisher.as_ref().ok_or("not prepared")?;
            graph
                .add_property(
                    ElementKind::Vertex,
                    &data.element.id,
                    Property::new("deriver", "summary", PropertyValue::Text("short".into())),
                    &Authorizations::default(),
                )
                .await?;
            graph.flush().await?;
            publisher
                .publish_property(
                    ElementKind::Vertex,
                    &data.element.id,
                    "deriver",
                    "summary",
                    data.priority,
                )
                .await?;
            Ok(())
        }
    }

    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 1));
    let queue = Arc::new(InMemoryWorkQueue::new());
    let summaries = CountingWorker::named("summaries").only("summary");

    let handle = DispatchRunnerBuilder::new(graph, queue.clone())
        .with_poll_backoff(Duration::from_millis(10))
        .register(Deriver {
            publisher: None,
            graph: None,
        })
        .register(summaries.clone())
        .build()
        .await
        .unwrap()
        .start();

    PropertyChangePublisher::new(queue.clone(), "graphProperty")
        .publish_property(ElementKind::Vertex, "doc1", "ingest", "p0", Priority::Normal)
        .await
        .unwrap();

    let executed = summaries.executed.clone();
    wait_until(|| {
        let executed = executed.clone();
        async move { executed.load(Ordering::SeqCst) == 1 }
    })
    .await;

    handle.shutdown().await.unwrap();
    assert_eq!(summaries.seen.lock().unwrap().as_slice(), ["summary".to_string()]);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_consumer_loop_over_sqlite_queue() {
    use propflow::SqliteWorkQueue;

    init_tracing();
    let graph = Arc::new(InMemoryGraph::new());
    graph.insert_element(document("doc1", 5));
    let queue = Arc::new(SqliteWorkQueue::in_memory().await.unwrap());
    let worker = CountingWorker::named("counter");

    let config = PipelineConfig::parse("poll_backoff_ms = 10\nconsumer_count = 2").unwrap();
    let handle = DispatchRunnerBuilder::new(graph, queue.clone())
        .with_config(config)
        .register(worker.clone())
        .build()
        .await
        .unwrap()
        .start();

    let publisher = PropertyChangePublisher::new(queue.clone(), "graphProperty");
    for _ in 0..3 {
        publisher
            .publish_element(ElementKind::Vertex, "doc1", Priority::Normal)
            .await
            .unwrap();
    }

    let executed = worker.executed.clone();
    wait_until(|| {
        let executed = executed.clone();
        async move { executed.load(Ordering::SeqCst) == 15 }
    })
    .await;
    wait_until(|| {
        let queue = queue.clone();
        async move {
            queue
                .queues_status()
                .await
                .unwrap()
                .message_count("graphProperty")
                == 0
        }
    })
    .await;

    handle.shutdown().await.unwrap();
}
