use super::{
    dead_letter_queue, error::QueueError, error::Result, is_dead_letter_queue, PriorityPolicy,
    QueueMessage, QueueStatusSnapshot, WorkQueue, BROADCAST_CAPACITY, DEFAULT_MAX_ATTEMPTS,
};
use crate::config::PipelineConfig;
use crate::core::Priority;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Ready messages of one named queue, one band per priority.
#[derive(Default)]
struct Bands {
    /// Indexed by [`Priority::rank`].
    ready: [VecDeque<QueueMessage>; 3],
    /// Consecutive deliveries from a higher band while a lower one waited.
    streak: u32,
}

impl Bands {
    fn len(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }

    fn band(&mut self, priority: Priority) -> &mut VecDeque<QueueMessage> {
        &mut self.ready[priority.rank() as usize]
    }

    fn take(&mut self, policy: PriorityPolicy) -> Option<QueueMessage> {
        let mut waiting = Priority::DESCENDING
            .into_iter()
            .filter(|p| !self.ready[p.rank() as usize].is_empty());

        let highest = waiting.next()?;
        let lower = waiting.next();

        let chosen = match (policy, lower) {
            (PriorityPolicy::Weighted { burst }, Some(lower)) if self.streak >= burst => {
                self.streak = 0;
                lower
            }
            (_, Some(_)) => {
                self.streak = self.streak.saturating_add(1);
                highest
            }
            (_, None) => {
                self.streak = 0;
                highest
            }
        };

        self.band(chosen).pop_front()
    }
}

/// In-memory work queue using DashMap for concurrent access.
///
/// Each named queue keeps one FIFO per priority band. Delivered messages
/// are parked in an in-flight table until they are acked or failed, which
/// gives at-least-once delivery within the process. Nothing survives a
/// restart; use [`super::SqliteWorkQueue`] when messages must be durable.
///
/// The broadcast channel is a `tokio::sync::broadcast` channel local to
/// this instance.
pub struct InMemoryWorkQueue {
    queues: DashMap<String, Bands>,
    in_flight: DashMap<Uuid, QueueMessage>,
    policy: PriorityPolicy,
    max_attempts: u32,
    /// Wakes pollers parked in `wait_for_work` when a message arrives.
    work_notify: Arc<Notify>,
    broadcast_tx: broadcast::Sender<Vec<u8>>,
}

impl InMemoryWorkQueue {
    /// Creates a new in-memory queue with strict priority ordering.
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            queues: DashMap::new(),
            in_flight: DashMap::new(),
            policy: PriorityPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            work_notify: Arc::new(Notify::new()),
            broadcast_tx,
        }
    }

    /// Creates a queue using the configured priority policy and delivery limit.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new()
            .with_priority_policy(config.priority_policy())
            .with_max_attempts(config.max_delivery_attempts)
    }

    pub fn with_priority_policy(mut self, policy: PriorityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets how many deliveries a message gets before it is dead-lettered.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Returns the number of delivered but not yet acked messages.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn enqueue_ready(&self, message: QueueMessage, at_front: bool) {
        let mut bands = self.queues.entry(message.queue.clone()).or_default();
        let band = bands.band(message.priority);
        if at_front {
            band.push_front(message);
        } else {
            band.push_back(message);
        }
        drop(bands);
        self.work_notify.notify_one();
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<Uuid> {
        let message = QueueMessage {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            priority,
            attempts: 0,
            enqueued_at: Utc::now(),
        };
        let id = message.id;
        self.enqueue_ready(message, false);
        debug!("Pushed message: id={}, queue={}, priority={}", id, queue, priority);
        Ok(id)
    }

    async fn next_message(&self, queue: &str) -> Result<Option<QueueMessage>> {
        let message = match self.queues.get_mut(queue) {
            Some(mut bands) => bands.take(self.policy),
            None => None,
        };

        if let Some(message) = &message {
            self.in_flight.insert(message.id, message.clone());
        }
        Ok(message)
    }

    async fn ack(&self, message_id: Uuid) -> Result<()> {
        self.in_flight
            .remove(&message_id)
            .map(|_| ())
            .ok_or(QueueError::MessageNotFound(message_id))
    }

    async fn fail(&self, message_id: Uuid) -> Result<()> {
        let (_, mut message) = self
            .in_flight
            .remove(&message_id)
            .ok_or(QueueError::MessageNotFound(message_id))?;

        message.attempts += 1;
        if message.attempts >= self.max_attempts && !is_dead_letter_queue(&message.queue) {
            warn!(
                "Message {} on queue {} failed {} times, moving to dead-letter queue",
                message.id, message.queue, message.attempts
            );
            message.queue = dead_letter_queue(&message.queue);
            self.enqueue_ready(message, false);
        } else {
            debug!(
                "Requeueing failed message {} on queue {} (attempt {})",
                message.id, message.queue, message.attempts
            );
            self.enqueue_ready(message, true);
        }
        Ok(())
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        // send only errors when nobody is subscribed
        let _ = self.broadcast_tx.send(payload);
        Ok(())
    }

    fn subscribe_to_broadcast(&self) -> broadcast::Receiver<Vec<u8>> {
        self.broadcast_tx.subscribe()
    }

    async fn queues_status(&self) -> Result<QueueStatusSnapshot> {
        let mut snapshot = QueueStatusSnapshot::default();
        for entry in self.queues.iter() {
            snapshot
                .queues
                .insert(entry.key().clone(), entry.value().len() as u64);
        }
        for entry in self.in_flight.iter() {
            *snapshot.queues.entry(entry.value().queue.clone()).or_insert(0) += 1;
        }
        Ok(snapshot)
    }

    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.work_notify.notified())
            .await
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(queue: &InMemoryWorkQueue, name: &str) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(message) = queue.next_message(name).await.unwrap() {
            queue.ack(message.id).await.unwrap();
            out.push(message.payload);
        }
        out
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = InMemoryWorkQueue::new();
        for i in 0..5u8 {
            queue.push("gp", vec![i], Priority::Normal).await.unwrap();
        }
        assert_eq!(
            drain(&queue, "gp").await,
            vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
        );
    }

    #[tokio::test]
    async fn test_strict_policy_prefers_high() {
        let queue = InMemoryWorkQueue::new();
        queue.push("gp", b"low".to_vec(), Priority::Low).await.unwrap();
        queue.push("gp", b"normal".to_vec(), Priority::Normal).await.unwrap();
        queue.push("gp", b"high".to_vec(), Priority::High).await.unwrap();

        assert_eq!(
            drain(&queue, "gp").await,
            vec![b"high".to_vec(), b"normal".to_vec(), b"low".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_from_config_applies_policy_and_attempts() {
        let config = PipelineConfig::parse(
            "priority_policy = \"weighted\"\nweighted_burst = 1\nmax_delivery_attempts = 1",
        )
        .unwrap();
        let queue = InMemoryWorkQueue::from_config(&config);
        assert_eq!(queue.policy, PriorityPolicy::Weighted { burst: 1 });

        queue.push("gp", b"x".to_vec(), Priority::Normal).await.unwrap();
        let message = queue.next_message("gp").await.unwrap().unwrap();
        queue.fail(message.id).await.unwrap();
        assert!(queue.next_message("gp").await.unwrap().is_none());
        assert!(queue.next_message(&dead_letter_queue("gp")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_weighted_policy_lets_lower_band_through() {
        let queue =
            InMemoryWorkQueue::new().with_priority_policy(PriorityPolicy::Weighted { burst: 2 });
        for _ in 0..4 {
            queue.push("gp", b"h".to_vec(), Priority::High).await.unwrap();
        }
        queue.push("gp", b"l".to_vec(), Priority::Low).await.unwrap();

        let order = drain(&queue, "gp").await;
        assert_eq!(
            order,
            vec![
                b"h".to_vec(),
                b"h".to_vec(),
                b"l".to_vec(),
                b"h".to_vec(),
                b"h".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_and_unknown_queue_return_none() {
        let queue = InMemoryWorkQueue::new();
        assert!(queue.next_message("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_flight_counts_until_ack() {
        let queue = InMemoryWorkQueue::new();
        queue.push("gp", vec![1], Priority::Normal).await.unwrap();
        queue.push("gp", vec![2], Priority::Normal).await.unwrap();
        assert_eq!(queue.queues_status().await.unwrap().message_count("gp"), 2);

        let message = queue.next_message("gp").await.unwrap().unwrap();
        assert_eq!(queue.queues_status().await.unwrap().message_count("gp"), 2);

        queue.ack(message.id).await.unwrap();
        assert_eq!(queue.queues_status().await.unwrap().message_count("gp"), 1);
        assert!(matches!(
            queue.ack(message.id).await,
            Err(QueueError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_requeues_at_front_then_dead_letters() {
        let queue = InMemoryWorkQueue::new().with_max_attempts(2);
        queue.push("gp", b"bad".to_vec(), Priority::Normal).await.unwrap();
        queue.push("gp", b"good".to_vec(), Priority::Normal).await.unwrap();

        let first = queue.next_message("gp").await.unwrap().unwrap();
        queue.fail(first.id).await.unwrap();

        let again = queue.next_message("gp").await.unwrap().unwrap();
        assert_eq!(again.payload, b"bad".to_vec());
        assert_eq!(again.attempts, 1);
        queue.fail(again.id).await.unwrap();

        let next = queue.next_message("gp").await.unwrap().unwrap();
        assert_eq!(next.payload, b"good".to_vec());
        queue.ack(next.id).await.unwrap();

        let status = queue.queues_status().await.unwrap();
        assert_eq!(status.message_count("gp"), 0);
        assert_eq!(status.message_count("gp.dead"), 1);

        let dead = queue.next_message("gp.dead").await.unwrap().unwrap();
        assert_eq!(dead.payload, b"bad".to_vec());
        assert_eq!(dead.attempts, 2);

        // failing on the dead-letter queue keeps it there
        queue.fail(dead.id).await.unwrap();
        let status = queue.queues_status().await.unwrap();
        assert_eq!(status.message_count("gp.dead"), 1);
        assert_eq!(status.message_count("gp.dead.dead"), 0);
        let redelivered = queue.next_message("gp.dead").await.unwrap().unwrap();
        assert_eq!(redelivered.id, dead.id);
        assert_eq!(redelivered.attempts, 3);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_without_replay() {
        let queue = InMemoryWorkQueue::new();
        queue.broadcast(b"before".to_vec()).await.unwrap();

        let mut rx = queue.subscribe_to_broadcast();
        queue.broadcast(b"after".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"after".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_work_wakes_on_push() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                queue.wait_for_work(Duration::from_secs(5)).await;
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("gp", vec![1], Priority::Low).await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
