//! Queue backends for the propflow pipeline.
//!
//! A backend offers named point-to-point queues with priority bands and a
//! separate best-effort broadcast channel:
//!
//! - [`InMemoryWorkQueue`]: single-process queue for tests and embedded use
//! - [`SqliteWorkQueue`]: durable queue backed by SQLite (feature `sqlite`)
//!
//! Delivery is at-least-once. A message handed out by
//! [`WorkQueue::next_message`] stays in flight until it is acked or failed.
//!
//! # Redelivery
//!
//! Both backends handle [`WorkQueue::fail`] the same way. The message goes
//! back to the head of its priority band with `attempts + 1`. Once it has
//! failed `max_attempts` times it is moved to the dead-letter queue
//! `<queue>.dead` (see [`dead_letter_queue`]). Dead-lettered messages are
//! reported by [`WorkQueue::queues_status`] and can be polled like any queue.
//! A message failed on a dead-letter queue goes back to the head of that
//! same queue.

use crate::core::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::{QueueError, Result};
pub use memory::InMemoryWorkQueue;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteWorkQueue;

/// Default number of deliveries before a failed message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Capacity of the broadcast channel. Subscribers lagging further behind
/// than this lose the oldest notifications.
pub const BROADCAST_CAPACITY: usize = 1024;

const DEAD_LETTER_SUFFIX: &str = ".dead";

/// Returns the name of the dead-letter queue for `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Whether `queue` is a dead-letter queue. Messages failed there stay there.
pub fn is_dead_letter_queue(queue: &str) -> bool {
    queue.ends_with(DEAD_LETTER_SUFFIX)
}

/// A message delivered from a named queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Identifier used to ack or fail this delivery.
    pub id: Uuid,
    pub queue: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    /// Number of failed deliveries before this one.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-queue message counts, including unacked deliveries.
///
/// Derived for observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueStatusSnapshot {
    pub queues: BTreeMap<String, u64>,
}

impl QueueStatusSnapshot {
    pub fn message_count(&self, queue: &str) -> u64 {
        self.queues.get(queue).copied().unwrap_or(0)
    }
}

/// How a backend chooses between priority bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicy {
    /// Always serve the highest non-empty band.
    Strict,
    /// After `burst` consecutive deliveries from a higher band while a
    /// lower band is waiting, serve one message from the lower band.
    Weighted { burst: u32 },
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        PriorityPolicy::Strict
    }
}

/// Trait for named-queue transports.
///
/// Queues are created implicitly on first push. Within one priority band
/// messages are delivered FIFO; across bands the order is a scheduling
/// preference only.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues `payload` on `queue` and returns the message id.
    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<Uuid>;

    /// Takes the next message from `queue` without blocking.
    ///
    /// Returns `Ok(None)` when the queue is empty. Pollers are expected to
    /// back off (see [`WorkQueue::wait_for_work`]) instead of spinning.
    async fn next_message(&self, queue: &str) -> Result<Option<QueueMessage>>;

    /// Marks an in-flight message as processed.
    async fn ack(&self, message_id: Uuid) -> Result<()>;

    /// Returns an in-flight message for redelivery or dead-letters it.
    async fn fail(&self, message_id: Uuid) -> Result<()>;

    /// Publishes `payload` to every current broadcast subscriber.
    ///
    /// Best effort: having no subscribers is not an error, and nothing is
    /// stored for subscribers that join later.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<()>;

    /// Subscribes to the broadcast channel.
    fn subscribe_to_broadcast(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Returns the number of ready plus in-flight messages per queue.
    async fn queues_status(&self) -> Result<QueueStatusSnapshot>;

    /// Parks the caller until work might be available or `timeout` elapses.
    ///
    /// The default just sleeps for `timeout`. Backends that can signal new
    /// pushes override this to wake pollers early.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

#[async_trait]
impl<T: WorkQueue + ?Sized> WorkQueue for Arc<T> {
    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<Uuid> {
        (**self).push(queue, payload, priority).await
    }

    async fn next_message(&self, queue: &str) -> Result<Option<QueueMessage>> {
        (**self).next_message(queue).await
    }

    async fn ack(&self, message_id: Uuid) -> Result<()> {
        (**self).ack(message_id).await
    }

    async fn fail(&self, message_id: Uuid) -> Result<()> {
        (**self).fail(message_id).await
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        (**self).broadcast(payload).await
    }

    fn subscribe_to_broadcast(&self) -> broadcast::Receiver<Vec<u8>> {
        (**self).subscribe_to_broadcast()
    }

    async fn queues_status(&self) -> Result<QueueStatusSnapshot> {
        (**self).queues_status().await
    }

    async fn wait_for_work(&self, timeout: Duration) {
        (**self).wait_for_work(timeout).await
    }
}
