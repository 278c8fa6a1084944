use super::{
    error::QueueError, error::Result, is_dead_letter_queue, QueueMessage, QueueStatusSnapshot,
    WorkQueue, BROADCAST_CAPACITY, DEFAULT_MAX_ATTEMPTS,
};
use crate::core::Priority;
use crate::sqlite::{self as pool, PoolConfig};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SQLite-backed work queue.
///
/// Messages are rows in `queue_messages`. Delivery is a single
/// `UPDATE ... RETURNING` so concurrent consumers (in this process or in
/// others sharing the file) never receive the same ready message twice.
/// Bands are always served strictly, highest priority first, FIFO within a
/// band by insertion sequence.
///
/// A failed message keeps its sequence number, so it is redelivered ahead
/// of anything pushed after it. After `max_attempts` failures it is moved to
/// `<queue>.dead`.
///
/// Broadcasts do not go through the database. They use a
/// `tokio::sync::broadcast` channel local to this instance, so only
/// subscribers in the same process receive them.
pub struct SqliteWorkQueue {
    pool: SqlitePool,
    max_attempts: u32,
    work_notify: Arc<Notify>,
    broadcast_tx: broadcast::Sender<Vec<u8>>,
}

impl SqliteWorkQueue {
    /// Opens a queue in the database file at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let pool = pool::connect(db_path, &PoolConfig::default()).await?;
        Self::with_pool(pool).await
    }

    /// Opens a queue in a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = pool::connect_in_memory().await?;
        Self::with_pool(pool).await
    }

    /// Uses an existing pool, creating the schema if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let queue = Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            work_notify: Arc::new(Notify::new()),
            broadcast_tx,
        };
        queue.initialize().await?;
        Ok(queue)
    }

    /// Sets how many deliveries a message gets before it is dead-lettered.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                payload BLOB NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT CHECK( status IN ('READY','IN_FLIGHT') ) NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // Delivery order lookup
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_ready
             ON queue_messages(queue, status, priority DESC, seq ASC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns in-flight messages older than `older_than` to their queues.
    ///
    /// Deliveries held by a consumer that died are otherwise never
    /// redelivered. Call this on startup, before any consumer of this
    /// database is running. Returns the number of recovered messages.
    pub async fn requeue_in_flight(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE queue_messages
             SET status = 'READY', updated_at = ?1
             WHERE status = 'IN_FLIGHT' AND updated_at <= ?2",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!("Requeued {} in-flight messages", count);
            self.work_notify.notify_one();
        }
        Ok(count)
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<QueueMessage> {
        let id_str: String = row.try_get("message_id")?;
        let id = Uuid::parse_str(&id_str).map_err(|e| QueueError::InvalidRow(e.to_string()))?;
        let enqueued_millis: i64 = row.try_get("enqueued_at")?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(QueueMessage {
            id,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            priority: Priority::from_rank(row.try_get("priority")?),
            attempts: attempts.max(0) as u32,
            enqueued_at: chrono::DateTime::from_timestamp_millis(enqueued_millis)
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO queue_messages
             (message_id, queue, payload, priority, status, attempts, enqueued_at, updated_at)
             VALUES (?, ?, ?, ?, 'READY', 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(queue)
        .bind(payload)
        .bind(priority.rank() as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.work_notify.notify_one();
        debug!("Pushed message: id={}, queue={}, priority={}", id, queue, priority);
        Ok(id)
    }

    async fn next_message(&self, queue: &str) -> Result<Option<QueueMessage>> {
        // Single atomic operation using UPDATE...RETURNING (SQLite 3.35+)
        sqlx::query(
            "UPDATE queue_messages
             SET status = 'IN_FLIGHT', updated_at = ?1
             WHERE seq = (
                 SELECT seq FROM queue_messages
                 WHERE queue = ?2 AND status = 'READY'
                 ORDER BY priority DESC, seq ASC
                 LIMIT 1
             )
             RETURNING message_id, queue, payload, priority, attempts, enqueued_at",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_message(&row))
        .transpose()
    }

    async fn ack(&self, message_id: Uuid) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE message_id = ? AND status = 'IN_FLIGHT'")
                .bind(message_id.to_string())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn fail(&self, message_id: Uuid) -> Result<()> {
        // SET expressions all see the row as it was before the update
        let row = sqlx::query(
            "UPDATE queue_messages
             SET status = 'READY',
                 attempts = attempts + 1,
                 queue = CASE
                     WHEN attempts + 1 >= ?1 AND queue NOT LIKE '%.dead' THEN queue || '.dead'
                     ELSE queue
                 END,
                 updated_at = ?2
             WHERE message_id = ?3 AND status = 'IN_FLIGHT'
             RETURNING queue, attempts",
        )
        .bind(self.max_attempts as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::MessageNotFound(message_id))?;

        let queue: String = row.try_get("queue")?;
        let attempts: i64 = row.try_get("attempts")?;
        if attempts >= self.max_attempts as i64 && is_dead_letter_queue(&queue) {
            warn!(
                "Message {} failed {} times, now on {}",
                message_id, attempts, queue
            );
        } else {
            debug!(
                "Requeued failed message {} on {} (attempt {})",
                message_id, queue, attempts
            );
        }

        self.work_notify.notify_one();
        Ok(())
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        let _ = self.broadcast_tx.send(payload);
        Ok(())
    }

    fn subscribe_to_broadcast(&self) -> broadcast::Receiver<Vec<u8>> {
        self.broadcast_tx.subscribe()
    }

    async fn queues_status(&self) -> Result<QueueStatusSnapshot> {
        let rows = sqlx::query("SELECT queue, COUNT(*) AS count FROM queue_messages GROUP BY queue")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = QueueStatusSnapshot::default();
        for row in rows {
            let queue: String = row.try_get("queue")?;
            let count: i64 = row.try_get("count")?;
            snapshot.queues.insert(queue, count.max(0) as u64);
        }
        Ok(snapshot)
    }

    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.work_notify.notified())
            .await
            .ok();
    }
}
