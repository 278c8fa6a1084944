use super::error::{ProcessError, Result};
use super::store::{ProcessStore, ProcessTransition};
use crate::core::{deserialize_value, serialize_value, LongRunningProcessRecord, ProcessStatus};
use crate::sqlite::{self as pool, PoolConfig};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

/// SQLite-backed process store. Records survive restarts of the process.
///
/// Can share a pool with [`crate::queue::SqliteWorkQueue`].
pub struct SqliteProcessStore {
    pool: SqlitePool,
}

impl SqliteProcessStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let pool = pool::connect(db_path, &PoolConfig::default()).await?;
        Self::with_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = pool::connect_in_memory().await?;
        Self::with_pool(pool).await
    }

    /// Uses an existing pool, creating the schema if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS long_running_process (
                id TEXT PRIMARY KEY,
                process_type TEXT NOT NULL,
                payload BLOB NOT NULL,
                user_id TEXT NOT NULL,
                enqueue_time INTEGER NOT NULL,
                status TEXT CHECK( status IN ('QUEUED','RUNNING','SUCCEEDED','FAILED','CANCELED') ) NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                progress_message TEXT,
                canceled INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                start_time INTEGER,
                end_time INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_long_running_process_user
             ON long_running_process(user_id, enqueue_time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LongRunningProcessRecord> {
        let id_str: String = row.try_get("id")?;
        let id = Uuid::parse_str(&id_str)
            .map_err(|e| ProcessError::Store(format!("invalid record id {}: {}", id_str, e)))?;
        let status_str: String = row.try_get("status")?;
        let status: ProcessStatus = status_str.parse()?;
        let payload: Vec<u8> = row.try_get("payload")?;

        Ok(LongRunningProcessRecord {
            id,
            process_type: row.try_get("process_type")?,
            payload: deserialize_value(&payload)?,
            user_id: row.try_get("user_id")?,
            enqueue_time: row.try_get("enqueue_time")?,
            status,
            progress: row.try_get("progress")?,
            progress_message: row.try_get("progress_message")?,
            canceled: row.try_get("canceled")?,
            error: row.try_get("error")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    /// Explains why a conditional write matched no row.
    async fn rejected(&self, id: Uuid, operation: &'static str) -> Result<ProcessError> {
        Ok(match self.get(id).await? {
            Some(record) => ProcessError::InvalidTransition {
                id,
                status: record.status,
                operation,
            },
            None => ProcessError::NotFound(id),
        })
    }
}

#[async_trait]
impl ProcessStore for SqliteProcessStore {
    async fn insert(&self, record: &LongRunningProcessRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO long_running_process
             (id, process_type, payload, user_id, enqueue_time, status, progress,
              progress_message, canceled, error, start_time, end_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.process_type)
        .bind(serialize_value(&record.payload)?)
        .bind(&record.user_id)
        .bind(record.enqueue_time)
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(&record.progress_message)
        .bind(record.canceled)
        .bind(&record.error)
        .bind(record.start_time)
        .bind(record.end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        sqlx::query("SELECT * FROM long_running_process WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_record(&row))
            .transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: &ProcessTransition,
    ) -> Result<LongRunningProcessRecord> {
        let row = sqlx::query(
            "UPDATE long_running_process
             SET status = ?,
                 start_time = COALESCE(?, start_time),
                 end_time = COALESCE(?, end_time),
                 error = COALESCE(?, error),
                 progress = COALESCE(?, progress)
             WHERE id = ? AND status = ?
             RETURNING *",
        )
        .bind(transition.to.as_str())
        .bind(transition.start_time)
        .bind(transition.end_time)
        .bind(&transition.error)
        .bind(transition.progress)
        .bind(id.to_string())
        .bind(transition.from.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(&row),
            None => Err(self.rejected(id, "transition").await?),
        }
    }

    async fn set_canceled(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        let row = sqlx::query(
            "UPDATE long_running_process
             SET canceled = 1
             WHERE id = ? AND canceled = 0 AND status IN ('QUEUED', 'RUNNING')
             RETURNING *",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_record(&row).map(Some);
        }
        match self.get(id).await? {
            Some(record) if !record.is_finished() => Ok(None),
            Some(record) => Err(ProcessError::InvalidTransition {
                id,
                status: record.status,
                operation: "cancel",
            }),
            None => Err(ProcessError::NotFound(id)),
        }
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: f64,
        message: Option<&str>,
    ) -> Result<Option<LongRunningProcessRecord>> {
        let row = sqlx::query(
            "UPDATE long_running_process
             SET progress = ?, progress_message = ?
             WHERE id = ? AND status = 'RUNNING'
             RETURNING *",
        )
        .bind(progress)
        .bind(message)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(&row).map(Some),
            None if self.get(id).await?.is_some() => Ok(None),
            None => Err(ProcessError::NotFound(id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        sqlx::query("DELETE FROM long_running_process WHERE id = ? RETURNING *")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_record(&row))
            .transpose()
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<LongRunningProcessRecord>> {
        sqlx::query(
            "SELECT * FROM long_running_process
             WHERE user_id = ?
             ORDER BY enqueue_time ASC, rowid ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_record)
        .collect()
    }
}
