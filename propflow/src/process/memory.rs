use super::error::{ProcessError, Result};
use super::store::{ProcessStore, ProcessTransition};
use crate::core::{LongRunningProcessRecord, ProcessStatus};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Process store kept in memory. Records are lost when the process exits.
#[derive(Default)]
pub struct InMemoryProcessStore {
    records: DashMap<Uuid, LongRunningProcessRecord>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn insert(&self, record: &LongRunningProcessRecord) -> Result<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(ProcessError::Store(format!(
                "record {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: &ProcessTransition,
    ) -> Result<LongRunningProcessRecord> {
        let mut record = self.records.get_mut(&id).ok_or(ProcessError::NotFound(id))?;
        if record.status != transition.from {
            return Err(ProcessError::InvalidTransition {
                id,
                status: record.status,
                operation: "transition",
            });
        }

        record.status = transition.to;
        if let Some(start_time) = transition.start_time {
            record.start_time = Some(start_time);
        }
        if let Some(end_time) = transition.end_time {
            record.end_time = Some(end_time);
        }
        if let Some(error) = &transition.error {
            record.error = Some(error.clone());
        }
        if let Some(progress) = transition.progress {
            record.progress = progress;
        }
        Ok(record.clone())
    }

    async fn set_canceled(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        let mut record = self.records.get_mut(&id).ok_or(ProcessError::NotFound(id))?;
        if record.is_finished() {
            return Err(ProcessError::InvalidTransition {
                id,
                status: record.status,
                operation: "cancel",
            });
        }
        if record.canceled {
            return Ok(None);
        }
        record.canceled = true;
        Ok(Some(record.clone()))
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: f64,
        message: Option<&str>,
    ) -> Result<Option<LongRunningProcessRecord>> {
        let mut record = self.records.get_mut(&id).ok_or(ProcessError::NotFound(id))?;
        if record.status != ProcessStatus::Running {
            return Ok(None);
        }
        record.progress = progress;
        record.progress_message = message.map(str::to_string);
        Ok(Some(record.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<Option<LongRunningProcessRecord>> {
        Ok(self.records.remove(&id).map(|(_, record)| record))
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<LongRunningProcessRecord>> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.enqueue_time);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_get_delete() {
        let store = InMemoryProcessStore::new();
        let record = LongRunningProcessRecord::new("import", json!({"file": "a.csv"}), "alice");

        store.insert(&record).await.unwrap();
        assert!(store.insert(&record).await.is_err());
        assert_eq!(store.get(record.id).await.unwrap(), Some(record.clone()));

        assert_eq!(store.delete(record.id).await.unwrap(), Some(record.clone()));
        assert!(store.get(record.id).await.unwrap().is_none());
        assert!(matches!(
            store.set_canceled(record.id).await,
            Err(ProcessError::NotFound(id)) if id == record.id
        ));
    }

    #[tokio::test]
    async fn test_writes_are_conditional_on_status() {
        let store = InMemoryProcessStore::new();
        let record = LongRunningProcessRecord::new("import", json!({}), "alice");
        store.insert(&record).await.unwrap();

        // progress only lands on running records
        assert_eq!(store.update_progress(record.id, 0.5, None).await.unwrap(), None);

        let mut start = ProcessTransition::new(ProcessStatus::Queued, ProcessStatus::Running);
        start.start_time = Some(7);
        let running = store.transition(record.id, &start).await.unwrap();
        assert_eq!(running.start_time, Some(7));
        assert!(matches!(
            store.transition(record.id, &start).await,
            Err(ProcessError::InvalidTransition { status: ProcessStatus::Running, .. })
        ));

        let flagged = store.set_canceled(record.id).await.unwrap().unwrap();
        assert!(flagged.canceled);
        assert_eq!(store.set_canceled(record.id).await.unwrap(), None);

        let progressed = store
            .update_progress(record.id, 0.5, Some("halfway"))
            .await
            .unwrap()
            .unwrap();
        assert!(progressed.canceled);
        assert_eq!(progressed.progress, 0.5);

        let mut finish = ProcessTransition::new(ProcessStatus::Running, ProcessStatus::Canceled);
        finish.end_time = Some(9);
        let canceled = store.transition(record.id, &finish).await.unwrap();
        assert!(canceled.canceled);
        assert_eq!(canceled.progress_message.as_deref(), Some("halfway"));
        assert!(matches!(
            store.set_canceled(record.id).await,
            Err(ProcessError::InvalidTransition { status: ProcessStatus::Canceled, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_by_user_is_scoped_and_ordered() {
        let store = InMemoryProcessStore::new();
        let mut first = LongRunningProcessRecord::new("import", json!({}), "alice");
        first.enqueue_time = 10;
        let mut second = LongRunningProcessRecord::new("export", json!({}), "alice");
        second.enqueue_time = 20;
        let other = LongRunningProcessRecord::new("import", json!({}), "bob");

        for record in [&second, &other, &first] {
            store.insert(record).await.unwrap();
        }

        let ids: Vec<Uuid> = store
            .list_by_user("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
