// In-memory schedule store

use crate::errors::StorageError;
use crate::models::{FeedId, ScheduleId, ScheduleRecord};
use crate::store::ScheduleStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Non-durable store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    records: RwLock<HashMap<ScheduleId, ScheduleRecord>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn get(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, StorageError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, record: &ScheduleRecord) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &ScheduleId) -> Result<bool, StorageError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn list(&self, feed: &FeedId) -> Result<Vec<ScheduleRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| &record.feed == feed)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ScheduleRecord>, StorageError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProgramId, ProgramType};

    fn record(name: &str, feed: &str) -> ScheduleRecord {
        ScheduleRecord::new(
            ScheduleId::new(ProgramId::new("app", "flow"), ProgramType::Workflow, name),
            FeedId::new(feed).unwrap(),
            1000,
            0,
            0,
        )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryScheduleStore::new();
        let rec = record("a", "events");

        assert!(store.get(&rec.id).await.unwrap().is_none());
        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.id).await.unwrap(), Some(rec.clone()));

        assert!(store.delete(&rec.id).await.unwrap());
        assert!(!store.delete(&rec.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_feed() {
        let store = InMemoryScheduleStore::new();
        store.put(&record("a", "events")).await.unwrap();
        store.put(&record("b", "events")).await.unwrap();
        store.put(&record("c", "clicks")).await.unwrap();

        let events = FeedId::new("events").unwrap();
        assert_eq!(store.list(&events).await.unwrap().len(), 2);
        assert_eq!(store.list_all().await.unwrap().len(), 3);
    }
}
