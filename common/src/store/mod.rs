// Durable persistence of data-volume schedule records

pub mod memory;
pub mod postgres;

pub use memory::InMemoryScheduleStore;
pub use postgres::PostgresScheduleStore;

use crate::errors::StorageError;
use crate::models::{FeedId, ScheduleId, ScheduleRecord};
use async_trait::async_trait;

/// Key-value store for `ScheduleRecord`s
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn get(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, StorageError>;

    /// Insert or replace a record
    async fn put(&self, record: &ScheduleRecord) -> Result<(), StorageError>;

    /// Remove a record, returning whether it existed
    async fn delete(&self, id: &ScheduleId) -> Result<bool, StorageError>;

    /// Records bound to `feed`
    async fn list(&self, feed: &FeedId) -> Result<Vec<ScheduleRecord>, StorageError>;

    async fn list_all(&self) -> Result<Vec<ScheduleRecord>, StorageError>;
}
