// In-memory feed storage for tests and standalone runs

use crate::errors::StorageError;
use crate::models::{FeedId, Generation};
use crate::storage::FeedStorage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default, Clone, Copy)]
struct FeedBytes {
    generation: Generation,
    size: u64,
}

/// Feed storage that only counts bytes
#[derive(Debug, Default)]
pub struct InMemoryFeedStorage {
    feeds: RwLock<HashMap<FeedId, FeedBytes>>,
}

impl InMemoryFeedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` appended to `feed`, returning the new size
    pub fn append(&self, feed: &FeedId, bytes: u64) -> u64 {
        let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());
        let entry = feeds.entry(feed.clone()).or_default();
        entry.size += bytes;
        entry.size
    }

    /// Drop all data of `feed` and start a new generation
    pub fn truncate(&self, feed: &FeedId) -> Generation {
        let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());
        let entry = feeds.entry(feed.clone()).or_default();
        entry.generation += 1;
        entry.size = 0;
        entry.generation
    }

    fn snapshot(&self, feed: &FeedId) -> FeedBytes {
        self.feeds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(feed)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl FeedStorage for InMemoryFeedStorage {
    async fn current_size(&self, feed: &FeedId) -> Result<u64, StorageError> {
        Ok(self.snapshot(feed).size)
    }

    async fn current_generation(&self, feed: &FeedId) -> Result<Generation, StorageError> {
        Ok(self.snapshot(feed).generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_truncate() {
        let storage = InMemoryFeedStorage::new();
        let feed = FeedId::new("clicks").unwrap();

        assert_eq!(storage.current_size(&feed).await.unwrap(), 0);
        assert_eq!(storage.append(&feed, 100), 100);
        assert_eq!(storage.append(&feed, 24), 124);
        assert_eq!(storage.current_generation(&feed).await.unwrap(), 0);

        assert_eq!(storage.truncate(&feed), 1);
        assert_eq!(storage.current_size(&feed).await.unwrap(), 0);
        assert_eq!(storage.current_generation(&feed).await.unwrap(), 1);
    }
}
