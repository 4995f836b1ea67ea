// Feed storage collaborator: the byte accounting of append-only feeds

pub mod file;
pub mod memory;

pub use file::FileFeedStorage;
pub use memory::InMemoryFeedStorage;

use crate::errors::StorageError;
use crate::models::{FeedId, Generation};
use async_trait::async_trait;

/// Read-only view of feed sizes as recorded by the storage layer
///
/// Feeds that were never written report size 0 in generation 0.
#[async_trait]
pub trait FeedStorage: Send + Sync {
    /// Bytes stored for `feed` in its current generation
    async fn current_size(&self, feed: &FeedId) -> Result<u64, StorageError>;

    /// Current truncation generation of `feed`
    async fn current_generation(&self, feed: &FeedId) -> Result<Generation, StorageError>;
}
