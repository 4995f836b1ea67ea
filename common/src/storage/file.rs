// Filesystem feed storage
//
// Layout: <root>/<feed>/<generation>/** where every regular file below the
// generation directory holds feed data.

use crate::errors::StorageError;
use crate::models::{FeedId, Generation};
use crate::storage::FeedStorage;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Feed storage reading sizes from a directory tree
#[derive(Debug, Clone)]
pub struct FileFeedStorage {
    root: PathBuf,
}

impl FileFeedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn feed_dir(&self, feed: &FeedId) -> PathBuf {
        self.root.join(feed.as_str())
    }

    pub fn generation_dir(&self, feed: &FeedId, generation: Generation) -> PathBuf {
        self.feed_dir(feed).join(generation.to_string())
    }

    /// Start a new generation of `feed` by creating its directory
    #[instrument(skip(self), fields(feed = %feed))]
    pub async fn truncate(&self, feed: &FeedId) -> Result<Generation, StorageError> {
        let next = self.current_generation(feed).await? + 1;
        tokio::fs::create_dir_all(self.generation_dir(feed, next)).await?;
        debug!(generation = next, "Feed truncated");
        Ok(next)
    }
}

/// Sum of regular file lengths below `dir`; a missing directory counts as empty
async fn directory_size(dir: &Path) -> Result<u64, StorageError> {
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

#[async_trait]
impl FeedStorage for FileFeedStorage {
    async fn current_size(&self, feed: &FeedId) -> Result<u64, StorageError> {
        let generation = self.current_generation(feed).await?;
        directory_size(&self.generation_dir(feed, generation)).await
    }

    async fn current_generation(&self, feed: &FeedId) -> Result<Generation, StorageError> {
        let mut entries = match tokio::fs::read_dir(self.feed_dir(feed)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut generation = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(parsed) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<Generation>().ok())
            {
                generation = generation.max(parsed);
            }
        }
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_bytes(path: PathBuf, len: usize) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, vec![0u8; len]).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_feed_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileFeedStorage::new(dir.path());
        let feed = FeedId::new("absent").unwrap();

        assert_eq!(storage.current_generation(&feed).await.unwrap(), 0);
        assert_eq!(storage.current_size(&feed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_size_sums_nested_files_of_current_generation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileFeedStorage::new(dir.path());
        let feed = FeedId::new("events").unwrap();

        let gen0 = storage.generation_dir(&feed, 0);
        write_bytes(gen0.join("partition-0/bucket0.dat"), 1024).await;
        write_bytes(gen0.join("partition-1/bucket0.dat"), 512).await;
        assert_eq!(storage.current_size(&feed).await.unwrap(), 1536);

        let generation = storage.truncate(&feed).await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(storage.current_size(&feed).await.unwrap(), 0);

        write_bytes(storage.generation_dir(&feed, 1).join("bucket0.dat"), 10).await;
        assert_eq!(storage.current_size(&feed).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_non_numeric_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileFeedStorage::new(dir.path());
        let feed = FeedId::new("events").unwrap();

        tokio::fs::create_dir_all(storage.feed_dir(&feed).join("tmp"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(storage.generation_dir(&feed, 3))
            .await
            .unwrap();
        assert_eq!(storage.current_generation(&feed).await.unwrap(), 3);
    }
}
