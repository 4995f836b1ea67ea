// Storage polling fallback for missed or delayed heartbeats

use crate::models::{FeedId, SizeSource, SizeUpdateEvent};
use crate::periodic::PeriodicTask;
use crate::storage::FeedStorage;
use crate::telemetry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Receiver side of the size-update path shared with heartbeat aggregation
pub type SizeUpdateSink = mpsc::UnboundedSender<SizeUpdateEvent>;

struct PollingState {
    storage: Arc<dyn FeedStorage>,
    sink: SizeUpdateSink,
    interval: Duration,
    heartbeat_seen: Mutex<HashMap<FeedId, Instant>>,
}

impl PollingState {
    /// True if a heartbeat-derived update for `feed` arrived within one interval
    fn heartbeats_fresh(&self, feed: &FeedId) -> bool {
        let seen = self.heartbeat_seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.get(feed)
            .map_or(false, |at| at.elapsed() < self.interval)
    }

    async fn sample(&self, feed: &FeedId) -> Option<SizeUpdateEvent> {
        let sampled = async {
            let generation = self.storage.current_generation(feed).await?;
            let total_size = self.storage.current_size(feed).await?;
            let after = self.storage.current_generation(feed).await?;
            Ok::<_, crate::errors::StorageError>((generation, total_size, after))
        }
        .await;

        match sampled {
            Ok((generation, total_size, after)) if generation == after => {
                telemetry::record_poll(feed.as_str(), "sampled");
                telemetry::record_size_update(feed.as_str(), SizeSource::Polling.as_str(), total_size);
                debug!(feed = %feed, generation, total_size, "Feed size sampled from storage");
                Some(SizeUpdateEvent::new(
                    feed.clone(),
                    generation,
                    total_size,
                    SizeSource::Polling,
                ))
            }
            Ok((generation, _, after)) => {
                telemetry::record_poll(feed.as_str(), "raced");
                debug!(feed = %feed, generation, after, "Feed truncated while sampling, dropping sample");
                None
            }
            Err(e) => {
                telemetry::record_poll(feed.as_str(), "error");
                warn!(feed = %feed, error = %e, "Failed to sample feed size");
                None
            }
        }
    }

    async fn tick(&self, feed: &FeedId) {
        if self.heartbeats_fresh(feed) {
            telemetry::record_poll(feed.as_str(), "skipped");
            debug!(feed = %feed, "Heartbeats are current, skipping poll");
            return;
        }
        if let Some(event) = self.sample(feed).await {
            self.deliver(event);
        }
    }

    fn deliver(&self, event: SizeUpdateEvent) {
        if self.sink.send(event).is_err() {
            debug!("Size update receiver is gone");
        }
    }
}

pub struct PollingFallback {
    state: Arc<PollingState>,
    tasks: Mutex<HashMap<FeedId, PeriodicTask>>,
}

impl PollingFallback {
    pub fn new(config: PollingConfig, storage: Arc<dyn FeedStorage>, sink: SizeUpdateSink) -> Self {
        Self {
            state: Arc::new(PollingState {
                storage,
                sink,
                interval: config.interval,
                heartbeat_seen: Mutex::new(HashMap::new()),
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `feed`; returns false if it was already polled
    pub fn start(&self, feed: &FeedId) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(feed) {
            return false;
        }

        let state = self.state.clone();
        let polled = feed.clone();
        let task = PeriodicTask::spawn(
            format!("poll:{}", feed),
            self.state.interval,
            self.state.interval,
            move || {
                let state = state.clone();
                let feed = polled.clone();
                async move { state.tick(&feed).await }
            },
        );

        tasks.insert(feed.clone(), task);
        telemetry::update_polled_feeds(tasks.len());
        info!(feed = %feed, interval_secs = self.state.interval.as_secs(), "Polling started");
        true
    }

    /// Cancel polling of `feed`; an in-flight poll still completes
    pub fn stop(&self, feed: &FeedId) -> bool {
        let task = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = tasks.remove(feed);
            telemetry::update_polled_feeds(tasks.len());
            task
        };
        self.state
            .heartbeat_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(feed);

        match task {
            Some(task) => {
                task.cancel();
                info!(feed = %feed, "Polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, feed: &FeedId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(feed)
    }

    /// Note a heartbeat-derived update for `feed`, deferring the next poll
    pub fn observed(&self, feed: &FeedId) {
        self.state
            .heartbeat_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(feed.clone(), Instant::now());
    }

    /// Sample storage once without delivering the result
    pub async fn poll_once(&self, feed: &FeedId) -> Option<SizeUpdateEvent> {
        self.state.sample(feed).await
    }

    /// Sample storage now and deliver the result regardless of heartbeat freshness
    pub async fn poll_now(&self, feed: &FeedId) {
        if let Some(event) = self.state.sample(feed).await {
            self.state.deliver(event);
        }
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (_, task) in tasks.drain() {
            task.cancel();
        }
        telemetry::update_polled_feeds(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::models::Generation;
    use crate::storage::InMemoryFeedStorage;
    use async_trait::async_trait;

    fn feed() -> FeedId {
        FeedId::new("events").unwrap()
    }

    struct FailingStorage;

    #[async_trait]
    impl FeedStorage for FailingStorage {
        async fn current_size(&self, feed: &FeedId) -> Result<u64, StorageError> {
            Err(StorageError::NotFound(feed.to_string()))
        }

        async fn current_generation(&self, feed: &FeedId) -> Result<Generation, StorageError> {
            Err(StorageError::NotFound(feed.to_string()))
        }
    }

    #[tokio::test]
    async fn test_poll_once_reads_storage() {
        let storage = Arc::new(InMemoryFeedStorage::new());
        storage.append(&feed(), 2048);
        storage.truncate(&feed());
        storage.append(&feed(), 100);
        let (sink, _rx) = mpsc::unbounded_channel();
        let polling = PollingFallback::new(PollingConfig::default(), storage, sink);

        let event = polling.poll_once(&feed()).await.unwrap();
        assert_eq!(event.generation, 1);
        assert_eq!(event.total_size, 100);
        assert_eq!(event.source, SizeSource::Polling);
    }

    #[tokio::test]
    async fn test_storage_errors_yield_no_update() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let polling = PollingFallback::new(PollingConfig::default(), Arc::new(FailingStorage), sink);

        assert!(polling.poll_once(&feed()).await.is_none());
        polling.poll_now(&feed()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_periodic_polls_feed_sink() {
        let storage = Arc::new(InMemoryFeedStorage::new());
        storage.append(&feed(), 512);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let polling = PollingFallback::new(
            PollingConfig {
                interval: Duration::from_millis(10),
            },
            storage,
            sink,
        );

        assert!(polling.start(&feed()));
        assert!(!polling.start(&feed()));

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.total_size, 512);

        assert!(polling.stop(&feed()));
        assert!(!polling.is_polling(&feed()));
        assert!(!polling.stop(&feed()));
    }

    #[tokio::test]
    async fn test_fresh_heartbeats_skip_poll() {
        let storage = Arc::new(InMemoryFeedStorage::new());
        storage.append(&feed(), 1);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let polling = PollingFallback::new(
            PollingConfig {
                interval: Duration::from_secs(60),
            },
            storage,
            sink,
        );

        polling.observed(&feed());
        polling.state.tick(&feed()).await;
        assert!(rx.try_recv().is_err());

        // poll_now ignores freshness
        polling.poll_now(&feed()).await;
        assert_eq!(rx.try_recv().unwrap().total_size, 1);
    }
}
