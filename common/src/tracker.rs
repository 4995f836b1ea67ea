// Per-writer byte accounting and heartbeat emission
//
// Each writer process owns one `WriterSizeTracker`. Ingestion threads call
// `received` synchronously; a background task per feed publishes the cumulative
// counter as a REGULAR heartbeat on a fixed interval and resets it when the feed
// is truncated.

use crate::models::{FeedId, Generation, GenerationChange, Heartbeat, WriterId};
use crate::notify::{self, topics, Notifier};
use crate::telemetry;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Identifier of this writer process
    pub writer_id: WriterId,
    pub heartbeat_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            writer_id: 0,
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

struct TrackedFeed {
    counter: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct WriterSizeTracker {
    config: TrackerConfig,
    notifier: Arc<dyn Notifier>,
    feeds: RwLock<HashMap<FeedId, TrackedFeed>>,
}

impl WriterSizeTracker {
    pub fn new(config: TrackerConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            feeds: RwLock::new(HashMap::new()),
        }
    }

    pub fn writer_id(&self) -> WriterId {
        self.config.writer_id
    }

    /// Account `delta_bytes` written to `feed`
    ///
    /// Non-positive deltas are ignored. The first call for a feed starts its
    /// heartbeat task, so this must run inside a Tokio runtime.
    pub fn received(&self, feed: &FeedId, delta_bytes: i64) {
        if delta_bytes <= 0 {
            return;
        }
        let delta = delta_bytes as u64;

        {
            let feeds = self.feeds.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tracked) = feeds.get(feed) {
                tracked.counter.fetch_add(delta, Ordering::AcqRel);
                return;
            }
        }

        let counter = self.track(feed, 0);
        counter.fetch_add(delta, Ordering::AcqRel);
    }

    /// Seed the counter with bytes this writer already owns and send an INIT heartbeat
    ///
    /// Used after a writer restart so the aggregator can recalibrate instead of
    /// counting the existing bytes again.
    #[instrument(skip(self), fields(feed = %feed, writer_id = self.config.writer_id))]
    pub async fn initialize(&self, feed: &FeedId, existing_bytes: u64) {
        let counter = self.track(feed, existing_bytes);
        counter.store(existing_bytes, Ordering::Release);

        let heartbeat = Heartbeat::init(self.config.writer_id, feed.clone(), existing_bytes);
        publish_heartbeat(self.notifier.as_ref(), &heartbeat).await;
        info!(existing_bytes, "Writer initialized for feed");
    }

    /// Bytes counted for `feed` in the current generation
    pub fn current_size(&self, feed: &FeedId) -> Option<u64> {
        let feeds = self.feeds.read().unwrap_or_else(|e| e.into_inner());
        feeds.get(feed).map(|t| t.counter.load(Ordering::Acquire))
    }

    pub fn tracked_feeds(&self) -> Vec<FeedId> {
        let feeds = self.feeds.read().unwrap_or_else(|e| e.into_inner());
        feeds.keys().cloned().collect()
    }

    /// Cancel all heartbeat tasks; nothing is flushed
    pub async fn shutdown(&self) {
        let drained: Vec<(FeedId, TrackedFeed)> = {
            let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());
            feeds.drain().collect()
        };

        for (feed, tracked) in drained {
            let _ = tracked.shutdown_tx.send(true);
            let _ = tracked.handle.await;
            debug!(feed = %feed, "Heartbeat task stopped");
        }
    }

    /// Counter for `feed`, registering it with `initial` bytes if unseen
    fn track(&self, feed: &FeedId, initial: u64) -> Arc<AtomicU64> {
        let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tracked) = feeds.get(feed) {
            return tracked.counter.clone();
        }

        let counter = Arc::new(AtomicU64::new(initial));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(
            self.config.clone(),
            feed.clone(),
            counter.clone(),
            self.notifier.clone(),
            shutdown_rx,
        ));

        info!(feed = %feed, writer_id = self.config.writer_id, "Tracking new feed");
        feeds.insert(
            feed.clone(),
            TrackedFeed {
                counter: counter.clone(),
                shutdown_tx,
                handle,
            },
        );
        counter
    }
}

impl Drop for WriterSizeTracker {
    fn drop(&mut self) {
        let feeds = self.feeds.get_mut().unwrap_or_else(|e| e.into_inner());
        for tracked in feeds.values() {
            let _ = tracked.shutdown_tx.send(true);
        }
    }
}

async fn heartbeat_loop(
    config: TrackerConfig,
    feed: FeedId,
    counter: Arc<AtomicU64>,
    notifier: Arc<dyn Notifier>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut generations: BoxStream<'static, Vec<u8>> =
        match notifier.subscribe(&topics::generations(&feed)).await {
            Ok(subscription) => subscription.boxed(),
            Err(e) => {
                warn!(feed = %feed, error = %e, "Generation changes unavailable, counter will not reset");
                stream::pending().boxed()
            }
        };
    let mut generation: Option<Generation> = None;

    let mut ticker = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            Some(payload) = generations.next() => {
                match notify::decode::<GenerationChange>(&payload) {
                    Ok(change) if generation.map_or(true, |g| change.generation > g) => {
                        counter.store(0, Ordering::Release);
                        generation = Some(change.generation);
                        info!(feed = %feed, generation = change.generation, "Feed truncated, counter reset");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(feed = %feed, error = %e, "Ignoring malformed generation change"),
                }
            }
            _ = ticker.tick() => {
                let size = counter.load(Ordering::Acquire);
                let heartbeat = Heartbeat::regular(config.writer_id, feed.clone(), size);
                publish_heartbeat(notifier.as_ref(), &heartbeat).await;
            }
        }
    }
}

async fn publish_heartbeat(notifier: &dyn Notifier, heartbeat: &Heartbeat) {
    let feed = heartbeat.feed.as_str();
    match notify::publish_json(notifier, &topics::heartbeats(&heartbeat.feed), heartbeat).await {
        Ok(()) => {
            telemetry::record_heartbeat_published(feed);
            debug!(feed, absolute_size = heartbeat.absolute_size, "Heartbeat published");
        }
        Err(e) => {
            telemetry::record_heartbeat_failed(feed);
            warn!(feed, writer_id = heartbeat.writer_id, error = %e, "Failed to publish heartbeat");
        }
    }
}
