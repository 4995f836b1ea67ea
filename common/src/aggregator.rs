// Cross-writer heartbeat aggregation
//
// One actor task per feed owns that feed's `FeedAggregation`. Heartbeats,
// generation changes, the aggregation tick and control commands are all handled
// on the actor's loop, so the state needs no locking.

use crate::errors::TransportError;
use crate::models::{
    FeedId, Generation, GenerationChange, Heartbeat, HeartbeatKind, SizeSource, SizeUpdateEvent,
    WriterId,
};
use crate::notify::{self, topics, Notifier, Subscription};
use crate::storage::FeedStorage;
use crate::telemetry;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Delay before the first aggregation tick of a feed
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            interval: Duration::from_secs(5),
        }
    }
}

/// Aggregation state of one feed
///
/// `baseline_size` is the global size as of the last published update. INIT
/// heartbeats shift it by the writer's recalibration delta so a restarted
/// writer's already-counted bytes never show up as growth.
#[derive(Debug, Clone)]
pub struct FeedAggregation {
    pub generation: Generation,
    pub last_heartbeat_by_writer: HashMap<WriterId, Heartbeat>,
    pub baseline_size: u64,
    pub init_notification_sent: bool,
    /// Smallest active threshold on the feed; `None` publishes only the initial update
    pub threshold_hint: Option<u64>,
    last_published: u64,
}

impl FeedAggregation {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            last_heartbeat_by_writer: HashMap::new(),
            baseline_size: 0,
            init_notification_sent: false,
            threshold_hint: None,
            last_published: 0,
        }
    }

    /// Fold a heartbeat into the state
    ///
    /// A REGULAR heartbeat older than the stored one for its writer is dropped.
    pub fn apply_heartbeat(&mut self, heartbeat: Heartbeat) {
        let previous = self.last_heartbeat_by_writer.get(&heartbeat.writer_id);

        match heartbeat.kind {
            HeartbeatKind::Init => {
                let to_add = match previous {
                    Some(prev) => heartbeat.absolute_size as i128 - prev.absolute_size as i128,
                    None => heartbeat.absolute_size as i128,
                };
                self.baseline_size =
                    (self.baseline_size as i128 + to_add).clamp(0, u64::MAX as i128) as u64;
            }
            HeartbeatKind::Regular => {
                if previous.map_or(false, |prev| heartbeat.timestamp < prev.timestamp) {
                    return;
                }
            }
        }

        self.last_heartbeat_by_writer
            .insert(heartbeat.writer_id, heartbeat);
    }

    /// Sum of the latest absolute size of every writer
    pub fn total(&self) -> u64 {
        self.last_heartbeat_by_writer
            .values()
            .fold(0u64, |sum, hb| sum.saturating_add(hb.absolute_size))
    }

    /// Total to publish on this tick, if any
    pub fn pending_update(&self) -> Option<u64> {
        let total = self.total();
        if !self.init_notification_sent {
            return Some(total);
        }
        if total < self.last_published {
            return None;
        }
        match self.threshold_hint {
            Some(hint) if total.saturating_sub(self.baseline_size) > hint => Some(total),
            _ => None,
        }
    }

    pub fn mark_published(&mut self, total: u64) {
        self.baseline_size = total;
        self.last_published = total;
        self.init_notification_sent = true;
    }

    /// Drop all writer state for a new generation; returns false for stale changes
    pub fn reset(&mut self, generation: Generation) -> bool {
        if generation <= self.generation {
            return false;
        }
        let hint = self.threshold_hint;
        *self = Self::new(generation);
        self.threshold_hint = hint;
        true
    }
}

/// Read-only view of a feed's aggregation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationSnapshot {
    pub generation: Generation,
    pub total_size: u64,
    pub baseline_size: u64,
    pub writers: usize,
    pub init_notification_sent: bool,
    pub threshold_hint: Option<u64>,
}

enum Command {
    Tick(oneshot::Sender<Option<SizeUpdateEvent>>),
    SetThreshold(Option<u64>),
    Snapshot(oneshot::Sender<AggregationSnapshot>),
    Stop,
}

struct FeedActor {
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

pub struct HeartbeatAggregator {
    config: AggregatorConfig,
    notifier: Arc<dyn Notifier>,
    storage: Arc<dyn FeedStorage>,
    feeds: Mutex<HashMap<FeedId, FeedActor>>,
}

impl HeartbeatAggregator {
    pub fn new(
        config: AggregatorConfig,
        notifier: Arc<dyn Notifier>,
        storage: Arc<dyn FeedStorage>,
    ) -> Self {
        Self {
            config,
            notifier,
            storage,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Start aggregating `feed`; a no-op if it is already active
    ///
    /// Subscriptions are in place when this returns.
    #[instrument(skip(self), fields(feed = %feed))]
    pub async fn start_aggregating(&self, feed: &FeedId) -> Result<(), TransportError> {
        let mut feeds = self.feeds.lock().await;
        if feeds.get(feed).map_or(false, |actor| !actor.handle.is_finished()) {
            return Ok(());
        }

        let heartbeats = self.notifier.subscribe(&topics::heartbeats(feed)).await?;
        let generations = self.notifier.subscribe(&topics::generations(feed)).await?;

        let generation = match self.storage.current_generation(feed).await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(error = %e, "Could not read feed generation, assuming 0");
                0
            }
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = FeedAgent {
            feed: feed.clone(),
            state: FeedAggregation::new(generation),
            notifier: self.notifier.clone(),
        };
        let handle = tokio::spawn(actor.run(
            self.config.clone(),
            heartbeats,
            generations,
            command_rx,
        ));

        feeds.insert(feed.clone(), FeedActor { commands, handle });
        telemetry::update_aggregated_feeds(feeds.len());
        info!(generation, "Aggregation started");
        Ok(())
    }

    /// Stop aggregating `feed` and discard its state
    ///
    /// A tick already in progress completes first.
    #[instrument(skip(self), fields(feed = %feed))]
    pub async fn stop_aggregating(&self, feed: &FeedId) -> bool {
        let mut feeds = self.feeds.lock().await;
        let Some(actor) = feeds.remove(feed) else {
            return false;
        };
        telemetry::update_aggregated_feeds(feeds.len());
        drop(feeds);

        let _ = actor.commands.send(Command::Stop);
        let _ = actor.handle.await;
        info!("Aggregation stopped");
        true
    }

    pub async fn is_aggregating(&self, feed: &FeedId) -> bool {
        self.feeds.lock().await.contains_key(feed)
    }

    pub async fn set_threshold_hint(&self, feed: &FeedId, hint: Option<u64>) -> bool {
        self.send(feed, Command::SetThreshold(hint)).await
    }

    /// Run one aggregation tick now, returning the event it published
    pub async fn aggregate_now(&self, feed: &FeedId) -> Option<SizeUpdateEvent> {
        let (tx, rx) = oneshot::channel();
        if !self.send(feed, Command::Tick(tx)).await {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn snapshot(&self, feed: &FeedId) -> Option<AggregationSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(feed, Command::Snapshot(tx)).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let drained: Vec<(FeedId, FeedActor)> = self.feeds.lock().await.drain().collect();
        for (_, actor) in drained {
            let _ = actor.commands.send(Command::Stop);
            let _ = actor.handle.await;
        }
        telemetry::update_aggregated_feeds(0);
    }

    async fn send(&self, feed: &FeedId, command: Command) -> bool {
        let feeds = self.feeds.lock().await;
        match feeds.get(feed) {
            Some(actor) => actor.commands.send(command).is_ok(),
            None => false,
        }
    }
}

struct FeedAgent {
    feed: FeedId,
    state: FeedAggregation,
    notifier: Arc<dyn Notifier>,
}

impl FeedAgent {
    async fn run(
        mut self,
        config: AggregatorConfig,
        mut heartbeats: Subscription,
        mut generations: Subscription,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut ticker = interval_at(Instant::now() + config.initial_delay, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                Some(payload) = generations.next() => self.on_generation(&payload),
                Some(payload) = heartbeats.next() => self.on_heartbeat(&payload),
                command = commands.recv() => match command {
                    Some(Command::Tick(reply)) => {
                        let published = self.tick().await;
                        let _ = reply.send(published);
                    }
                    Some(Command::SetThreshold(hint)) => {
                        debug!(feed = %self.feed, ?hint, "Threshold hint updated");
                        self.state.threshold_hint = hint;
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Stop) | None => break,
                },
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        debug!(feed = %self.feed, "Aggregation actor exited");
    }

    fn on_heartbeat(&mut self, payload: &[u8]) {
        let heartbeat: Heartbeat = match notify::decode(payload) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                warn!(feed = %self.feed, error = %e, "Ignoring malformed heartbeat");
                return;
            }
        };
        if heartbeat.feed != self.feed {
            return;
        }
        debug!(
            feed = %self.feed,
            writer_id = heartbeat.writer_id,
            absolute_size = heartbeat.absolute_size,
            kind = ?heartbeat.kind,
            "Heartbeat received"
        );
        self.state.apply_heartbeat(heartbeat);
    }

    fn on_generation(&mut self, payload: &[u8]) {
        match notify::decode::<GenerationChange>(payload) {
            Ok(change) if self.state.reset(change.generation) => {
                info!(feed = %self.feed, generation = change.generation, "Generation changed, aggregation reset");
            }
            Ok(_) => {}
            Err(e) => warn!(feed = %self.feed, error = %e, "Ignoring malformed generation change"),
        }
    }

    async fn tick(&mut self) -> Option<SizeUpdateEvent> {
        let total = self.state.pending_update()?;
        let event = SizeUpdateEvent::new(
            self.feed.clone(),
            self.state.generation,
            total,
            SizeSource::Heartbeats,
        );

        match notify::publish_json(
            self.notifier.as_ref(),
            &topics::size_updates(&self.feed),
            &event,
        )
        .await
        {
            Ok(()) => {
                self.state.mark_published(total);
                telemetry::record_size_update(self.feed.as_str(), SizeSource::Heartbeats.as_str(), total);
                debug!(feed = %self.feed, generation = event.generation, total_size = total, "Size update published");
                Some(event)
            }
            Err(e) => {
                warn!(feed = %self.feed, error = %e, "Failed to publish size update, retrying next tick");
                None
            }
        }
    }

    fn snapshot(&self) -> AggregationSnapshot {
        AggregationSnapshot {
            generation: self.state.generation,
            total_size: self.state.total(),
            baseline_size: self.state.baseline_size,
            writers: self.state.last_heartbeat_by_writer.len(),
            init_notification_sent: self.state.init_notification_sent,
            threshold_hint: self.state.threshold_hint,
        }
    }
}
