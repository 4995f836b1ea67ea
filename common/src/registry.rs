// Registry of data-volume schedules
//
// Owns the durable `ScheduleRecord`s, turns size updates into trigger decisions
// and activates aggregation/polling for a feed while at least one schedule
// references it. Every mutation of a record happens under that record's lock.

use crate::aggregator::{AggregatorConfig, HeartbeatAggregator};
use crate::errors::ScheduleError;
use crate::launcher::{self, ProgramLauncher};
use crate::lock::{DistributedLock, LockGuard};
use crate::models::{
    FeedId, Generation, ProgramId, ScheduleId, ScheduleRecord, ScheduleState, ScheduleStatus,
    SizeSource, SizeUpdateEvent,
};
use crate::notify::{self, topics, Notifier};
use crate::polling::{PollingConfig, PollingFallback};
use crate::storage::FeedStorage;
use crate::store::ScheduleStore;
use crate::telemetry;
use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound for holding (and waiting for) a schedule lock
    pub lock_ttl: Duration,
    pub aggregation: AggregatorConfig,
    pub polling: PollingConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            aggregation: AggregatorConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

/// Per-feed activation, counted by schedules referencing the feed
struct FeedBinding {
    schedules: usize,
    forwarder: Option<JoinHandle<()>>,
}

/// Outcome of evaluating one schedule against a feed size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Triggered { previous_base: u64, total_size: u64 },
    Rebased { generation: Generation },
    Unchanged,
    Skipped,
}

pub struct ScheduleRegistry {
    config: RegistryConfig,
    store: Arc<dyn ScheduleStore>,
    storage: Arc<dyn FeedStorage>,
    notifier: Arc<dyn Notifier>,
    launcher: Arc<dyn ProgramLauncher>,
    lock: Arc<dyn DistributedLock>,
    aggregator: HeartbeatAggregator,
    polling: PollingFallback,
    feeds: Mutex<HashMap<FeedId, FeedBinding>>,
    /// Highest (generation, total) observed per active feed
    high_water: StdMutex<HashMap<FeedId, (Generation, u64)>>,
    updates: mpsc::UnboundedSender<SizeUpdateEvent>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl ScheduleRegistry {
    /// Build the registry with its own aggregator and polling fallback
    ///
    /// Size updates from both sources are evaluated sequentially by a
    /// background dispatcher.
    pub fn new(
        config: RegistryConfig,
        store: Arc<dyn ScheduleStore>,
        storage: Arc<dyn FeedStorage>,
        notifier: Arc<dyn Notifier>,
        launcher: Arc<dyn ProgramLauncher>,
        lock: Arc<dyn DistributedLock>,
    ) -> Arc<Self> {
        let (updates, update_rx) = mpsc::unbounded_channel();
        let aggregator =
            HeartbeatAggregator::new(config.aggregation.clone(), notifier.clone(), storage.clone());
        let polling = PollingFallback::new(config.polling.clone(), storage.clone(), updates.clone());

        let registry = Arc::new(Self {
            config,
            store,
            storage,
            notifier,
            launcher,
            lock,
            aggregator,
            polling,
            feeds: Mutex::new(HashMap::new()),
            high_water: StdMutex::new(HashMap::new()),
            updates,
            dispatcher: StdMutex::new(None),
        });

        let handle = tokio::spawn(dispatch(Arc::downgrade(&registry), update_rx));
        *registry
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        registry
    }

    pub fn aggregator(&self) -> &HeartbeatAggregator {
        &self.aggregator
    }

    pub fn polling(&self) -> &PollingFallback {
        &self.polling
    }

    /// Register a schedule that fires every `threshold_bytes` appended to `feed`
    #[instrument(skip(self), fields(schedule_id = %id, feed = %feed))]
    pub async fn create(
        &self,
        id: &ScheduleId,
        feed: &FeedId,
        threshold_bytes: u64,
    ) -> Result<(), ScheduleError> {
        if threshold_bytes == 0 {
            return Err(ScheduleError::InvalidConfiguration(
                "threshold_bytes must be greater than 0".to_string(),
            ));
        }

        {
            let _guard = self.lock_schedule(id).await?;
            if self.store.get(id).await?.is_some() {
                return Err(ScheduleError::AlreadyExists(id.to_string()));
            }

            let (generation, base_size) = self.best_known_size(feed).await;
            let record = ScheduleRecord::new(
                id.clone(),
                feed.clone(),
                threshold_bytes,
                base_size,
                generation,
            );
            self.store.put(&record).await?;
            info!(threshold_bytes, base_size, generation, "Schedule created");
            self.attach(feed, 1).await;
        }

        self.refresh_threshold_hint(feed).await;
        Ok(())
    }

    /// Stop a schedule from triggering; accumulated progress is kept
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub async fn suspend(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let feed = {
            let _guard = self.lock_schedule(id).await?;
            let mut record = self.require(id).await?;
            if record.status == ScheduleStatus::Suspended {
                return Ok(());
            }
            record.status = ScheduleStatus::Suspended;
            record.updated_at = Utc::now();
            self.store.put(&record).await?;
            record.feed
        };

        info!("Schedule suspended");
        self.refresh_threshold_hint(&feed).await;
        Ok(())
    }

    /// Let a suspended schedule trigger again
    ///
    /// The schedule is evaluated immediately against the best known feed size,
    /// and a storage poll is requested for the feed.
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub async fn resume(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let feed = {
            let _guard = self.lock_schedule(id).await?;
            let mut record = self.require(id).await?;
            if record.status == ScheduleStatus::Scheduled {
                return Ok(());
            }
            record.status = ScheduleStatus::Scheduled;
            record.updated_at = Utc::now();
            self.store.put(&record).await?;
            record.feed
        };

        info!("Schedule resumed");
        self.refresh_threshold_hint(&feed).await;

        let known = self.high_water_mark(&feed);
        if let Some((generation, total_size)) = known {
            self.evaluate(id, generation, total_size).await;
        }
        self.polling.poll_now(&feed).await;
        Ok(())
    }

    /// Remove a schedule; the last one on a feed stops its aggregation and polling
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub async fn delete(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let (feed, still_active) = {
            let _guard = self.lock_schedule(id).await?;
            let record = self.require(id).await?;
            self.store.delete(id).await?;
            let still_active = self.detach(&record.feed).await;
            (record.feed, still_active)
        };

        info!(feed = %feed, "Schedule deleted");
        if still_active {
            self.refresh_threshold_hint(&feed).await;
        }
        Ok(())
    }

    pub async fn state(&self, id: &ScheduleId) -> Result<ScheduleState, ScheduleError> {
        Ok(self
            .store
            .get(id)
            .await?
            .map_or(ScheduleState::NotFound, |record| record.status.into()))
    }

    pub async fn get(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, ScheduleError> {
        Ok(self.store.get(id).await?)
    }

    /// Schedules of one program
    pub async fn list(&self, program: &ProgramId) -> Result<Vec<ScheduleRecord>, ScheduleError> {
        let records = self.store.list_all().await?;
        Ok(records
            .into_iter()
            .filter(|record| &record.id.program == program)
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<ScheduleRecord>, ScheduleError> {
        Ok(self.store.list_all().await?)
    }

    /// Reload persisted schedules and activate every feed they reference
    ///
    /// Returns the number of records found.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, ScheduleError> {
        let records = self.store.list_all().await?;

        let mut per_feed: HashMap<FeedId, usize> = HashMap::new();
        for record in &records {
            *per_feed.entry(record.feed.clone()).or_default() += 1;
        }

        for (feed, count) in &per_feed {
            {
                let mut feeds = self.feeds.lock().await;
                if let Some(binding) = feeds.get_mut(feed) {
                    binding.schedules = *count;
                    continue;
                }
            }
            self.attach(feed, *count).await;
            self.refresh_threshold_hint(feed).await;
        }

        info!(schedules = records.len(), feeds = per_feed.len(), "Schedules recovered");
        Ok(records.len())
    }

    /// Evaluate every active schedule of the event's feed
    ///
    /// Never fails: store, lock and launch problems are logged and the schedule
    /// is evaluated again on the next update.
    #[instrument(skip(self, event), fields(feed = %event.feed, generation = event.generation, total_size = event.total_size))]
    pub async fn on_size_update(&self, event: SizeUpdateEvent) {
        {
            let feeds = self.feeds.lock().await;
            if !feeds.contains_key(&event.feed) {
                debug!("Feed has no schedules, size update dropped");
                return;
            }
            // Marks exist only for bound feeds
            self.raise_high_water(&event);
        }

        let records = match self.store.list(&event.feed).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to list schedules for size update");
                return;
            }
        };

        let evaluations = records
            .iter()
            .filter(|record| record.is_active())
            .map(|record| self.evaluate(&record.id, event.generation, event.total_size));
        join_all(evaluations).await;
    }

    /// Decide whether `id` fires for a feed observed at `total_size`
    pub async fn evaluate(
        &self,
        id: &ScheduleId,
        generation: Generation,
        total_size: u64,
    ) -> Evaluation {
        let _guard = match self.lock_schedule(id).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "Schedule busy, evaluation skipped");
                return Evaluation::Skipped;
            }
        };

        let mut record = match self.store.get(id).await {
            Ok(Some(record)) if record.is_active() => record,
            Ok(_) => return Evaluation::Skipped,
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "Failed to load schedule");
                return Evaluation::Skipped;
            }
        };

        if generation < record.generation {
            debug!(schedule_id = %id, generation, current = record.generation, "Ignoring update from an older generation");
            return Evaluation::Skipped;
        }

        let rebased = generation > record.generation;
        if rebased {
            info!(schedule_id = %id, from = record.generation, to = generation, "Feed truncated, schedule base reset");
            record.generation = generation;
            record.base_size = 0;
        }

        let previous_base = record.base_size;
        let triggered = total_size.saturating_sub(previous_base) >= record.threshold_bytes;
        if !triggered && !rebased {
            return Evaluation::Unchanged;
        }

        let now = Utc::now();
        if triggered {
            record.base_size = total_size;
            record.last_triggered_at = Some(now);
        }
        record.updated_at = now;

        // The new base is persisted before launching so a store failure cannot
        // lead to a second launch for the same data
        if let Err(e) = self.store.put(&record).await {
            warn!(schedule_id = %id, error = %e, "Failed to persist schedule, evaluation will be retried");
            return Evaluation::Skipped;
        }

        if !triggered {
            return Evaluation::Rebased { generation };
        }

        info!(
            schedule_id = %id,
            previous_base,
            total_size,
            threshold_bytes = record.threshold_bytes,
            "Schedule triggered"
        );
        telemetry::record_trigger(&id.key(), record.feed.as_str());
        self.spawn_launch(&record, previous_base, total_size);

        Evaluation::Triggered {
            previous_base,
            total_size,
        }
    }

    /// Stop all feed activity; records stay in the store
    pub async fn shutdown(&self) {
        let drained: Vec<(FeedId, FeedBinding)> = self.feeds.lock().await.drain().collect();
        for (feed, binding) in drained {
            if let Some(forwarder) = binding.forwarder {
                forwarder.abort();
            }
            self.polling.stop(&feed);
            self.aggregator.stop_aggregating(&feed).await;
        }

        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        info!("Schedule registry stopped");
    }

    pub async fn is_feed_active(&self, feed: &FeedId) -> bool {
        self.feeds.lock().await.contains_key(feed)
    }

    fn spawn_launch(&self, record: &ScheduleRecord, previous_base: u64, total_size: u64) {
        let launcher = self.launcher.clone();
        let options = launcher::trigger_options(record, previous_base, total_size, Utc::now());
        let id = record.id.clone();

        tokio::spawn(async move {
            if let Err(e) = launcher
                .launch(&id.program, id.program_type, &options)
                .await
            {
                telemetry::record_launch_failure(&id.key());
                error!(schedule_id = %id, error = %e, "Failed to launch program");
            }
        });
    }

    async fn lock_schedule(&self, id: &ScheduleId) -> Result<LockGuard, ScheduleError> {
        let resource = format!("schedule:{}", id.key());
        self.lock
            .acquire(&resource, self.config.lock_ttl)
            .await
            .map_err(|e| ScheduleError::Lock {
                resource,
                reason: e.to_string(),
            })
    }

    async fn require(&self, id: &ScheduleId) -> Result<ScheduleRecord, ScheduleError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    /// Size a new schedule starts from: the highest observed size, else storage, else 0
    async fn best_known_size(&self, feed: &FeedId) -> (Generation, u64) {
        if let Some(known) = self.high_water_mark(feed) {
            return known;
        }

        let generation = self.storage.current_generation(feed).await.unwrap_or_else(|e| {
            warn!(feed = %feed, error = %e, "Could not read feed generation");
            0
        });
        let size = self.storage.current_size(feed).await.unwrap_or_else(|e| {
            warn!(feed = %feed, error = %e, "Could not read feed size");
            0
        });
        (generation, size)
    }

    fn high_water_mark(&self, feed: &FeedId) -> Option<(Generation, u64)> {
        self.high_water
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(feed)
            .copied()
    }

    fn raise_high_water(&self, event: &SizeUpdateEvent) {
        let mut marks = self.high_water.lock().unwrap_or_else(|e| e.into_inner());
        let mark = marks
            .entry(event.feed.clone())
            .or_insert((event.generation, event.total_size));
        if event.generation > mark.0 {
            *mark = (event.generation, event.total_size);
        } else if event.generation == mark.0 {
            mark.1 = mark.1.max(event.total_size);
        }
    }

    /// Add `count` schedules to the feed's binding, activating it when new
    async fn attach(&self, feed: &FeedId, count: usize) {
        let mut feeds = self.feeds.lock().await;
        if let Some(binding) = feeds.get_mut(feed) {
            binding.schedules += count;
            return;
        }

        let forwarder = match self.notifier.subscribe(&topics::size_updates(feed)).await {
            Ok(subscription) => {
                let updates = self.updates.clone();
                let feed_id = feed.clone();
                let handle = tokio::spawn(async move {
                    let mut subscription = subscription;
                    while let Some(payload) = subscription.next().await {
                        match notify::decode::<SizeUpdateEvent>(&payload) {
                            Ok(event) if event.feed == feed_id => {
                                if updates.send(event).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(feed = %feed_id, error = %e, "Ignoring malformed size update"),
                        }
                    }
                });
                Some(handle)
            }
            Err(e) => {
                warn!(feed = %feed, error = %e, "Size updates unavailable, relying on polling");
                None
            }
        };

        if let Err(e) = self.aggregator.start_aggregating(feed).await {
            warn!(feed = %feed, error = %e, "Heartbeat aggregation unavailable, relying on polling");
        }
        self.polling.start(feed);

        feeds.insert(
            feed.clone(),
            FeedBinding {
                schedules: count,
                forwarder,
            },
        );
        info!(feed = %feed, schedules = count, "Feed activated");
    }

    /// Drop one schedule from the feed's binding; returns true while the feed stays active
    async fn detach(&self, feed: &FeedId) -> bool {
        let mut feeds = self.feeds.lock().await;
        let Some(binding) = feeds.get_mut(feed) else {
            return false;
        };

        binding.schedules = binding.schedules.saturating_sub(1);
        if binding.schedules > 0 {
            return true;
        }

        if let Some(binding) = feeds.remove(feed) {
            if let Some(forwarder) = binding.forwarder {
                forwarder.abort();
            }
        }
        self.polling.stop(feed);
        self.aggregator.stop_aggregating(feed).await;
        self.high_water
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(feed);
        info!(feed = %feed, "Feed deactivated");
        false
    }

    /// Push the smallest active threshold of `feed` to its aggregator
    async fn refresh_threshold_hint(&self, feed: &FeedId) {
        let records = match self.store.list(feed).await {
            Ok(records) => records,
            Err(e) => {
                warn!(feed = %feed, error = %e, "Could not refresh threshold hint");
                return;
            }
        };
        let hint = records
            .iter()
            .filter(|record| record.is_active())
            .map(|record| record.threshold_bytes)
            .min();
        self.aggregator.set_threshold_hint(feed, hint).await;
    }
}

/// Apply size updates one at a time until the registry is dropped
async fn dispatch(registry: Weak<ScheduleRegistry>, mut updates: mpsc::UnboundedReceiver<SizeUpdateEvent>) {
    while let Some(event) = updates.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if event.source == SizeSource::Heartbeats {
            registry.polling.observed(&event.feed);
        }
        registry.on_size_update(event).await;
    }
    debug!("Size update dispatcher exited");
}
