// Property-based tests for data-volume schedule evaluation

use async_trait::async_trait;
use common::aggregator::AggregatorConfig;
use common::errors::{LaunchError, TransportError};
use common::launcher::ProgramLauncher;
use common::lock::LocalLock;
use common::models::{FeedId, LaunchOptions, ProgramId, ProgramType, ScheduleId, ScheduleState};
use common::notify::{InMemoryNotifier, Notifier, Subscription};
use common::polling::PollingConfig;
use common::registry::{Evaluation, RegistryConfig, ScheduleRegistry};
use common::storage::InMemoryFeedStorage;
use common::store::InMemoryScheduleStore;
use common::tracker::{TrackerConfig, WriterSizeTracker};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct NoopLauncher;

#[async_trait]
impl ProgramLauncher for NoopLauncher {
    async fn launch(
        &self,
        _program: &ProgramId,
        _program_type: ProgramType,
        _options: &LaunchOptions,
    ) -> Result<(), LaunchError> {
        Ok(())
    }
}

fn quiet_registry() -> Arc<ScheduleRegistry> {
    let config = RegistryConfig {
        lock_ttl: Duration::from_secs(5),
        aggregation: AggregatorConfig {
            initial_delay: Duration::from_secs(3600),
            interval: Duration::from_secs(3600),
        },
        polling: PollingConfig {
            interval: Duration::from_secs(3600),
        },
    };
    ScheduleRegistry::new(
        config,
        Arc::new(InMemoryScheduleStore::new()),
        Arc::new(InMemoryFeedStorage::new()),
        Arc::new(InMemoryNotifier::new()),
        Arc::new(NoopLauncher),
        Arc::new(LocalLock::new()),
    )
}

fn schedule() -> ScheduleId {
    ScheduleId::new(ProgramId::new("app", "flow"), ProgramType::Workflow, "by-volume")
}

fn feed() -> FeedId {
    FeedId::new("events").unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// A schedule triggers exactly when the feed has grown by at least its
/// threshold since the last trigger, and each trigger moves the base to the
/// observed total
#[test]
fn property_triggers_match_threshold_crossings() {
    proptest!(ProptestConfig::with_cases(64), |(
        threshold in 1u64..10_000,
        deltas in prop::collection::vec(0u64..5_000, 1..40),
    )| {
        let rt = runtime();
        rt.block_on(async {
            let registry = quiet_registry();
            registry.create(&schedule(), &feed(), threshold).await.unwrap();

            let mut total = 0u64;
            let mut base = 0u64;
            for delta in deltas {
                total += delta;
                let outcome = registry.evaluate(&schedule(), 0, total).await;
                if total - base >= threshold {
                    prop_assert_eq!(outcome, Evaluation::Triggered { previous_base: base, total_size: total });
                    base = total;
                } else {
                    prop_assert_eq!(outcome, Evaluation::Unchanged);
                }
            }

            let record = registry.get(&schedule()).await.unwrap().unwrap();
            prop_assert_eq!(record.base_size, base);
            prop_assert!(record.base_size <= total);
            registry.shutdown().await;
            Ok(())
        })?;
    });
}

/// Re-evaluating the same observation never triggers twice
#[test]
fn property_evaluation_is_idempotent() {
    proptest!(ProptestConfig::with_cases(64), |(
        threshold in 1u64..10_000,
        total in 0u64..50_000,
        repeats in 2usize..6,
    )| {
        let rt = runtime();
        rt.block_on(async {
            let registry = quiet_registry();
            registry.create(&schedule(), &feed(), threshold).await.unwrap();

            let mut triggers = 0;
            for _ in 0..repeats {
                if let Evaluation::Triggered { .. } = registry.evaluate(&schedule(), 0, total).await {
                    triggers += 1;
                }
            }
            prop_assert_eq!(triggers, usize::from(total >= threshold));
            registry.shutdown().await;
            Ok(())
        })?;
    });
}

/// Suspending is idempotent and a suspended schedule keeps its progress
#[test]
fn property_suspended_schedule_is_inert() {
    proptest!(ProptestConfig::with_cases(32), |(
        threshold in 1u64..1_000,
        totals in prop::collection::vec(0u64..100_000, 1..20),
        suspensions in 1usize..4,
    )| {
        let rt = runtime();
        rt.block_on(async {
            let registry = quiet_registry();
            registry.create(&schedule(), &feed(), threshold).await.unwrap();
            for _ in 0..suspensions {
                registry.suspend(&schedule()).await.unwrap();
            }
            prop_assert_eq!(registry.state(&schedule()).await.unwrap(), ScheduleState::Suspended);

            for total in totals {
                prop_assert_eq!(registry.evaluate(&schedule(), 0, total).await, Evaluation::Skipped);
            }

            let record = registry.get(&schedule()).await.unwrap().unwrap();
            prop_assert_eq!(record.base_size, 0);
            prop_assert!(record.last_triggered_at.is_none());
            registry.shutdown().await;
            Ok(())
        })?;
    });
}

/// Truncation resets the base; stale observations from older generations are
/// ignored
#[test]
fn property_truncation_resets_base() {
    proptest!(ProptestConfig::with_cases(64), |(
        threshold in 1u64..10_000,
        before in 0u64..50_000,
        after in 0u64..50_000,
        stale in 0u64..1_000_000,
    )| {
        let rt = runtime();
        rt.block_on(async {
            let registry = quiet_registry();
            registry.create(&schedule(), &feed(), threshold).await.unwrap();
            registry.evaluate(&schedule(), 0, before).await;

            let outcome = registry.evaluate(&schedule(), 1, after).await;
            if after >= threshold {
                prop_assert_eq!(outcome, Evaluation::Triggered { previous_base: 0, total_size: after });
            } else {
                prop_assert_eq!(outcome, Evaluation::Rebased { generation: 1 });
            }

            prop_assert_eq!(registry.evaluate(&schedule(), 0, stale).await, Evaluation::Skipped);

            let record = registry.get(&schedule()).await.unwrap().unwrap();
            prop_assert_eq!(record.generation, 1);
            prop_assert_eq!(record.base_size, if after >= threshold { after } else { 0 });
            registry.shutdown().await;
            Ok(())
        })?;
    });
}

struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::PublishFailed {
            topic: topic.to_string(),
            reason: "unreachable".to_string(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        Err(TransportError::SubscribeFailed {
            topic: topic.to_string(),
            reason: "unreachable".to_string(),
        })
    }
}

/// Writers keep counting ingested bytes while the transport is down
#[test]
fn property_transport_failures_do_not_block_ingestion() {
    proptest!(ProptestConfig::with_cases(16), |(
        deltas in prop::collection::vec(-100i64..10_000, 1..50),
    )| {
        let rt = runtime();
        rt.block_on(async {
            let tracker = WriterSizeTracker::new(
                TrackerConfig {
                    writer_id: 7,
                    heartbeat_interval: Duration::from_millis(1),
                },
                Arc::new(BrokenNotifier),
            );

            let mut expected = 0u64;
            for delta in &deltas {
                tracker.received(&feed(), *delta);
                if *delta > 0 {
                    expected += *delta as u64;
                }
                tokio::task::yield_now().await;
            }

            prop_assert_eq!(tracker.current_size(&feed()).unwrap_or(0), expected);
            tracker.shutdown().await;
            Ok(())
        })?;
    });
}
