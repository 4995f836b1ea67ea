// Property-based tests for heartbeat aggregation

use chrono::Duration as ChronoDuration;
use common::aggregator::FeedAggregation;
use common::models::{FeedId, Heartbeat, WriterId};
use proptest::prelude::*;
use std::collections::HashMap;

fn feed() -> FeedId {
    FeedId::new("events").unwrap()
}

/// Cumulative per-writer reports: each step adds `delta` bytes to one writer
fn writer_steps() -> impl Strategy<Value = Vec<(WriterId, u64)>> {
    prop::collection::vec((0u32..4, 0u64..1_000_000), 1..60)
}

/// The aggregated total is the sum of each writer's latest cumulative size
#[test]
fn property_total_is_sum_of_latest_writer_sizes() {
    proptest!(|(steps in writer_steps())| {
        let mut state = FeedAggregation::new(0);
        let mut expected: HashMap<WriterId, u64> = HashMap::new();

        for (writer, delta) in steps {
            let size = expected.entry(writer).or_insert(0);
            *size += delta;
            state.apply_heartbeat(Heartbeat::regular(writer, feed(), *size));
        }

        prop_assert_eq!(state.total(), expected.values().sum::<u64>());
        prop_assert_eq!(state.last_heartbeat_by_writer.len(), expected.len());
    });
}

/// Published totals never decrease within a generation, whatever the
/// heartbeat order and whatever INIT recalibrations happen
#[test]
fn property_published_totals_are_monotonic() {
    proptest!(|(
        steps in prop::collection::vec((0u32..3, 0u64..500_000, any::<bool>(), any::<bool>()), 1..80),
        hint in 1u64..2_000_000,
    )| {
        let mut state = FeedAggregation::new(0);
        state.threshold_hint = Some(hint);
        let mut sizes: HashMap<WriterId, u64> = HashMap::new();
        let mut published: Vec<u64> = Vec::new();

        for (writer, delta, restart, stale) in steps {
            let size = sizes.entry(writer).or_insert(0);
            *size += delta;

            let mut heartbeat = if restart {
                Heartbeat::init(writer, feed(), *size)
            } else {
                Heartbeat::regular(writer, feed(), *size)
            };
            if stale && !restart {
                heartbeat.absolute_size = size.saturating_sub(delta);
                heartbeat.timestamp = heartbeat.timestamp - ChronoDuration::hours(1);
            }
            state.apply_heartbeat(heartbeat);

            if let Some(total) = state.pending_update() {
                state.mark_published(total);
                published.push(total);
            }
        }

        prop_assert!(!published.is_empty(), "first tick always publishes");
        for pair in published.windows(2) {
            prop_assert!(pair[0] <= pair[1], "published {} after {}", pair[1], pair[0]);
        }
    });
}

/// After the initial update, a new update is pending exactly when growth since
/// the last publication exceeds the threshold hint
#[test]
fn property_updates_follow_threshold_hint() {
    proptest!(|(
        initial in 0u64..10_000_000,
        growth in 0u64..10_000_000,
        hint in 1u64..5_000_000,
    )| {
        let mut state = FeedAggregation::new(0);
        state.threshold_hint = Some(hint);

        state.apply_heartbeat(Heartbeat::regular(1, feed(), initial));
        prop_assert_eq!(state.pending_update(), Some(initial));
        state.mark_published(initial);

        state.apply_heartbeat(Heartbeat::regular(1, feed(), initial + growth));
        let pending = state.pending_update();
        if growth > hint {
            prop_assert_eq!(pending, Some(initial + growth));
        } else {
            prop_assert_eq!(pending, None);
        }
    });
}

/// A restarting writer that re-reports bytes it already owned does not look
/// like growth
#[test]
fn property_init_recalibration_hides_existing_bytes() {
    proptest!(|(
        reported in 0u64..10_000_000,
        existing in 0u64..10_000_000,
        restarted_writer_is_new in any::<bool>(),
    )| {
        let mut state = FeedAggregation::new(0);
        state.threshold_hint = Some(1);

        state.apply_heartbeat(Heartbeat::regular(1, feed(), reported));
        let total = state.pending_update().unwrap();
        state.mark_published(total);

        let writer = if restarted_writer_is_new { 2 } else { 1 };
        state.apply_heartbeat(Heartbeat::init(writer, feed(), existing));

        prop_assert_eq!(state.pending_update(), None);
        prop_assert_eq!(state.baseline_size, state.total());
    });
}

/// Truncation clears all writer state and later generations only move forward
#[test]
fn property_generation_reset_clears_state() {
    proptest!(|(
        sizes in prop::collection::vec(1u64..1_000_000, 1..5),
        next in 1u32..100,
        hint in prop::option::of(1u64..1_000_000),
    )| {
        let mut state = FeedAggregation::new(0);
        state.threshold_hint = hint;
        for (writer, size) in sizes.iter().enumerate() {
            state.apply_heartbeat(Heartbeat::regular(writer as WriterId, feed(), *size));
        }
        let total = state.pending_update().unwrap();
        state.mark_published(total);

        prop_assert!(state.reset(next));
        prop_assert!(!state.reset(next));
        prop_assert!(!state.reset(next - 1));

        prop_assert_eq!(state.generation, next);
        prop_assert_eq!(state.total(), 0);
        prop_assert_eq!(state.baseline_size, 0);
        prop_assert!(!state.init_notification_sent);
        prop_assert_eq!(state.threshold_hint, hint);
        prop_assert_eq!(state.pending_update(), Some(0));
    });
}
