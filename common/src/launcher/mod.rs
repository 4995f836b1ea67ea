// Program launch capability used when a schedule fires

pub mod nats;

pub use nats::{LaunchRequest, NatsProgramLauncher};

use crate::errors::LaunchError;
use crate::models::{LaunchOptions, ProgramId, ProgramType, ScheduleRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const OPTION_SCHEDULE_NAME: &str = "schedule.name";
pub const OPTION_FEED: &str = "feed";
pub const OPTION_FEED_GENERATION: &str = "feed.generation";
pub const OPTION_FEED_TOTAL_SIZE: &str = "feed.total.size";
pub const OPTION_FEED_BASE_SIZE: &str = "feed.base.size";
pub const OPTION_LOGICAL_START_TIME: &str = "logical.start.time";

/// Starts programs; callers treat it as fire-and-forget
#[async_trait]
pub trait ProgramLauncher: Send + Sync {
    async fn launch(
        &self,
        program: &ProgramId,
        program_type: ProgramType,
        options: &LaunchOptions,
    ) -> Result<(), LaunchError>;
}

/// Runtime options for a trigger of `record` at `total_size`
///
/// `previous_base` is the base size the trigger was measured against.
pub fn trigger_options(
    record: &ScheduleRecord,
    previous_base: u64,
    total_size: u64,
    logical_start: DateTime<Utc>,
) -> LaunchOptions {
    let mut options = LaunchOptions::new();
    options.insert(OPTION_SCHEDULE_NAME.to_string(), record.id.name.clone());
    options.insert(OPTION_FEED.to_string(), record.feed.to_string());
    options.insert(OPTION_FEED_GENERATION.to_string(), record.generation.to_string());
    options.insert(OPTION_FEED_TOTAL_SIZE.to_string(), total_size.to_string());
    options.insert(OPTION_FEED_BASE_SIZE.to_string(), previous_base.to_string());
    options.insert(
        OPTION_LOGICAL_START_TIME.to_string(),
        logical_start.timestamp_millis().to_string(),
    );
    options
}
