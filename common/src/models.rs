use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

lazy_static! {
    static ref FEED_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("Invalid feed id pattern");
}

// ============================================================================
// Feed Models
// ============================================================================

/// Name of an append-only data feed
///
/// Feed ids are used as pub/sub subject tokens and directory names, so they are
/// restricted to `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId(String);

impl FeedId {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if FEED_ID_PATTERN.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(ValidationError::InvalidFeedId(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FeedId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FeedId::new(value)
    }
}

impl From<FeedId> for String {
    fn from(feed: FeedId) -> Self {
        feed.0
    }
}

impl FromStr for FeedId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeedId::new(s)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one writer process (container instance id)
pub type WriterId = u32;

/// Truncation counter of a feed
pub type Generation = u32;

/// Kind of a writer heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    /// Sent when a writer starts and reports data it already owned
    Init,
    /// Periodic report of the writer's cumulative counter
    Regular,
}

/// One writer's cumulative byte count for a feed in the current generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub writer_id: WriterId,
    pub feed: FeedId,
    pub absolute_size: u64,
    pub kind: HeartbeatKind,
}

impl Heartbeat {
    pub fn regular(writer_id: WriterId, feed: FeedId, absolute_size: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            writer_id,
            feed,
            absolute_size,
            kind: HeartbeatKind::Regular,
        }
    }

    pub fn init(writer_id: WriterId, feed: FeedId, absolute_size: u64) -> Self {
        Self {
            kind: HeartbeatKind::Init,
            ..Self::regular(writer_id, feed, absolute_size)
        }
    }
}

/// Announcement that a feed was truncated and entered a new generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationChange {
    pub feed: FeedId,
    pub generation: Generation,
    pub timestamp: DateTime<Utc>,
}

/// Where a size update was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSource {
    Heartbeats,
    Polling,
}

impl SizeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeSource::Heartbeats => "heartbeats",
            SizeSource::Polling => "polling",
        }
    }
}

/// Global size of a feed as observed by the aggregator or the polling fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeUpdateEvent {
    pub feed: FeedId,
    pub generation: Generation,
    pub total_size: u64,
    pub timestamp: DateTime<Utc>,
    pub source: SizeSource,
}

impl SizeUpdateEvent {
    pub fn new(feed: FeedId, generation: Generation, total_size: u64, source: SizeSource) -> Self {
        Self {
            feed,
            generation,
            total_size,
            timestamp: Utc::now(),
            source,
        }
    }
}

// ============================================================================
// Schedule Models
// ============================================================================

/// Type of program a schedule launches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    Workflow,
    MapReduce,
    Spark,
}

impl ProgramType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramType::Workflow => "workflow",
            ProgramType::MapReduce => "map_reduce",
            ProgramType::Spark => "spark",
        }
    }
}

impl FromStr for ProgramType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(ProgramType::Workflow),
            "map_reduce" => Ok(ProgramType::MapReduce),
            "spark" => Ok(ProgramType::Spark),
            other => Err(ValidationError::InvalidFieldValue {
                field: "program_type".to_string(),
                reason: format!("unknown program type '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Program within an application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId {
    pub application: String,
    pub program: String,
}

impl ProgramId {
    pub fn new(application: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            program: program.into(),
        }
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.application, self.program)
    }
}

/// Identity of a schedule: (program, program type, schedule name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleId {
    pub program: ProgramId,
    pub program_type: ProgramType,
    pub name: String,
}

impl ScheduleId {
    pub fn new(program: ProgramId, program_type: ProgramType, name: impl Into<String>) -> Self {
        Self {
            program,
            program_type,
            name: name.into(),
        }
    }

    /// Stable key used for persistence and locking
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.program.application, self.program.program, self.program_type, self.name
        )
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Persisted state of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    Suspended,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ScheduleStatus::Scheduled),
            "suspended" => Ok(ScheduleStatus::Suspended),
            other => Err(ValidationError::InvalidFieldValue {
                field: "state".to_string(),
                reason: format!("unknown schedule state '{}'", other),
            }),
        }
    }
}

/// Answer to a schedule state query; `NotFound` is never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleState {
    Scheduled,
    Suspended,
    NotFound,
}

impl From<ScheduleStatus> for ScheduleState {
    fn from(status: ScheduleStatus) -> Self {
        match status {
            ScheduleStatus::Scheduled => ScheduleState::Scheduled,
            ScheduleStatus::Suspended => ScheduleState::Suspended,
        }
    }
}

/// Durable record of a data-volume schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub feed: FeedId,
    pub threshold_bytes: u64,
    /// Feed size at the last trigger (or at creation)
    pub base_size: u64,
    /// Feed generation `base_size` belongs to
    pub generation: Generation,
    pub status: ScheduleStatus,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn new(
        id: ScheduleId,
        feed: FeedId,
        threshold_bytes: u64,
        base_size: u64,
        generation: Generation,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            feed,
            threshold_bytes,
            base_size,
            generation,
            status: ScheduleStatus::Scheduled,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Scheduled
    }
}

/// How a schedule decides when to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron {
        expression: String,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
    },
    DataVolume {
        feed: FeedId,
        threshold_bytes: u64,
    },
}

impl ScheduleKind {
    pub fn tag(&self) -> ScheduleKindTag {
        match self {
            ScheduleKind::Cron { .. } => ScheduleKindTag::Time,
            ScheduleKind::DataVolume { .. } => ScheduleKindTag::DataVolume,
        }
    }
}

/// Subsystem responsible for a schedule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKindTag {
    Time,
    DataVolume,
}

impl fmt::Display for ScheduleKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleKindTag::Time => f.write_str("time"),
            ScheduleKindTag::DataVolume => f.write_str("data_volume"),
        }
    }
}

/// Runtime arguments handed to a launched program
pub type LaunchOptions = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_id_validation() {
        assert!(FeedId::new("purchases").is_ok());
        assert!(FeedId::new("click_stream-2").is_ok());
        assert!(FeedId::new("").is_err());
        assert!(FeedId::new("a.b").is_err());
        assert!(FeedId::new("with space").is_err());
        assert!(FeedId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_feed_id_rejected_on_deserialize() {
        let result: Result<FeedId, _> = serde_json::from_str("\"bad.feed\"");
        assert!(result.is_err());
        let feed: FeedId = serde_json::from_str("\"good_feed\"").unwrap();
        assert_eq!(feed.as_str(), "good_feed");
    }

    #[test]
    fn test_heartbeat_constructors() {
        let feed = FeedId::new("events").unwrap();
        let hb = Heartbeat::init(3, feed.clone(), 42);
        assert_eq!(hb.kind, HeartbeatKind::Init);
        assert_eq!(hb.writer_id, 3);
        assert_eq!(Heartbeat::regular(3, feed, 42).kind, HeartbeatKind::Regular);
    }

    #[test]
    fn test_schedule_id_key() {
        let id = ScheduleId::new(
            ProgramId::new("Purchases", "Aggregate"),
            ProgramType::Workflow,
            "EveryMegabyte",
        );
        assert_eq!(id.key(), "Purchases/Aggregate/workflow/EveryMegabyte");
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [ScheduleStatus::Scheduled, ScheduleStatus::Suspended] {
            assert_eq!(ScheduleStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(ScheduleStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_schedule_kind_tag() {
        let cron = ScheduleKind::Cron {
            expression: "0 0 * * * * *".to_string(),
            timezone: chrono_tz::UTC,
        };
        let volume = ScheduleKind::DataVolume {
            feed: FeedId::new("events").unwrap(),
            threshold_bytes: 1_000_000,
        };
        assert_eq!(cron.tag(), ScheduleKindTag::Time);
        assert_eq!(volume.tag(), ScheduleKindTag::DataVolume);
    }

    #[test]
    fn test_schedule_kind_serialization() {
        let kind = ScheduleKind::Cron {
            expression: "0 0 12 * * * *".to_string(),
            timezone: chrono_tz::Asia::Ho_Chi_Minh,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "cron");
        assert_eq!(json["timezone"], "Asia/Ho_Chi_Minh");
        let back: ScheduleKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
