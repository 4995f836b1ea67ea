// Schedule kinds and their subsystems
//
// Each `ScheduleKind` is served by one `Scheduler`; `SchedulerService` picks it
// once at creation and routes later lifecycle calls through its index.

pub mod cron;
pub mod service;

pub use cron::CronScheduler;
pub use service::SchedulerService;

use crate::errors::ScheduleError;
use crate::models::{ScheduleId, ScheduleKind, ScheduleKindTag, ScheduleState};
use crate::registry::ScheduleRegistry;
use async_trait::async_trait;

/// Lifecycle surface shared by the time and data-volume subsystems
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn kind(&self) -> ScheduleKindTag;

    async fn add_schedule(&self, id: &ScheduleId, kind: &ScheduleKind) -> Result<(), ScheduleError>;

    async fn suspend_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError>;

    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError>;

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError>;

    async fn schedule_state(&self, id: &ScheduleId) -> Result<ScheduleState, ScheduleError>;

    /// Every schedule this subsystem currently holds
    async fn schedule_ids(&self) -> Result<Vec<ScheduleId>, ScheduleError>;
}

#[async_trait]
impl Scheduler for ScheduleRegistry {
    fn kind(&self) -> ScheduleKindTag {
        ScheduleKindTag::DataVolume
    }

    async fn add_schedule(&self, id: &ScheduleId, kind: &ScheduleKind) -> Result<(), ScheduleError> {
        match kind {
            ScheduleKind::DataVolume {
                feed,
                threshold_bytes,
            } => self.create(id, feed, *threshold_bytes).await,
            other => Err(ScheduleError::UnsupportedKind(other.tag().to_string())),
        }
    }

    async fn suspend_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        self.suspend(id).await
    }

    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        self.resume(id).await
    }

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        self.delete(id).await
    }

    async fn schedule_state(&self, id: &ScheduleId) -> Result<ScheduleState, ScheduleError> {
        self.state(id).await
    }

    async fn schedule_ids(&self) -> Result<Vec<ScheduleId>, ScheduleError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }
}
