// Scheduling façade dispatching by schedule kind

use crate::errors::ScheduleError;
use crate::models::{
    FeedId, ProgramId, ScheduleId, ScheduleKind, ScheduleKindTag, ScheduleState,
};
use crate::scheduler::Scheduler;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};

/// Entry point for schedule lifecycle calls
///
/// The subsystem serving a schedule is chosen from its kind when it is created
/// and remembered, so later calls never inspect the schedule again.
#[derive(Default)]
pub struct SchedulerService {
    schedulers: HashMap<ScheduleKindTag, Arc<dyn Scheduler>>,
    index: RwLock<HashMap<ScheduleId, ScheduleKindTag>>,
}

impl SchedulerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the subsystem for `scheduler.kind()`, replacing any previous one
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedulers.insert(scheduler.kind(), scheduler);
        self
    }

    /// Rebuild the kind index from every registered subsystem
    pub async fn rebuild_index(&self) -> Result<usize, ScheduleError> {
        let mut index = self.index.write().await;
        index.clear();
        for (tag, scheduler) in &self.schedulers {
            for id in scheduler.schedule_ids().await? {
                index.insert(id, *tag);
            }
        }
        info!(schedules = index.len(), "Schedule index rebuilt");
        Ok(index.len())
    }

    #[instrument(skip(self, kind), fields(schedule_id = %id, kind = %kind.tag()))]
    pub async fn create_schedule(
        &self,
        id: &ScheduleId,
        kind: &ScheduleKind,
    ) -> Result<(), ScheduleError> {
        let tag = kind.tag();
        let scheduler = self
            .schedulers
            .get(&tag)
            .ok_or_else(|| ScheduleError::UnsupportedKind(tag.to_string()))?;

        let mut index = self.index.write().await;
        if index.contains_key(id) {
            return Err(ScheduleError::AlreadyExists(id.to_string()));
        }
        scheduler.add_schedule(id, kind).await?;
        index.insert(id.clone(), tag);
        Ok(())
    }

    pub async fn create_schedule_by_data_threshold(
        &self,
        id: &ScheduleId,
        feed: &FeedId,
        threshold_bytes: u64,
    ) -> Result<(), ScheduleError> {
        let kind = ScheduleKind::DataVolume {
            feed: feed.clone(),
            threshold_bytes,
        };
        self.create_schedule(id, &kind).await
    }

    pub async fn create_time_schedule(
        &self,
        id: &ScheduleId,
        expression: &str,
        timezone: Tz,
    ) -> Result<(), ScheduleError> {
        let kind = ScheduleKind::Cron {
            expression: expression.to_string(),
            timezone,
        };
        self.create_schedule(id, &kind).await
    }

    pub async fn suspend_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        self.scheduler_for(id).await?.suspend_schedule(id).await
    }

    pub async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        self.scheduler_for(id).await?.resume_schedule(id).await
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    pub async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let scheduler = self.scheduler_for(id).await?;
        scheduler.delete_schedule(id).await?;
        self.index.write().await.remove(id);
        Ok(())
    }

    pub async fn schedule_state(&self, id: &ScheduleId) -> Result<ScheduleState, ScheduleError> {
        match self.scheduler_for(id).await {
            Ok(scheduler) => scheduler.schedule_state(id).await,
            Err(ScheduleError::NotFound(_)) => Ok(ScheduleState::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Kind of schedule `id`, if known
    pub async fn schedule_kind(&self, id: &ScheduleId) -> Option<ScheduleKindTag> {
        self.index.read().await.get(id).copied()
    }

    /// Schedules of `program`, ordered by key
    pub async fn schedules_for_program(&self, program: &ProgramId) -> Vec<ScheduleId> {
        let index = self.index.read().await;
        let mut ids: Vec<ScheduleId> = index
            .keys()
            .filter(|id| &id.program == program)
            .cloned()
            .collect();
        ids.sort_by_key(|id| id.key());
        ids
    }

    async fn scheduler_for(&self, id: &ScheduleId) -> Result<Arc<dyn Scheduler>, ScheduleError> {
        let tag = self
            .index
            .read()
            .await
            .get(id)
            .copied()
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        self.schedulers
            .get(&tag)
            .cloned()
            .ok_or_else(|| ScheduleError::UnsupportedKind(tag.to_string()))
    }
}
