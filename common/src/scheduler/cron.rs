// In-process time scheduler for cron schedules

use crate::errors::ScheduleError;
use crate::launcher::{ProgramLauncher, OPTION_LOGICAL_START_TIME, OPTION_SCHEDULE_NAME};
use crate::models::{
    LaunchOptions, ScheduleId, ScheduleKind, ScheduleKindTag, ScheduleState, ScheduleStatus,
};
use crate::schedule::{next_fire_time, parse_cron_expression};
use crate::scheduler::Scheduler;
use crate::telemetry;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use ::cron::Schedule as CronSchedule;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

struct CronEntry {
    schedule: CronSchedule,
    timezone: Tz,
    status: ScheduleStatus,
    timer: Option<JoinHandle<()>>,
}

impl CronEntry {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Launches programs on cron expressions; schedules live in memory only
pub struct CronScheduler {
    launcher: Arc<dyn ProgramLauncher>,
    entries: Mutex<HashMap<ScheduleId, CronEntry>>,
}

impl CronScheduler {
    pub fn new(launcher: Arc<dyn ProgramLauncher>) -> Self {
        Self {
            launcher,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_timer(&self, id: &ScheduleId, schedule: CronSchedule, timezone: Tz) -> JoinHandle<()> {
        let launcher = self.launcher.clone();
        let id = id.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_fire_time(&schedule, timezone, now) else {
                    info!(schedule_id = %id, "Cron expression has no further occurrences");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let mut options = LaunchOptions::new();
                options.insert(OPTION_SCHEDULE_NAME.to_string(), id.name.clone());
                options.insert(
                    OPTION_LOGICAL_START_TIME.to_string(),
                    next.timestamp_millis().to_string(),
                );

                if let Err(e) = launcher.launch(&id.program, id.program_type, &options).await {
                    telemetry::record_launch_failure(&id.key());
                    error!(schedule_id = %id, error = %e, "Failed to launch program");
                }
            }
        })
    }

    fn with_entry<T>(
        &self,
        id: &ScheduleId,
        f: impl FnOnce(&mut CronEntry) -> T,
    ) -> Result<T, ScheduleError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get_mut(id)
            .map(f)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            entry.stop_timer();
        }
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    fn kind(&self) -> ScheduleKindTag {
        ScheduleKindTag::Time
    }

    #[instrument(skip(self, kind), fields(schedule_id = %id))]
    async fn add_schedule(&self, id: &ScheduleId, kind: &ScheduleKind) -> Result<(), ScheduleError> {
        let ScheduleKind::Cron {
            expression,
            timezone,
        } = kind
        else {
            return Err(ScheduleError::UnsupportedKind(kind.tag().to_string()));
        };
        let schedule = parse_cron_expression(expression)?;

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(id) {
            return Err(ScheduleError::AlreadyExists(id.to_string()));
        }
        let timer = self.spawn_timer(id, schedule.clone(), *timezone);
        entries.insert(
            id.clone(),
            CronEntry {
                schedule,
                timezone: *timezone,
                status: ScheduleStatus::Scheduled,
                timer: Some(timer),
            },
        );
        info!(expression = %expression, timezone = %timezone, "Cron schedule created");
        Ok(())
    }

    async fn suspend_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        self.with_entry(id, |entry| {
            entry.stop_timer();
            entry.status = ScheduleStatus::Suspended;
        })
    }

    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let restart = self.with_entry(id, |entry| {
            if entry.status == ScheduleStatus::Scheduled {
                return None;
            }
            entry.status = ScheduleStatus::Scheduled;
            Some((entry.schedule.clone(), entry.timezone))
        })?;

        if let Some((schedule, timezone)) = restart {
            let timer = self.spawn_timer(id, schedule, timezone);
            self.with_entry(id, |entry| entry.timer = Some(timer))?;
        }
        Ok(())
    }

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut entry = entries
            .remove(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        entry.stop_timer();
        Ok(())
    }

    async fn schedule_state(&self, id: &ScheduleId) -> Result<ScheduleState, ScheduleError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(id)
            .map_or(ScheduleState::NotFound, |entry| entry.status.into()))
    }

    async fn schedule_ids(&self) -> Result<Vec<ScheduleId>, ScheduleError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.keys().cloned().collect())
    }
}
