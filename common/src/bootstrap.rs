// Wiring helpers for binaries
//
// Each helper builds one collaborator from `Settings` and reports failures with
// context through anyhow.

use crate::config::{LockBackend, Settings, StoreBackend};
use crate::db::{DbPool, RedisPool};
use crate::launcher::{NatsProgramLauncher, ProgramLauncher};
use crate::lock::{DistributedLock, LocalLock, RedLock};
use crate::notify::{NatsClient, NatsNotifier, Notifier};
use crate::registry::ScheduleRegistry;
use crate::scheduler::{CronScheduler, SchedulerService};
use crate::storage::{FeedStorage, FileFeedStorage};
use crate::store::{InMemoryScheduleStore, PostgresScheduleStore, ScheduleStore};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Everything a coordinating node runs
pub struct Coordinator {
    pub registry: Arc<ScheduleRegistry>,
    pub service: SchedulerService,
    pub db_pool: Option<DbPool>,
}

impl Coordinator {
    /// Stop feed activity and close connections
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        if let Some(pool) = &self.db_pool {
            pool.close().await;
        }
    }
}

#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    db_pool
        .health_check()
        .await
        .context("Database is not healthy")?;
    Ok(db_pool)
}

#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<RedisPool> {
    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;
    redis_pool
        .health_check()
        .await
        .context("Redis is not healthy")?;
    Ok(redis_pool)
}

/// Connect to NATS and make sure the launch stream exists
#[tracing::instrument(skip(settings))]
pub async fn init_nats_client(settings: &Settings) -> Result<NatsClient> {
    let nats_client = NatsClient::new(settings.nats.clone())
        .await
        .context("Failed to initialize NATS client")?;
    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize launch stream")?;
    Ok(nats_client)
}

/// Schedule store for the configured backend, with the pool it uses
#[tracing::instrument(skip(settings))]
pub async fn init_schedule_store(
    settings: &Settings,
) -> Result<(Arc<dyn ScheduleStore>, Option<DbPool>)> {
    match settings.scheduler.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory schedule store; schedules will not survive restarts");
            Ok((Arc::new(InMemoryScheduleStore::new()), None))
        }
        StoreBackend::Postgres => {
            let db_pool = init_database_pool(settings).await?;
            let store = PostgresScheduleStore::new(db_pool.clone());
            store
                .ensure_schema()
                .await
                .context("Failed to prepare schedule table")?;
            Ok((Arc::new(store), Some(db_pool)))
        }
    }
}

#[tracing::instrument(skip(settings))]
pub async fn init_lock(settings: &Settings) -> Result<Arc<dyn DistributedLock>> {
    match settings.scheduler.lock_backend {
        LockBackend::Local => Ok(Arc::new(LocalLock::new())),
        LockBackend::Redis => {
            let redis_pool = init_redis_pool(settings).await?;
            Ok(Arc::new(RedLock::new(redis_pool)))
        }
    }
}

/// Filesystem feed storage, creating the root directory if needed
#[tracing::instrument(skip(settings))]
pub async fn init_feed_storage(settings: &Settings) -> Result<Arc<FileFeedStorage>> {
    let root = PathBuf::from(&settings.feeds.root_dir);
    if !root.exists() {
        tokio::fs::create_dir_all(&root)
            .await
            .context("Failed to create feed root directory")?;
        info!(path = %root.display(), "Created feed root directory");
    }
    Ok(Arc::new(FileFeedStorage::new(root)))
}

/// Build the registry and façade, then recover persisted schedules
#[tracing::instrument(skip(settings))]
pub async fn init_coordinator(settings: &Settings) -> Result<Coordinator> {
    let nats_client = init_nats_client(settings).await?;
    let notifier: Arc<dyn Notifier> = Arc::new(NatsNotifier::new(&nats_client));
    let launcher: Arc<dyn ProgramLauncher> = Arc::new(NatsProgramLauncher::new(nats_client));

    let (store, db_pool) = init_schedule_store(settings).await?;
    let lock = init_lock(settings).await?;
    let storage: Arc<dyn FeedStorage> = init_feed_storage(settings).await?;

    let registry = ScheduleRegistry::new(
        settings.registry_config(),
        store,
        storage,
        notifier,
        launcher.clone(),
        lock,
    );
    let recovered = registry
        .recover()
        .await
        .context("Failed to recover schedules")?;

    let service = SchedulerService::new()
        .with_scheduler(registry.clone())
        .with_scheduler(Arc::new(CronScheduler::new(launcher)));
    service
        .rebuild_index()
        .await
        .context("Failed to index schedules")?;

    info!(recovered, "Coordinator ready");
    Ok(Coordinator {
        registry,
        service,
        db_pool,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_needs_no_database() {
        let mut settings = Settings::default();
        settings.scheduler.store_backend = StoreBackend::Memory;
        settings.database.url = String::new();

        let (store, pool) = init_schedule_store(&settings).await.unwrap();
        assert!(pool.is_none());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_lock_backend() {
        let settings = Settings::default();
        let lock = init_lock(&settings).await.unwrap();
        let guard = lock
            .acquire("bootstrap", std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(guard.resource(), "bootstrap");
    }

    #[tokio::test]
    async fn test_feed_storage_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.feeds.root_dir = dir.path().join("feeds").display().to_string();

        init_feed_storage(&settings).await.unwrap();
        assert!(dir.path().join("feeds").is_dir());
    }
}
