// Per-schedule mutual exclusion
//
// Every mutation of a schedule record (lifecycle call or trigger evaluation)
// runs under the lock named after the schedule key. `LocalLock` covers a single
// process; `RedLock` covers replicas sharing one Redis.

use crate::db::RedisPool;
use crate::errors::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `resource`, held until the guard is dropped or `ttl` expires
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, StorageError>;
}

enum Release {
    Local(OwnedMutexGuard<()>),
    Redis { pool: RedisPool, lock_value: String },
}

/// Held lock; released on drop
pub struct LockGuard {
    resource: String,
    acquired_at: Instant,
    release: Option<Release>,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.release.take() {
            Some(Release::Redis { pool, lock_value }) => {
                let resource = std::mem::take(&mut self.resource);
                // Drop may run outside a runtime during shutdown; the TTL frees the key then
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        if let Err(e) = release_lock(&pool, &resource, &lock_value).await {
                            warn!(resource = %resource, error = %e, "Failed to release lock on drop");
                        }
                    });
                }
            }
            Some(Release::Local(_guard)) => {}
            None => {}
        }
    }
}

/// In-process lock keyed by resource name
#[derive(Default)]
pub struct LocalLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, resource: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Drop entries nobody holds or waits on
        locks.retain(|key, lock| key == resource || Arc::strong_count(lock) > 1);
        locks
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    /// Waits at most `ttl` for the current holder
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, StorageError> {
        let mutex = self.entry(resource);
        let guard = tokio::time::timeout(ttl, mutex.lock_owned())
            .await
            .map_err(|_| {
                StorageError::ConnectionFailed(format!(
                    "Timed out after {:?} waiting for lock {}",
                    ttl, resource
                ))
            })?;

        Ok(LockGuard {
            resource: resource.to_string(),
            acquired_at: Instant::now(),
            release: Some(Release::Local(guard)),
        })
    }
}

/// Redis lock using SET NX PX with an owner token
pub struct RedLock {
    pool: RedisPool,
    retry_count: u32,
    retry_delay: Duration,
}

impl RedLock {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            retry_count: 25,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry(pool: RedisPool, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            pool,
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    async fn try_acquire_once(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, StorageError> {
        let mut conn = self.pool.get_connection();
        let lock_value = Uuid::new_v4().to_string();

        let result: Option<String> = redis::cmd("SET")
            .arg(lock_key(resource))
            .arg(&lock_value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| LockGuard {
            resource: resource.to_string(),
            acquired_at: Instant::now(),
            release: Some(Release::Redis {
                pool: self.pool.clone(),
                lock_value,
            }),
        }))
    }
}

#[async_trait]
impl DistributedLock for RedLock {
    #[instrument(skip(self), fields(resource = %resource, ttl_ms = ttl.as_millis() as u64))]
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, StorageError> {
        for attempt in 1..=self.retry_count {
            if let Some(guard) = self.try_acquire_once(resource, ttl).await? {
                debug!(attempt, "Lock acquired");
                return Ok(guard);
            }
            if attempt < self.retry_count {
                sleep(self.retry_delay).await;
            }
        }

        warn!(attempts = self.retry_count, "Lock still held after all retries");
        Err(StorageError::RedisError(format!(
            "Lock already held for resource: {}",
            resource
        )))
    }
}

fn lock_key(resource: &str) -> String {
    format!("volume-scheduler:lock:{}", resource)
}

/// Delete the key only if it still carries our token
async fn release_lock(
    pool: &RedisPool,
    resource: &str,
    lock_value: &str,
) -> Result<(), StorageError> {
    let mut conn = pool.get_connection();
    let script = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#;

    let result: i32 = redis::Script::new(script)
        .key(lock_key(resource))
        .arg(lock_value)
        .invoke_async(&mut conn)
        .await?;

    if result == 1 {
        debug!(resource = %resource, "Lock released");
    } else {
        warn!(resource = %resource, "Lock expired before release");
    }
    Ok(())
}
