//! Distributed mutual exclusion keyed by actor.
//!
//! A lock is a cache entry `lock:{actor}` holding an owner tag and the
//! acquisition time. Acquisition is set-if-absent with a short TTL; release
//! is compare-and-delete on the owner tag, so a slow caller can never free a
//! lock that expired and was re-acquired by someone else. A janitor scans for
//! entries whose recorded age exceeds a generous multiple of the TTL and
//! force-clears them, guarding against leaked locks from crashed holders.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::ports::{Cache, CacheError};

const LOCK_PREFIX: &str = "lock:";

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// A lock older than `ttl_secs * stale_multiplier` is considered leaked.
    pub stale_multiplier: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            max_attempts: 5,
            backoff_ms: 100,
            stale_multiplier: 5,
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    cache: Arc<dyn Cache>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(cache: Arc<dyn Cache>, config: LockConfig) -> Self {
        Self { cache, config }
    }

    /// Acquire the lock for `resource`, retrying with linear backoff up to
    /// the configured bound. Exhaustion is contention, not a hard error.
    pub async fn acquire(&self, resource: &str) -> Result<LockGuard, CoreError> {
        let key = format!("{}{}", LOCK_PREFIX, resource);
        let value = format!("{}|{}", Uuid::new_v4(), Utc::now().timestamp_millis());

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(self.config.backoff_ms * attempt as u64);
                tokio::time::sleep(backoff).await;
            }
            if self
                .cache
                .set_nx_ex(&key, &value, self.config.ttl_secs)
                .await?
            {
                debug!(resource, "lock acquired");
                return Ok(LockGuard {
                    cache: self.cache.clone(),
                    key,
                    value,
                    released: false,
                });
            }
        }

        Err(CoreError::Busy(resource.to_string()))
    }

    /// Acquire locks for several resources. Keys are sorted and deduplicated
    /// here so that every caller contends in the same fixed total order.
    /// On any failure the already-held locks are released before returning.
    pub async fn acquire_all(&self, resources: &[String]) -> Result<Vec<LockGuard>, CoreError> {
        let mut ordered: Vec<&String> = resources.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for resource in ordered {
            match self.acquire(resource).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    for guard in guards {
                        if let Err(release_err) = guard.release().await {
                            warn!(error = %release_err, "failed to release lock while unwinding");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(guards)
    }

    /// One janitor pass: force-clear locks whose recorded age exceeds the
    /// staleness horizon. Compare-and-delete against the observed value so a
    /// lock re-acquired in the meantime is left alone.
    pub async fn clear_stale(&self) -> Result<u32, CoreError> {
        let horizon_ms = (self.config.ttl_secs * 1000 * self.config.stale_multiplier as u64) as i64;
        let now_ms = Utc::now().timestamp_millis();
        let mut cleared = 0;

        for key in self.cache.scan_prefix(LOCK_PREFIX).await? {
            let Some(value) = self.cache.get(&key).await? else {
                continue;
            };
            let Some(acquired_at_ms) = lock_acquired_at(&value) else {
                continue;
            };
            if now_ms - acquired_at_ms > horizon_ms
                && self.cache.compare_and_delete(&key, &value).await?
            {
                warn!(key, age_ms = now_ms - acquired_at_ms, "cleared leaked lock");
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Long-lived janitor loop.
    pub async fn run_janitor(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.clear_stale().await {
                warn!(error = %e, "lock janitor pass failed");
            }
        }
    }
}

/// Scoped lock handle. `release` is the only legal path to free the lock
/// early; a guard dropped without it schedules a best-effort release so
/// every exit path, including panics, lets go of the resource.
pub struct LockGuard {
    cache: Arc<dyn Cache>,
    key: String,
    value: String,
    released: bool,
}

impl LockGuard {
    /// Compare-and-delete release. Returns false when the lock had already
    /// expired and is no longer ours to free.
    pub async fn release(mut self) -> Result<bool, CacheError> {
        self.released = true;
        let deleted = self.cache.compare_and_delete(&self.key, &self.value).await?;
        if !deleted {
            warn!(key = %self.key, "lock expired before release");
        }
        Ok(deleted)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        let value = std::mem::take(&mut self.value);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = cache.compare_and_delete(&key, &value).await;
            });
        }
        // Without a runtime the TTL reclaims the lock.
    }
}

fn lock_acquired_at(value: &str) -> Option<i64> {
    value.split_once('|')?.1.parse().ok()
}
