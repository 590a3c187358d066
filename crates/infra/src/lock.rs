//! Advisory distributed mutex over the cache backend.
//!
//! `SET key token NX PX ttl` acquires, a compare-and-delete on the token
//! releases. Acquisition polls until `acquire_timeout`, then force-acquires so a
//! crashed holder cannot wedge the fleet; callers must treat the lock as advisory.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheBackend, CacheError};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock key for one inventory compartment of one owner.
pub fn inventory_lock_key(owner: u32, inventory_type: u8) -> String {
    format!("invlock:{owner}:{inventory_type}")
}

#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl LockConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

/// Proof of acquisition; hand back to [`DistributedMutex::unlock`].
#[derive(Debug)]
#[must_use = "a lock guard must be released with DistributedMutex::unlock"]
pub struct LockGuard {
    key: String,
    token: String,
    forced: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the lock was taken over after the acquire timeout.
    pub fn forced(&self) -> bool {
        self.forced
    }
}

#[derive(Debug, Clone)]
pub struct DistributedMutex<B> {
    backend: B,
    config: LockConfig,
}

impl<B: CacheBackend> DistributedMutex<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, LockConfig::default())
    }

    pub fn with_config(backend: B, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub async fn lock(&self, key: &str) -> Result<LockGuard, CacheError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self
                .backend
                .set_nx(key, &token, Some(self.config.ttl))
                .await?
            {
                debug!(lock_key = key, "lock acquired");
                return Ok(LockGuard {
                    key: key.to_string(),
                    token,
                    forced: false,
                });
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            lock_key = key,
            waited_ms = self.config.acquire_timeout.as_millis() as u64,
            "lock acquire timed out, force-acquiring"
        );
        self.backend
            .set(key, &token, Some(self.config.ttl))
            .await?;
        Ok(LockGuard {
            key: key.to_string(),
            token,
            forced: true,
        })
    }

    /// Release a lock. Returns `false` if another holder took it over meanwhile.
    pub async fn unlock(&self, guard: LockGuard) -> Result<bool, CacheError> {
        let released = self
            .backend
            .compare_and_delete(&guard.key, &guard.token)
            .await?;
        if !released {
            debug!(lock_key = %guard.key, "lock no longer held at release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBackend;

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let backend = InMemoryBackend::new();
        let mutex = DistributedMutex::new(backend.clone());
        let first = mutex.lock("invlock:1:2").await.unwrap();

        let contender = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock("invlock:1:2").await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!contender.is_finished());

        assert!(mutex.unlock(first).await.unwrap());
        let second = contender.await.unwrap().unwrap();
        assert!(!second.forced());
        assert!(mutex.unlock(second).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_is_overridden_after_timeout() {
        let backend = InMemoryBackend::new();
        backend.set("invlock:9:1", "crashed", None).await.unwrap();

        let mutex = DistributedMutex::new(backend.clone());
        let guard = mutex.lock("invlock:9:1").await.unwrap();
        assert!(guard.forced());

        // The crashed holder can no longer release someone else's lock.
        assert!(!backend.compare_and_delete("invlock:9:1", "crashed").await.unwrap());
        assert!(mutex.unlock(guard).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_after_takeover_reports_false() {
        let backend = InMemoryBackend::new();
        let mutex = DistributedMutex::with_config(
            backend.clone(),
            LockConfig::default().with_ttl(Duration::from_millis(100)),
        );
        let guard = mutex.lock("k").await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        let other = mutex.lock("k").await.unwrap();
        assert!(!mutex.unlock(guard).await.unwrap());
        assert!(mutex.unlock(other).await.unwrap());
        assert_eq!(inventory_lock_key(7, 4), "invlock:7:4");
    }
}
