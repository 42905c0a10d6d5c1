//! TTL-based distributed mutex for accelerator-bound calls.
//!
//! A [`ResourceLock`] grants at most one holder system-wide by setting a key
//! in a shared [`LockStore`] only if it is absent. Waiters poll at a fixed
//! interval until the key is theirs or the TTL has elapsed. There is no
//! fairness among waiters.
//!
//! The key is removed after the protected call whatever its outcome. If
//! removal is skipped (crash, lost connection) the TTL bounds how long the
//! key can outlive its holder.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{PipelineError, Result};

/// Shared key store with set-if-absent semantics.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key = token` with `ttl` if `key` is absent. Returns whether it was set.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

// ============ Memory store ============

/// Process-local store. Only serializes holders inside one process.
#[derive(Default)]
pub struct MemoryLockStore {
    keys: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| PipelineError::LockStore("memory lock store poisoned".into()))?;
        let now = Instant::now();
        if let Some((_, expires)) = keys.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        keys.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| PipelineError::LockStore("memory lock store poisoned".into()))?;
        if keys.get(key).map(|(t, _)| t == token).unwrap_or(false) {
            keys.remove(key);
        }
        Ok(())
    }
}

// ============ Redis store ============

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed store shared by every worker process.
#[derive(Clone)]
pub struct RedisLockStore {
    connection: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        // SET NX PX: atomic set-if-absent with expiry
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        // Redis returns "OK" if set, nil if the key existed
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

// ============ Resource lock ============

#[derive(Clone)]
pub struct ResourceLock {
    store: Arc<dyn LockStore>,
    key: String,
    ttl: Duration,
    poll_interval: Duration,
}

impl ResourceLock {
    pub fn new(
        store: Arc<dyn LockStore>,
        key: impl Into<String>,
        ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            poll_interval,
        }
    }

    pub fn from_config(store: Arc<dyn LockStore>, config: &LockConfig) -> Self {
        Self::new(
            store,
            config.key.clone(),
            Duration::from_secs(config.ttl_secs),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    /// Run `f` while holding the lock.
    ///
    /// Blocks (polling) for at most the TTL, then fails with
    /// [`PipelineError::LockTimeout`] without running `f`.
    pub async fn with_exclusive_access<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = Uuid::new_v4().to_string();
        self.acquire(&token).await?;

        let outcome = f().await;

        if let Err(e) = self.store.release(&self.key, &token).await {
            tracing::warn!(key = %self.key, error = %e, "failed to release lock; it will expire with its TTL");
        }
        outcome
    }

    async fn acquire(&self, token: &str) -> Result<()> {
        let start = Instant::now();
        let mut waited = false;
        loop {
            if self.store.try_acquire(&self.key, token, self.ttl).await? {
                if waited {
                    tracing::debug!(key = %self.key, waited_ms = start.elapsed().as_millis() as u64, "lock acquired after wait");
                }
                return Ok(());
            }
            if start.elapsed() >= self.ttl {
                tracing::warn!(key = %self.key, "timed out waiting for lock");
                return Err(PipelineError::LockTimeout(self.ttl));
            }
            waited = true;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock(store: Arc<dyn LockStore>, ttl_ms: u64) -> ResourceLock {
        ResourceLock::new(
            store,
            "gpu_lock",
            Duration::from_millis(ttl_ms),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn concurrent_holders_are_exclusive() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock(store.clone(), 5_000);
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                lock.with_exclusive_access(|| async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn released_after_error() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let lock = lock(store.clone(), 1_000);

        let result: Result<()> = lock
            .with_exclusive_access(|| async { Err(PipelineError::Embedding("boom".into())) })
            .await;
        assert!(result.is_err());

        assert!(store
            .try_acquire("gpu_lock", "other", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn times_out_when_held() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        store
            .try_acquire("gpu_lock", "someone", Duration::from_secs(60))
            .await
            .unwrap();
        let lock = lock(store, 50);

        let ran = AtomicUsize::new(0);
        let err = lock
            .with_exclusive_access(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::LockTimeout(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_holder_expires() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        // A crashed holder that never releases.
        store
            .try_acquire("gpu_lock", "crashed", Duration::from_millis(30))
            .await
            .unwrap();
        let lock = lock(store, 500);

        let value = lock.with_exclusive_access(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn release_ignores_foreign_token() {
        let store = MemoryLockStore::new();
        store
            .try_acquire("k", "mine", Duration::from_secs(60))
            .await
            .unwrap();
        store.release("k", "theirs").await.unwrap();
        assert!(!store
            .try_acquire("k", "theirs", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
