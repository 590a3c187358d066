//! Write-coalescing, read-caching registry for high-frequency values (positions).
//!
//! `put` and `remove` land in a local write buffer and read cache; a background
//! task flushes the buffer as one batch at most every `flush_interval` and
//! refreshes cached keys from the backend every `refresh_interval` to pick up
//! other instances' writes. Repeated writes to one key replace each other, so
//! the buffer never holds more than one op per key. `direct_*` bypass the buffer.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use atlas_core::Tenant;

use crate::cache::{BatchOp, CacheBackend};
use crate::registry::{RegistryError, tenant_key};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct CoalescedConfig {
    pub flush_interval: Duration,
    pub refresh_interval: Duration,
}

impl Default for CoalescedConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl CoalescedConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
enum WriteOp<V> {
    Put(V),
    Removed,
}

struct Inner<B, V> {
    backend: B,
    namespace: String,
    write_buf: Mutex<HashMap<String, WriteOp<V>>>,
    cache: RwLock<HashMap<String, V>>,
}

pub struct CoalescedRegistry<B, K, V> {
    inner: Arc<Inner<B, V>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    _key: PhantomData<fn() -> K>,
}

impl<B, K, V> core::fmt::Debug for CoalescedRegistry<B, K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoalescedRegistry")
            .field("namespace", &self.inner.namespace)
            .finish_non_exhaustive()
    }
}

impl<B, V> Inner<B, V>
where
    B: CacheBackend,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn pending(&self, key: &str) -> Result<Option<WriteOp<V>>, RegistryError> {
        let buf = self.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(buf.get(key).cloned())
    }

    fn cached(&self, key: &str) -> Result<Option<V>, RegistryError> {
        let cache = self.cache.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(cache.get(key).cloned())
    }

    fn cache_put(&self, key: String, value: V) -> Result<(), RegistryError> {
        let mut cache = self.cache.write().map_err(|_| RegistryError::Poisoned)?;
        cache.insert(key, value);
        Ok(())
    }

    async fn direct_get(&self, key: &str) -> Result<Option<V>, RegistryError> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let value: V = serde_json::from_str(&raw)?;
        self.cache_put(key.to_string(), value.clone())?;
        Ok(Some(value))
    }

    async fn flush(&self) -> Result<usize, RegistryError> {
        let drained: Vec<(String, WriteOp<V>)> = {
            let mut buf = self.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
            buf.drain().collect()
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(drained.len());
        for (key, op) in &drained {
            ops.push(match op {
                WriteOp::Put(value) => BatchOp::Set {
                    key: key.clone(),
                    value: serde_json::to_string(value)?,
                    ttl: None,
                },
                WriteOp::Removed => BatchOp::Del { key: key.clone() },
            });
        }

        if let Err(err) = self.backend.write_batch(ops).await {
            // Put back whatever has not been superseded since the drain.
            let mut buf = self.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
            for (key, op) in drained {
                buf.entry(key).or_insert(op);
            }
            return Err(err.into());
        }
        Ok(drained.len())
    }

    async fn refresh(&self) -> Result<(), RegistryError> {
        let keys: Vec<String> = {
            let cache = self.cache.read().map_err(|_| RegistryError::Poisoned)?;
            cache.keys().cloned().collect()
        };
        if keys.is_empty() {
            return Ok(());
        }
        let values = self.backend.mget(&keys).await?;

        let buf = self.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
        let mut cache = self.cache.write().map_err(|_| RegistryError::Poisoned)?;
        for (key, raw) in keys.into_iter().zip(values) {
            if buf.contains_key(&key) {
                continue;
            }
            match raw.map(|r| serde_json::from_str::<V>(&r)) {
                Some(Ok(value)) => {
                    cache.insert(key, value);
                }
                Some(Err(err)) => {
                    warn!(key = %key, error = %err, "dropping undecodable cached value");
                    cache.remove(&key);
                }
                None => {
                    cache.remove(&key);
                }
            }
        }
        Ok(())
    }
}

impl<B, K, V> CoalescedRegistry<B, K, V>
where
    B: CacheBackend,
    K: core::fmt::Display,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Build the registry and start its flush/refresh task on the current runtime.
    pub fn spawn(backend: B, namespace: impl Into<String>, config: CoalescedConfig) -> Self {
        let inner = Arc::new(Inner {
            backend,
            namespace: namespace.into(),
            write_buf: Mutex::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        });
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(inner.clone(), config, rx));
        Self {
            inner,
            shutdown,
            task: Mutex::new(Some(task)),
            _key: PhantomData,
        }
    }

    fn key(&self, tenant: &Tenant, key: &K) -> String {
        tenant_key(&self.inner.namespace, tenant, key)
    }

    /// Buffer, then cache, then backend.
    pub async fn get(&self, tenant: &Tenant, key: &K) -> Result<Option<V>, RegistryError> {
        let key = self.key(tenant, key);
        match self.inner.pending(&key)? {
            Some(WriteOp::Put(value)) => return Ok(Some(value)),
            Some(WriteOp::Removed) => return Ok(None),
            None => {}
        }
        if let Some(value) = self.inner.cached(&key)? {
            return Ok(Some(value));
        }
        self.inner.direct_get(&key).await
    }

    pub async fn exists(&self, tenant: &Tenant, key: &K) -> Result<bool, RegistryError> {
        Ok(self.get(tenant, key).await?.is_some())
    }

    pub fn put(&self, tenant: &Tenant, key: &K, value: V) -> Result<(), RegistryError> {
        let key = self.key(tenant, key);
        {
            let mut buf = self.inner.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
            buf.insert(key.clone(), WriteOp::Put(value.clone()));
        }
        self.inner.cache_put(key, value)
    }

    pub fn remove(&self, tenant: &Tenant, key: &K) -> Result<(), RegistryError> {
        let key = self.key(tenant, key);
        {
            let mut buf = self.inner.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
            buf.insert(key.clone(), WriteOp::Removed);
        }
        let mut cache = self.inner.cache.write().map_err(|_| RegistryError::Poisoned)?;
        cache.remove(&key);
        Ok(())
    }

    /// Read straight from the backend (and refresh the cache).
    pub async fn direct_get(&self, tenant: &Tenant, key: &K) -> Result<Option<V>, RegistryError> {
        self.inner.direct_get(&self.key(tenant, key)).await
    }

    /// Write straight to the backend, discarding any buffered op for the key.
    pub async fn direct_put(&self, tenant: &Tenant, key: &K, value: V) -> Result<(), RegistryError> {
        let key = self.key(tenant, key);
        let raw = serde_json::to_string(&value)?;
        self.inner.backend.set(&key, &raw, None).await?;
        {
            let mut buf = self.inner.write_buf.lock().map_err(|_| RegistryError::Poisoned)?;
            buf.remove(&key);
        }
        self.inner.cache_put(key, value)
    }

    pub async fn flush(&self) -> Result<usize, RegistryError> {
        self.inner.flush().await
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.write_buf.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Stop the background task after a final flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(namespace = %self.inner.namespace, error = %err, "coalesced flush task ended abnormally");
            }
        }
    }
}

async fn run<B, V>(inner: Arc<Inner<B, V>>, config: CoalescedConfig, mut shutdown: watch::Receiver<bool>)
where
    B: CacheBackend,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut flush = tokio::time::interval(config.flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut refresh = tokio::time::interval(config.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = flush.tick() => {
                if let Err(err) = inner.flush().await {
                    warn!(namespace = %inner.namespace, error = %err, "coalesced flush failed, will retry");
                }
            }
            _ = refresh.tick() => {
                if let Err(err) = inner.refresh().await {
                    debug!(namespace = %inner.namespace, error = %err, "coalesced refresh failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(err) = inner.flush().await {
        warn!(namespace = %inner.namespace, error = %err, "final coalesced flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBackend;
    use crate::registry::test_support::tenant;
    use atlas_core::CharacterId;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i16,
        y: i16,
    }

    fn registry(backend: &InMemoryBackend) -> CoalescedRegistry<InMemoryBackend, CharacterId, Position> {
        CoalescedRegistry::spawn(
            backend.clone(),
            "position",
            CoalescedConfig::default().with_refresh_interval(Duration::from_secs(60)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn writes_coalesce_until_the_flush_tick() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend);
        let t = tenant("GMS");

        for x in 0..50 {
            registry.put(&t, &CharacterId(1), Position { x, y: 0 }).unwrap();
        }
        assert_eq!(registry.pending_writes(), 1);
        assert_eq!(
            registry.get(&t, &CharacterId(1)).await.unwrap(),
            Some(Position { x: 49, y: 0 })
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.pending_writes(), 0);
        let stored = backend
            .get(&format!("atlas:position:{}:1", t.id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(serde_json::from_str::<Position>(&stored).unwrap().x, 49);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_tombstones_locally_and_flushes_delete() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend);
        let t = tenant("GMS");

        registry
            .direct_put(&t, &CharacterId(2), Position { x: 1, y: 1 })
            .await
            .unwrap();
        registry.remove(&t, &CharacterId(2)).unwrap();
        assert!(!registry.exists(&t, &CharacterId(2)).await.unwrap());

        registry.flush().await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_writes() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend);
        let t = tenant("GMS");
        registry.put(&t, &CharacterId(3), Position { x: 5, y: 5 }).unwrap();
        registry.shutdown().await;
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_picks_up_other_writers() {
        let backend = InMemoryBackend::new();
        let registry = CoalescedRegistry::<_, CharacterId, Position>::spawn(
            backend.clone(),
            "position",
            CoalescedConfig::default().with_refresh_interval(Duration::from_millis(200)),
        );
        let t = tenant("GMS");
        registry
            .direct_put(&t, &CharacterId(4), Position { x: 0, y: 0 })
            .await
            .unwrap();

        let raw = serde_json::to_string(&Position { x: 9, y: 9 }).unwrap();
        backend
            .set(&format!("atlas:position:{}:4", t.id()), &raw, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(
            registry.get(&t, &CharacterId(4)).await.unwrap(),
            Some(Position { x: 9, y: 9 })
        );
    }
}
