use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{BatchOp, CacheBackend, CacheError, glob_matches};

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process backend with Redis-like TTL semantics (driven by `tokio::time`).
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("in-memory backend poisoned".into()))?;
        let now = Instant::now();
        map.retain(|_, e| e.live(now));
        Ok(map)
    }

    /// Remaining TTL of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let map = self.lock().ok()?;
        let at = map.get(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Command(format!("WRONGTYPE operation against key {key}"))
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.lock()?.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Stored::Str(v)) => Ok(Some(v.clone())),
            Some(Stored::Set(_)) => Err(wrong_type(key)),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let map = self.lock()?;
        Ok(keys
            .iter()
            .map(|k| match map.get(k).map(|e| &e.value) {
                Some(Stored::Str(v)) => Some(v.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        match map.get(key).map(|e| &e.value) {
            Some(Stored::Str(v)) if v == expected => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        match map.get_mut(key) {
            Some(entry) if matches!(&entry.value, Stored::Str(v) if v == expected) => {
                entry.value = Stored::Str(value.to_string());
                entry.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|k| glob_matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Set(set) => Ok(set.insert(member.to_string())),
            Stored::Str(_) => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        let (removed, now_empty) = match map.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Stored::Str(_)) => return Err(wrong_type(key)),
            Some(Stored::Set(set)) => (set.remove(member), set.is_empty()),
        };
        if now_empty {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        match self.lock()?.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Stored::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Stored::Str(_)) => Err(wrong_type(key)),
        }
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), CacheError> {
        let mut map = self.lock()?;
        for op in ops {
            match op {
                BatchOp::Set { key, value, ttl } => {
                    map.insert(
                        key,
                        Entry {
                            value: Stored::Str(value),
                            expires_at: expiry(ttl),
                        },
                    );
                }
                BatchOp::Del { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
