//! Key/value cache seam shared by every Redis-shaped registry.
//!
//! Registries only need a handful of primitives: string get/set with optional
//! TTL, set-if-absent, compare-and-delete, compare-and-set, prefix scans, sets, and a batched
//! write. [`RedisBackend`] maps them onto Redis commands; [`InMemoryBackend`]
//! reproduces the same semantics in process for tests and local runs.

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use atlas_core::{Classified, CoreError, ErrorKind};

pub use memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache command failed: {0}")]
    Command(String),
}

impl Classified for CacheError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        CoreError::transient(err.to_string())
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
}

#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Values for `keys`, positionally; missing keys are `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Set only if absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<bool, CacheError>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Overwrite `key` with `value` only while it still holds `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Keys matching a glob pattern (`*` wildcards).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Apply every op or none.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), CacheError>;
}

#[async_trait]
impl<B> CacheBackend for Arc<B>
where
    B: CacheBackend + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        (**self).mget(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        (**self).set_nx(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        (**self).del(key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        (**self).compare_and_delete(key, expected).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        (**self).compare_and_set(key, expected, value, ttl).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        (**self).scan(pattern).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        (**self).sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        (**self).srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        (**self).smembers(key).await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), CacheError> {
        (**self).write_batch(ops).await
    }
}

/// Minimal glob matcher for `SCAN MATCH` patterns built by the registries.
pub(crate) fn glob_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::glob_matches;

    #[test]
    fn glob_handles_prefix_and_infix_wildcards() {
        assert!(glob_matches("atlas:chair:*", "atlas:chair:t1:7"));
        assert!(!glob_matches("atlas:chair:*", "atlas:pet:t1:7"));
        assert!(glob_matches("reservation:*:7:*", "reservation:t1:7:2:3"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
        assert!(glob_matches("a*", "a"));
    }
}
