//! Tenant-partitioned key/value registries.
//!
//! Every registry answers the same contract ([`TenantRegistry`]): lookups for a
//! missing key are `Ok(None)`, writes are last-writer-wins, `add` refuses to
//! overwrite, and nothing issued for one tenant observes another tenant's
//! entries. Only [`TenantRegistry::get_all_cross_tenant`] crosses that line, and
//! it exists for timeout sweeps.
//!
//! Sweeps and state machines that read, decide, then write go through the
//! compare operations so a concurrent writer is never clobbered.

mod in_memory;
mod redis_registry;
mod set;

use std::sync::Arc;

use async_trait::async_trait;

use atlas_core::{Classified, CoreError, ErrorKind, Tenant};

use crate::cache::CacheError;

pub use in_memory::InMemoryRegistry;
pub use redis_registry::RedisRegistry;
pub use set::{CharacterMapRegistry, RedisSetRegistry};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already present")]
    AlreadyPresent(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0} kept changing under concurrent writers")]
    Contended(String),

    #[error("malformed registry value: {0}")]
    Codec(String),

    #[error("registry lock poisoned")]
    Poisoned,
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Codec(err.to_string())
    }
}

impl Classified for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::AlreadyPresent(_) => ErrorKind::AlreadyExists,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::Cache(_) | RegistryError::Contended(_) => ErrorKind::Transient,
            RegistryError::Codec(_) | RegistryError::Poisoned => ErrorKind::Fatal,
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err.kind() {
            ErrorKind::AlreadyExists => CoreError::already_exists(err.to_string()),
            ErrorKind::NotFound => CoreError::not_found(err.to_string()),
            ErrorKind::Transient => CoreError::transient(err.to_string()),
            _ => CoreError::fatal(err.to_string()),
        }
    }
}

#[async_trait]
pub trait TenantRegistry<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: PartialEq + Send + Sync + 'static,
{
    async fn get(&self, tenant: &Tenant, key: &K) -> Result<Option<V>, RegistryError>;

    async fn set(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError>;

    /// Insert only if absent; otherwise [`RegistryError::AlreadyPresent`].
    async fn add(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError>;

    /// Returns whether the key existed.
    async fn remove(&self, tenant: &Tenant, key: &K) -> Result<bool, RegistryError>;

    /// Remove the entry only while it still equals `expected`. Returns whether it was removed.
    async fn compare_and_remove(&self, tenant: &Tenant, key: &K, expected: &V) -> Result<bool, RegistryError>;

    /// Replace the entry with `value` only while it still equals `expected`.
    /// Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        tenant: &Tenant,
        key: K,
        expected: &V,
        value: V,
    ) -> Result<bool, RegistryError>;

    async fn get_all(&self, tenant: &Tenant) -> Result<Vec<V>, RegistryError>;

    /// Every entry of every tenant. For sweeps and administration only.
    async fn get_all_cross_tenant(&self) -> Result<Vec<(Tenant, K, V)>, RegistryError>;
}

#[async_trait]
impl<K, V, R> TenantRegistry<K, V> for Arc<R>
where
    K: Send + Sync + 'static,
    V: PartialEq + Send + Sync + 'static,
    R: TenantRegistry<K, V> + ?Sized,
{
    async fn get(&self, tenant: &Tenant, key: &K) -> Result<Option<V>, RegistryError> {
        (**self).get(tenant, key).await
    }

    async fn set(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError> {
        (**self).set(tenant, key, value).await
    }

    async fn add(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError> {
        (**self).add(tenant, key, value).await
    }

    async fn remove(&self, tenant: &Tenant, key: &K) -> Result<bool, RegistryError> {
        (**self).remove(tenant, key).await
    }

    async fn compare_and_remove(&self, tenant: &Tenant, key: &K, expected: &V) -> Result<bool, RegistryError> {
        (**self).compare_and_remove(tenant, key, expected).await
    }

    async fn compare_and_swap(
        &self,
        tenant: &Tenant,
        key: K,
        expected: &V,
        value: V,
    ) -> Result<bool, RegistryError> {
        (**self).compare_and_swap(tenant, key, expected, value).await
    }

    async fn get_all(&self, tenant: &Tenant) -> Result<Vec<V>, RegistryError> {
        (**self).get_all(tenant).await
    }

    async fn get_all_cross_tenant(&self) -> Result<Vec<(Tenant, K, V)>, RegistryError> {
        (**self).get_all_cross_tenant().await
    }
}

/// `atlas:<namespace>:<tenant_id>:<key>`.
pub(crate) fn tenant_key(namespace: &str, tenant: &Tenant, key: impl core::fmt::Display) -> String {
    format!("atlas:{namespace}:{}:{key}", tenant.id())
}

pub(crate) fn tenant_pattern(namespace: &str, tenant: &Tenant) -> String {
    format!("atlas:{namespace}:{}:*", tenant.id())
}

pub(crate) fn namespace_pattern(namespace: &str) -> String {
    format!("atlas:{namespace}:*")
}

#[cfg(test)]
pub(crate) mod test_support {
    use atlas_core::{Tenant, TenantId};

    pub fn tenant(region: &str) -> Tenant {
        Tenant::new(TenantId::new(), region, 83, 1).unwrap()
    }
}
