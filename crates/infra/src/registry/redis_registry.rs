use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use atlas_core::Tenant;

use super::{RegistryError, TenantRegistry, namespace_pattern, tenant_key, tenant_pattern};
use crate::cache::CacheBackend;

/// Stored value: the owning tenant and key travel with the value so that a
/// cross-tenant scan can rebuild all three from the payload alone.
#[derive(Serialize, Deserialize)]
struct Record<K, V> {
    tenant: Tenant,
    key: K,
    value: V,
}

#[derive(Serialize)]
struct RecordRef<'a, K, V> {
    tenant: &'a Tenant,
    key: &'a K,
    value: &'a V,
}

/// Registry over a [`CacheBackend`], keyed `atlas:<namespace>:<tenant_id>:<key>`.
#[derive(Debug)]
pub struct RedisRegistry<B, K, V> {
    backend: B,
    namespace: String,
    ttl: Option<Duration>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<B, K, V> RedisRegistry<B, K, V> {
    pub fn new(backend: B, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            ttl: None,
            _marker: PhantomData,
        }
    }

    /// Expire every entry `ttl` after its last write.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl<B, K, V> RedisRegistry<B, K, V>
where
    B: CacheBackend,
    K: Serialize + DeserializeOwned + core::fmt::Display + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(tenant: &Tenant, key: &K, value: &V) -> Result<String, RegistryError> {
        Ok(serde_json::to_string(&RecordRef { tenant, key, value })?)
    }

    /// Raw stored value and its decoded record. The raw form is what the
    /// compare primitives check against.
    async fn load(&self, redis_key: &str) -> Result<Option<(String, Record<K, V>)>, RegistryError> {
        let Some(raw) = self.backend.get(redis_key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw)?;
        Ok(Some((raw, record)))
    }

    async fn records(&self, pattern: &str) -> Result<Vec<Record<K, V>>, RegistryError> {
        let keys = self.backend.scan(pattern).await?;
        let values = self.backend.mget(&keys).await?;
        let mut out = Vec::with_capacity(values.len());
        for raw in values.into_iter().flatten() {
            match serde_json::from_str::<Record<K, V>>(&raw) {
                Ok(record) => out.push(record),
                Err(err) => {
                    tracing::warn!(namespace = %self.namespace, error = %err, "skipping malformed registry entry")
                }
            }
        }
        Ok(out)
    }
}

/// Bound on read-compare-write retries while other writers keep changing a key.
const MAX_ATTEMPTS: usize = 16;

// Keys carry only the tenant id, so a record written by another tenant with the
// same id (different region or version) can sit under this tenant's key. Every
// operation treats such a record as absent: reads skip it, removals leave it,
// and writes replace it.
#[async_trait]
impl<B, K, V> TenantRegistry<K, V> for RedisRegistry<B, K, V>
where
    B: CacheBackend,
    K: Serialize + DeserializeOwned + core::fmt::Display + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static,
{
    async fn get(&self, tenant: &Tenant, key: &K) -> Result<Option<V>, RegistryError> {
        let record = self.load(&tenant_key(&self.namespace, tenant, key)).await?;
        Ok(record
            .filter(|(_, record)| record.tenant == *tenant)
            .map(|(_, record)| record.value))
    }

    async fn set(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError> {
        let raw = Self::encode(tenant, &key, &value)?;
        self.backend
            .set(&tenant_key(&self.namespace, tenant, &key), &raw, self.ttl)
            .await?;
        Ok(())
    }

    async fn add(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError> {
        let raw = Self::encode(tenant, &key, &value)?;
        let redis_key = tenant_key(&self.namespace, tenant, &key);
        for _ in 0..MAX_ATTEMPTS {
            if self.backend.set_nx(&redis_key, &raw, self.ttl).await? {
                return Ok(());
            }
            match self.load(&redis_key).await? {
                None => continue,
                Some((_, current)) if current.tenant == *tenant => {
                    return Err(RegistryError::AlreadyPresent(redis_key));
                }
                Some((foreign, _)) => {
                    if self
                        .backend
                        .compare_and_set(&redis_key, &foreign, &raw, self.ttl)
                        .await?
                    {
                        return Ok(());
                    }
                }
            }
        }
        Err(RegistryError::Contended(redis_key))
    }

    async fn remove(&self, tenant: &Tenant, key: &K) -> Result<bool, RegistryError> {
        let redis_key = tenant_key(&self.namespace, tenant, key);
        for _ in 0..MAX_ATTEMPTS {
            match self.load(&redis_key).await? {
                None => return Ok(false),
                Some((_, current)) if current.tenant != *tenant => return Ok(false),
                Some((raw, _)) => {
                    if self.backend.compare_and_delete(&redis_key, &raw).await? {
                        return Ok(true);
                    }
                }
            }
        }
        Err(RegistryError::Contended(redis_key))
    }

    async fn compare_and_remove(&self, tenant: &Tenant, key: &K, expected: &V) -> Result<bool, RegistryError> {
        let redis_key = tenant_key(&self.namespace, tenant, key);
        match self.load(&redis_key).await? {
            Some((raw, current)) if current.tenant == *tenant && current.value == *expected => {
                Ok(self.backend.compare_and_delete(&redis_key, &raw).await?)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_swap(
        &self,
        tenant: &Tenant,
        key: K,
        expected: &V,
        value: V,
    ) -> Result<bool, RegistryError> {
        let redis_key = tenant_key(&self.namespace, tenant, &key);
        match self.load(&redis_key).await? {
            Some((raw, current)) if current.tenant == *tenant && current.value == *expected => {
                let next = Self::encode(tenant, &key, &value)?;
                Ok(self
                    .backend
                    .compare_and_set(&redis_key, &raw, &next, self.ttl)
                    .await?)
            }
            _ => Ok(false),
        }
    }

    async fn get_all(&self, tenant: &Tenant) -> Result<Vec<V>, RegistryError> {
        Ok(self
            .records(&tenant_pattern(&self.namespace, tenant))
            .await?
            .into_iter()
            .filter(|r| r.tenant == *tenant)
            .map(|r| r.value)
            .collect())
    }

    async fn get_all_cross_tenant(&self) -> Result<Vec<(Tenant, K, V)>, RegistryError> {
        Ok(self
            .records(&namespace_pattern(&self.namespace))
            .await?
            .into_iter()
            .map(|r| (r.tenant, r.key, r.value))
            .collect())
    }
}
