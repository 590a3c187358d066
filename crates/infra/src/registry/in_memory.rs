use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use atlas_core::Tenant;

use super::{RegistryError, TenantRegistry};

type Bucket<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// Process-local registry with two-level locking.
///
/// The outer lock is only taken for writing when a tenant's bucket is created;
/// all other traffic takes it shared and then locks that tenant's bucket, so
/// tenants never contend with each other.
#[derive(Debug)]
pub struct InMemoryRegistry<K, V> {
    buckets: RwLock<HashMap<Tenant, Bucket<K, V>>>,
}

impl<K, V> Default for InMemoryRegistry<K, V> {
    fn default() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> InMemoryRegistry<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, tenant: &Tenant) -> Result<Option<Bucket<K, V>>, RegistryError> {
        let buckets = self.buckets.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(buckets.get(tenant).cloned())
    }

    fn bucket_or_create(&self, tenant: &Tenant) -> Result<Bucket<K, V>, RegistryError> {
        if let Some(bucket) = self.bucket(tenant)? {
            return Ok(bucket);
        }
        let mut buckets = self.buckets.write().map_err(|_| RegistryError::Poisoned)?;
        Ok(buckets.entry(tenant.clone()).or_default().clone())
    }
}

#[async_trait]
impl<K, V> TenantRegistry<K, V> for InMemoryRegistry<K, V>
where
    K: Clone + Eq + Hash + core::fmt::Debug + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    async fn get(&self, tenant: &Tenant, key: &K) -> Result<Option<V>, RegistryError> {
        let Some(bucket) = self.bucket(tenant)? else {
            return Ok(None);
        };
        let map = bucket.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError> {
        let bucket = self.bucket_or_create(tenant)?;
        let mut map = bucket.write().map_err(|_| RegistryError::Poisoned)?;
        map.insert(key, value);
        Ok(())
    }

    async fn add(&self, tenant: &Tenant, key: K, value: V) -> Result<(), RegistryError> {
        let bucket = self.bucket_or_create(tenant)?;
        let mut map = bucket.write().map_err(|_| RegistryError::Poisoned)?;
        if map.contains_key(&key) {
            return Err(RegistryError::AlreadyPresent(format!("{key:?}")));
        }
        map.insert(key, value);
        Ok(())
    }

    async fn remove(&self, tenant: &Tenant, key: &K) -> Result<bool, RegistryError> {
        let Some(bucket) = self.bucket(tenant)? else {
            return Ok(false);
        };
        let mut map = bucket.write().map_err(|_| RegistryError::Poisoned)?;
        Ok(map.remove(key).is_some())
    }

    async fn compare_and_remove(&self, tenant: &Tenant, key: &K, expected: &V) -> Result<bool, RegistryError> {
        let Some(bucket) = self.bucket(tenant)? else {
            return Ok(false);
        };
        let mut map = bucket.write().map_err(|_| RegistryError::Poisoned)?;
        if map.get(key) != Some(expected) {
            return Ok(false);
        }
        map.remove(key);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        tenant: &Tenant,
        key: K,
        expected: &V,
        value: V,
    ) -> Result<bool, RegistryError> {
        let Some(bucket) = self.bucket(tenant)? else {
            return Ok(false);
        };
        let mut map = bucket.write().map_err(|_| RegistryError::Poisoned)?;
        match map.get_mut(&key) {
            Some(current) if *current == *expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_all(&self, tenant: &Tenant) -> Result<Vec<V>, RegistryError> {
        let Some(bucket) = self.bucket(tenant)? else {
            return Ok(Vec::new());
        };
        let map = bucket.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(map.values().cloned().collect())
    }

    async fn get_all_cross_tenant(&self) -> Result<Vec<(Tenant, K, V)>, RegistryError> {
        let buckets: Vec<(Tenant, Bucket<K, V>)> = {
            let buckets = self.buckets.read().map_err(|_| RegistryError::Poisoned)?;
            buckets.iter().map(|(t, b)| (t.clone(), b.clone())).collect()
        };
        let mut out = Vec::new();
        for (tenant, bucket) in buckets {
            let map = bucket.read().map_err(|_| RegistryError::Poisoned)?;
            out.extend(map.iter().map(|(k, v)| (tenant.clone(), k.clone(), v.clone())));
        }
        Ok(out)
    }
}
