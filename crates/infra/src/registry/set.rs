use std::marker::PhantomData;
use std::str::FromStr;

use atlas_core::{CharacterId, Field, Tenant};

use super::{RegistryError, tenant_key};
use crate::cache::CacheBackend;

/// Set-valued registry (`SADD` / `SREM` / `SMEMBERS`); duplicates collapse.
#[derive(Debug)]
pub struct RedisSetRegistry<B, K, M> {
    backend: B,
    namespace: String,
    _marker: PhantomData<fn() -> (K, M)>,
}

impl<B, K, M> RedisSetRegistry<B, K, M>
where
    B: CacheBackend,
    K: core::fmt::Display,
    M: core::fmt::Display + FromStr,
{
    pub fn new(backend: B, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            _marker: PhantomData,
        }
    }

    /// Returns whether `member` was newly added.
    pub async fn add(&self, tenant: &Tenant, key: &K, member: &M) -> Result<bool, RegistryError> {
        Ok(self
            .backend
            .sadd(&tenant_key(&self.namespace, tenant, key), &member.to_string())
            .await?)
    }

    pub async fn remove(&self, tenant: &Tenant, key: &K, member: &M) -> Result<bool, RegistryError> {
        Ok(self
            .backend
            .srem(&tenant_key(&self.namespace, tenant, key), &member.to_string())
            .await?)
    }

    pub async fn members(&self, tenant: &Tenant, key: &K) -> Result<Vec<M>, RegistryError> {
        let raw = self
            .backend
            .smembers(&tenant_key(&self.namespace, tenant, key))
            .await?;
        raw.into_iter()
            .map(|m| {
                m.parse::<M>()
                    .map_err(|_| RegistryError::Codec(format!("bad set member {m}")))
            })
            .collect()
    }
}

/// Characters present in each field, per tenant.
#[derive(Debug)]
pub struct CharacterMapRegistry<B> {
    set: RedisSetRegistry<B, Field, CharacterId>,
}

impl<B: CacheBackend> CharacterMapRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            set: RedisSetRegistry::new(backend, "map-characters"),
        }
    }

    pub async fn enter(
        &self,
        tenant: &Tenant,
        field: &Field,
        character_id: CharacterId,
    ) -> Result<(), RegistryError> {
        self.set.add(tenant, field, &character_id).await?;
        Ok(())
    }

    pub async fn exit(
        &self,
        tenant: &Tenant,
        field: &Field,
        character_id: CharacterId,
    ) -> Result<(), RegistryError> {
        self.set.remove(tenant, field, &character_id).await?;
        Ok(())
    }

    pub async fn get_in_map(
        &self,
        tenant: &Tenant,
        field: &Field,
    ) -> Result<Vec<CharacterId>, RegistryError> {
        let mut ids = self.set.members(tenant, field).await?;
        ids.sort();
        Ok(ids)
    }
}
