//! Lookup of the asset a high-level move step is about to transfer.
//!
//! Expansion needs the source-side view of the asset (id, template, reference
//! data, stack size) before it can build the accept/release pair.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::instrument;

use atlas_core::{AccountId, Classified, CharacterId, CoreError, ErrorKind, OperationContext, WorldId};
use atlas_saga::{Action, AssetSnapshot};

use crate::config::{ConfigError, Env};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the asset of a move step currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetLocation {
    CharacterSlot {
        character_id: CharacterId,
        inventory_type: u8,
        slot: i16,
    },
    CharacterCashItem {
        character_id: CharacterId,
        inventory_type: u8,
        cash_id: i64,
    },
    StorageSlot {
        account_id: AccountId,
        world_id: WorldId,
        slot: i16,
    },
    CashShopItem {
        account_id: AccountId,
        compartment_type: u8,
        cash_id: i64,
    },
}

impl AssetLocation {
    /// Source location of a high-level move; `None` for every other action.
    pub fn of(action: &Action) -> Option<Self> {
        match action {
            Action::TransferToStorage(p) => Some(AssetLocation::CharacterSlot {
                character_id: p.character_id,
                inventory_type: p.source_inventory_type,
                slot: p.source_slot,
            }),
            Action::WithdrawFromStorage(p) => Some(AssetLocation::StorageSlot {
                account_id: p.account_id,
                world_id: p.world_id,
                slot: p.source_slot,
            }),
            Action::TransferToCashShop(p) => Some(AssetLocation::CharacterCashItem {
                character_id: p.character_id,
                inventory_type: p.source_inventory_type,
                cash_id: p.cash_id,
            }),
            Action::WithdrawFromCashShop(p) => Some(AssetLocation::CashShopItem {
                account_id: p.account_id,
                compartment_type: p.compartment_type,
                cash_id: p.cash_id,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AssetError {
    #[error("no asset at {0:?}")]
    NotFound(AssetLocation),

    #[error("asset service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid asset response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Context(#[from] CoreError),
}

impl Classified for AssetError {
    fn kind(&self) -> ErrorKind {
        match self {
            // The asset may have moved: a retry will not bring it back.
            AssetError::NotFound(_) => ErrorKind::PreconditionFailed,
            AssetError::Unavailable(_) => ErrorKind::Transient,
            AssetError::Malformed(_) => ErrorKind::BadInput,
            AssetError::Context(err) => err.kind(),
        }
    }
}

#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        location: AssetLocation,
    ) -> Result<AssetSnapshot, AssetError>;
}

#[async_trait]
impl<S> AssetSource for Arc<S>
where
    S: AssetSource + ?Sized,
{
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        location: AssetLocation,
    ) -> Result<AssetSnapshot, AssetError> {
        (**self).snapshot(ctx, location).await
    }
}

/// Fixed assets for tests/dev; not tenant-aware.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAssetSource {
    assets: Arc<RwLock<HashMap<AssetLocation, AssetSnapshot>>>,
}

impl InMemoryAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: AssetLocation, asset: AssetSnapshot) {
        if let Ok(mut assets) = self.assets.write() {
            assets.insert(location, asset);
        }
    }
}

#[async_trait]
impl AssetSource for InMemoryAssetSource {
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        location: AssetLocation,
    ) -> Result<AssetSnapshot, AssetError> {
        ctx.ensure_active()?;
        let assets = self
            .assets
            .read()
            .map_err(|_| AssetError::Unavailable("asset map poisoned".into()))?;
        assets.get(&location).cloned().ok_or(AssetError::NotFound(location))
    }
}

/// Root URLs of the services owning assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEndpoints {
    pub inventory: String,
    pub storage: String,
    pub cash_shop: String,
}

impl AssetEndpoints {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env::new(lookup);
        Ok(Self {
            inventory: env.required("INVENTORY_BASE_URL")?,
            storage: env.required("STORAGE_BASE_URL")?,
            cash_shop: env.required("CASHSHOP_BASE_URL")?,
        })
    }
}

/// Resolves assets over the owning services' REST interfaces.
///
/// Requests carry the tenant headers of the calling context; the response is a
/// JSON array of asset snapshots, of which the first is used.
#[derive(Debug, Clone)]
pub struct HttpAssetSource {
    endpoints: AssetEndpoints,
    client: reqwest::Client,
}

impl HttpAssetSource {
    pub fn new(endpoints: AssetEndpoints) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { endpoints, client }
    }

    fn url(&self, location: AssetLocation) -> String {
        fn root(base: &str) -> &str {
            base.trim_end_matches('/')
        }
        match location {
            AssetLocation::CharacterSlot {
                character_id,
                inventory_type,
                slot,
            } => format!(
                "{}/characters/{character_id}/inventory/compartments/{inventory_type}/assets?slot={slot}",
                root(&self.endpoints.inventory)
            ),
            AssetLocation::CharacterCashItem {
                character_id,
                inventory_type,
                cash_id,
            } => format!(
                "{}/characters/{character_id}/inventory/compartments/{inventory_type}/assets?cashId={cash_id}",
                root(&self.endpoints.inventory)
            ),
            AssetLocation::StorageSlot {
                account_id,
                world_id,
                slot,
            } => format!(
                "{}/storage/accounts/{account_id}/worlds/{world_id}/assets?slot={slot}",
                root(&self.endpoints.storage)
            ),
            AssetLocation::CashShopItem {
                account_id,
                compartment_type,
                cash_id,
            } => format!(
                "{}/accounts/{account_id}/cash-shop/compartments/{compartment_type}/assets?cashId={cash_id}",
                root(&self.endpoints.cash_shop)
            ),
        }
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    #[instrument(skip(self, ctx), err)]
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        location: AssetLocation,
    ) -> Result<AssetSnapshot, AssetError> {
        ctx.ensure_active()?;
        let tenant = ctx.require_tenant()?;
        let mut request = self.client.get(self.url(location));
        for (name, value) in tenant.to_headers() {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AssetError::Unavailable(format!("asset request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                let mut assets = response
                    .json::<Vec<AssetSnapshot>>()
                    .await
                    .map_err(|e| AssetError::Malformed(e.to_string()))?;
                if assets.is_empty() {
                    return Err(AssetError::NotFound(location));
                }
                Ok(assets.swap_remove(0))
            }
            StatusCode::NOT_FOUND => Err(AssetError::NotFound(location)),
            status if status.is_server_error() => {
                Err(AssetError::Unavailable(format!("asset service returned {status}")))
            }
            status => Err(AssetError::Malformed(format!("asset service returned {status}"))),
        }
    }
}
