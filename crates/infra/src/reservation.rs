//! Time-bounded reservations on inventory slots.
//!
//! One cache key per slot, `reservation:<tenant>:<owner>:<type>:<slot>`, holding
//! the JSON list of reservations. Every mutation reads the list, drops expired
//! entries, applies the change and writes it back with the key TTL set to the
//! latest expiry. Expired reservations are never returned or counted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use atlas_core::{Classified, Clock, CoreError, ErrorKind, ItemId, SystemClock, Tenant, TransactionId};

use crate::cache::{BatchOp, CacheBackend, CacheError};
use crate::lock::{DistributedMutex, inventory_lock_key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
}

/// `(owner, inventory_type, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotKey {
    pub owner: u32,
    pub inventory_type: u8,
    pub slot: i16,
}

impl SlotKey {
    pub fn new(owner: u32, inventory_type: u8, slot: i16) -> Self {
        Self {
            owner,
            inventory_type,
            slot,
        }
    }

    fn cache_key(&self, tenant: &Tenant) -> String {
        format!(
            "reservation:{}:{}:{}:{}",
            tenant.id(),
            self.owner,
            self.inventory_type,
            self.slot
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReservationError {
    #[error("no reservation for transaction {transaction_id} on slot {slot:?}")]
    NotFound {
        transaction_id: TransactionId,
        slot: SlotKey,
    },

    #[error("cannot swap a slot with itself")]
    SameSlot,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("malformed reservation list: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for ReservationError {
    fn from(err: serde_json::Error) -> Self {
        ReservationError::Codec(err.to_string())
    }
}

impl Classified for ReservationError {
    fn kind(&self) -> ErrorKind {
        match self {
            ReservationError::NotFound { .. } => ErrorKind::NotFound,
            ReservationError::SameSlot => ErrorKind::BadInput,
            ReservationError::Cache(_) => ErrorKind::Transient,
            ReservationError::Codec(_) => ErrorKind::Fatal,
        }
    }
}

impl From<ReservationError> for CoreError {
    fn from(err: ReservationError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => CoreError::not_found(err.to_string()),
            ErrorKind::BadInput => CoreError::bad_input(err.to_string()),
            ErrorKind::Transient => CoreError::transient(err.to_string()),
            _ => CoreError::fatal(err.to_string()),
        }
    }
}

pub struct ReservationRegistry<B> {
    backend: B,
    mutex: Option<DistributedMutex<B>>,
    clock: Arc<dyn Clock>,
}

impl<B> core::fmt::Debug for ReservationRegistry<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReservationRegistry")
            .field("locked", &self.mutex.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: CacheBackend> ReservationRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            mutex: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Serialize slot mutations through `invlock:<owner>:<type>`.
    pub fn with_mutex(mut self, mutex: DistributedMutex<B>) -> Self {
        self.mutex = Some(mutex);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        tenant: &Tenant,
        transaction_id: TransactionId,
        slot: SlotKey,
        item_id: ItemId,
        quantity: u32,
        ttl: Duration,
    ) -> Result<Reservation, ReservationError> {
        self.guarded(&slot, || async {
            let now = self.clock.now();
            let mut list = self.read(tenant, &slot, now).await?;
            let reservation = Reservation {
                id: Uuid::now_v7(),
                transaction_id,
                item_id,
                quantity,
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            };
            list.push(reservation.clone());
            self.backend
                .write_batch(vec![Self::write_op(tenant, &slot, &list, now)?])
                .await?;
            debug!(
                transaction_id = %transaction_id,
                owner = slot.owner,
                slot = slot.slot,
                quantity,
                "reserved"
            );
            Ok::<_, ReservationError>(reservation)
        })
        .await
    }

    /// Remove the reservation `transaction_id` holds on `slot`.
    pub async fn remove(
        &self,
        tenant: &Tenant,
        transaction_id: TransactionId,
        slot: SlotKey,
    ) -> Result<Reservation, ReservationError> {
        self.guarded(&slot, || async {
            let now = self.clock.now();
            let mut list = self.read(tenant, &slot, now).await?;
            let Some(at) = list.iter().position(|r| r.transaction_id == transaction_id) else {
                return Err(ReservationError::NotFound {
                    transaction_id,
                    slot,
                });
            };
            let removed = list.remove(at);
            self.backend
                .write_batch(vec![Self::write_op(tenant, &slot, &list, now)?])
                .await?;
            Ok::<_, ReservationError>(removed)
        })
        .await
    }

    /// Exchange the reservation lists of two slots of the same compartment.
    pub async fn swap(
        &self,
        tenant: &Tenant,
        owner: u32,
        inventory_type: u8,
        slot_a: i16,
        slot_b: i16,
    ) -> Result<(), ReservationError> {
        if slot_a == slot_b {
            return Err(ReservationError::SameSlot);
        }
        let a = SlotKey::new(owner, inventory_type, slot_a);
        let b = SlotKey::new(owner, inventory_type, slot_b);
        self.guarded(&a, || async {
            let now = self.clock.now();
            let list_a = self.read(tenant, &a, now).await?;
            let list_b = self.read(tenant, &b, now).await?;
            self.backend
                .write_batch(vec![
                    Self::write_op(tenant, &a, &list_b, now)?,
                    Self::write_op(tenant, &b, &list_a, now)?,
                ])
                .await?;
            Ok::<_, ReservationError>(())
        })
        .await
    }

    pub async fn reserved_quantity(
        &self,
        tenant: &Tenant,
        slot: SlotKey,
    ) -> Result<u32, ReservationError> {
        Ok(self
            .list(tenant, slot)
            .await?
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.quantity)))
    }

    /// Active reservations on a slot.
    pub async fn list(
        &self,
        tenant: &Tenant,
        slot: SlotKey,
    ) -> Result<Vec<Reservation>, ReservationError> {
        self.read(tenant, &slot, self.clock.now()).await
    }

    async fn read(
        &self,
        tenant: &Tenant,
        slot: &SlotKey,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, ReservationError> {
        let Some(raw) = self.backend.get(&slot.cache_key(tenant)).await? else {
            return Ok(Vec::new());
        };
        let mut list: Vec<Reservation> = serde_json::from_str(&raw)?;
        list.retain(|r| r.expires_at > now);
        Ok(list)
    }

    fn write_op(
        tenant: &Tenant,
        slot: &SlotKey,
        list: &[Reservation],
        now: DateTime<Utc>,
    ) -> Result<BatchOp, ReservationError> {
        let key = slot.cache_key(tenant);
        let Some(latest) = list.iter().map(|r| r.expires_at).max() else {
            return Ok(BatchOp::Del { key });
        };
        let ttl = (latest - now).to_std().unwrap_or(Duration::from_millis(1));
        Ok(BatchOp::Set {
            key,
            value: serde_json::to_string(list)?,
            ttl: Some(ttl),
        })
    }

    async fn guarded<T, F, Fut>(&self, slot: &SlotKey, f: F) -> Result<T, ReservationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ReservationError>>,
    {
        let Some(mutex) = &self.mutex else {
            return f().await;
        };
        let guard = mutex
            .lock(&inventory_lock_key(slot.owner, slot.inventory_type))
            .await?;
        let result = f().await;
        mutex.unlock(guard).await?;
        result
    }
}
