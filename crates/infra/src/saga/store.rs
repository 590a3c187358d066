//! Saga persistence with optimistic versioning.
//!
//! A record is written with `version == 0` the first time (insert) and with the
//! version it was read at afterwards; a concurrent writer makes the second put
//! fail with [`SagaStoreError::VersionConflict`] instead of silently winning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atlas_core::{Classified, CoreError, ErrorKind, OperationContext, Tenant, TransactionId};
use atlas_saga::{Progress, Saga};

use crate::db::DbError;
use crate::reservation::SlotKey;

/// Persisted lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Active,
    Compensating,
    Completed,
    Failed,
    Stuck,
}

impl SagaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SagaStatus::Active => "active",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Stuck => "stuck",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, SagaStatus::Active | SagaStatus::Compensating)
    }
}

impl core::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SagaStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SagaStatus::Active),
            "compensating" => Ok(SagaStatus::Compensating),
            "completed" => Ok(SagaStatus::Completed),
            "failed" => Ok(SagaStatus::Failed),
            "stuck" => Ok(SagaStatus::Stuck),
            other => Err(CoreError::bad_input(format!("unknown saga status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SagaRecord {
    pub tenant: Tenant,
    pub saga: Saga,
    pub status: SagaStatus,
    /// 0 until first stored.
    pub version: u64,
    /// Slots reserved on behalf of this saga, released on completion or compensation.
    pub reservations: Vec<SlotKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl SagaRecord {
    pub fn new(tenant: Tenant, saga: Saga, now: DateTime<Utc>, timeout: std::time::Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        Self {
            tenant,
            saga,
            status: SagaStatus::Active,
            version: 0,
            reservations: Vec::new(),
            created_at: now,
            updated_at: now,
            timeout_at: Some(now + timeout),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.saga.transaction_id
    }

    /// Status implied by step state, for records that are still open.
    pub fn sync_status(&mut self) {
        if self.status.is_open() {
            self.status = match self.saga.progress() {
                Progress::Compensating => SagaStatus::Compensating,
                _ => SagaStatus::Active,
            };
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SagaStoreError {
    #[error("saga {0} already exists")]
    Duplicate(TransactionId),

    #[error("version conflict for saga {transaction_id} (expected {expected})")]
    VersionConflict {
        transaction_id: TransactionId,
        expected: u64,
    },

    #[error("saga {0} not found")]
    NotFound(TransactionId),

    #[error("malformed saga record: {0}")]
    Codec(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Context(#[from] CoreError),
}

impl From<serde_json::Error> for SagaStoreError {
    fn from(err: serde_json::Error) -> Self {
        SagaStoreError::Codec(err.to_string())
    }
}

impl Classified for SagaStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            SagaStoreError::Duplicate(_) => ErrorKind::AlreadyExists,
            // Reloading and reapplying resolves a conflict.
            SagaStoreError::VersionConflict { .. } => ErrorKind::Transient,
            SagaStoreError::NotFound(_) => ErrorKind::NotFound,
            SagaStoreError::Codec(_) => ErrorKind::Fatal,
            SagaStoreError::Db(err) => err.kind(),
            SagaStoreError::Context(err) => err.kind(),
        }
    }
}

impl From<SagaStoreError> for CoreError {
    fn from(err: SagaStoreError) -> Self {
        match err {
            SagaStoreError::Context(inner) => inner,
            SagaStoreError::Db(inner) => inner.into(),
            other => match other.kind() {
                ErrorKind::AlreadyExists => CoreError::already_exists(other.to_string()),
                ErrorKind::NotFound => CoreError::not_found(other.to_string()),
                ErrorKind::Transient => CoreError::transient(other.to_string()),
                _ => CoreError::fatal(other.to_string()),
            },
        }
    }
}

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Tenant-filtered lookup; a saga of another tenant reads as absent.
    async fn get(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
    ) -> Result<Option<SagaRecord>, SagaStoreError>;

    /// Insert (`version == 0`) or update at `record.version`; bumps the version on success.
    async fn put(&self, ctx: &OperationContext, record: &mut SagaRecord) -> Result<(), SagaStoreError>;

    /// Move an open saga that is still at `expected_version` to `status`.
    /// Returns `false` when the saga is missing, already terminal, or was
    /// written since it was read.
    async fn set_status(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        expected_version: u64,
        status: SagaStatus,
    ) -> Result<bool, SagaStoreError>;

    /// Open (`active`/`compensating`) sagas, across tenants when the filter is skipped.
    async fn list_active(&self, ctx: &OperationContext) -> Result<Vec<SagaRecord>, SagaStoreError>;

    /// Open sagas whose `timeout_at` is before `now`.
    async fn list_timed_out(
        &self,
        ctx: &OperationContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, SagaStoreError>;
}

#[async_trait]
impl<S> SagaStore for Arc<S>
where
    S: SagaStore + ?Sized,
{
    async fn get(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
    ) -> Result<Option<SagaRecord>, SagaStoreError> {
        (**self).get(ctx, transaction_id).await
    }

    async fn put(&self, ctx: &OperationContext, record: &mut SagaRecord) -> Result<(), SagaStoreError> {
        (**self).put(ctx, record).await
    }

    async fn set_status(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        expected_version: u64,
        status: SagaStatus,
    ) -> Result<bool, SagaStoreError> {
        (**self).set_status(ctx, transaction_id, expected_version, status).await
    }

    async fn list_active(&self, ctx: &OperationContext) -> Result<Vec<SagaRecord>, SagaStoreError> {
        (**self).list_active(ctx).await
    }

    async fn list_timed_out(
        &self,
        ctx: &OperationContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, SagaStoreError> {
        (**self).list_timed_out(ctx, now).await
    }
}

/// Which tenant a call may see: one tenant, or all of them when the filter is skipped.
fn scope(ctx: &OperationContext) -> Result<Option<&Tenant>, SagaStoreError> {
    ctx.ensure_active()?;
    if ctx.skips_tenant_filter() {
        return Ok(None);
    }
    Ok(Some(ctx.require_tenant()?))
}

fn visible(scope: Option<&Tenant>, record: &SagaRecord) -> bool {
    scope.is_none_or(|tenant| *tenant == record.tenant)
}

/// In-memory saga store for tests/dev.
#[derive(Debug, Default, Clone)]
pub struct InMemorySagaStore {
    records: Arc<Mutex<HashMap<TransactionId, SagaRecord>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TransactionId, SagaRecord>>, SagaStoreError> {
        self.records
            .lock()
            .map_err(|_| SagaStoreError::Context(CoreError::fatal("saga store lock poisoned")))
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn get(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
    ) -> Result<Option<SagaRecord>, SagaStoreError> {
        let scope = scope(ctx)?;
        Ok(self
            .lock()?
            .get(&transaction_id)
            .filter(|r| visible(scope, r))
            .cloned())
    }

    async fn put(&self, ctx: &OperationContext, record: &mut SagaRecord) -> Result<(), SagaStoreError> {
        let scope = scope(ctx)?;
        if !visible(scope, record) {
            return Err(CoreError::precondition("saga belongs to another tenant").into());
        }
        let mut records = self.lock()?;
        let transaction_id = record.transaction_id();
        match records.get(&transaction_id) {
            None if record.version == 0 => {}
            None => return Err(SagaStoreError::NotFound(transaction_id)),
            Some(_) if record.version == 0 => return Err(SagaStoreError::Duplicate(transaction_id)),
            Some(stored) if stored.version != record.version => {
                return Err(SagaStoreError::VersionConflict {
                    transaction_id,
                    expected: record.version,
                });
            }
            Some(_) => {}
        }
        record.version += 1;
        records.insert(transaction_id, record.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        expected_version: u64,
        status: SagaStatus,
    ) -> Result<bool, SagaStoreError> {
        let scope = scope(ctx)?;
        let mut records = self.lock()?;
        match records
            .get_mut(&transaction_id)
            .filter(|r| visible(scope, r) && r.status.is_open() && r.version == expected_version)
        {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
                record.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_active(&self, ctx: &OperationContext) -> Result<Vec<SagaRecord>, SagaStoreError> {
        let scope = scope(ctx)?;
        Ok(self
            .lock()?
            .values()
            .filter(|r| visible(scope, r) && r.status.is_open())
            .cloned()
            .collect())
    }

    async fn list_timed_out(
        &self,
        ctx: &OperationContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, SagaStoreError> {
        let scope = scope(ctx)?;
        Ok(self
            .lock()?
            .values()
            .filter(|r| visible(scope, r) && r.status.is_open())
            .filter(|r| r.timeout_at.is_some_and(|at| at < now))
            .cloned()
            .collect())
    }
}
