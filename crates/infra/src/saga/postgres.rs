//! Postgres-backed saga store.
//!
//! The saga itself is stored as JSON in `saga_data`; the surrounding columns
//! (tenant, status, version, timeout) are what queries filter on. Every
//! statement goes through the tenant filter, and sweeps opt out with
//! `without_tenant_filter`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use atlas_core::{OperationContext, Tenant, TenantId, TransactionId};
use atlas_saga::Saga;

use crate::db::{DbError, Statement, TenantFilter, TenantTables, map_sqlx_error};

use super::store::{SagaRecord, SagaStatus, SagaStore, SagaStoreError};

const TABLE: &str = "sagas";
const COLUMNS: &str = "transaction_id, tenant_id, tenant_region, tenant_major, tenant_minor, \
    status, saga_data, reservations, version, created_at, updated_at, timeout_at";
const OPEN: &str = "status IN ('active', 'compensating')";

#[derive(Debug, Clone)]
pub struct PostgresSagaStore {
    pool: Arc<PgPool>,
    tables: TenantTables,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            tables: TenantTables::atlas(),
        }
    }

    fn filter<'c>(&'c self, ctx: &'c OperationContext) -> TenantFilter<'c> {
        TenantFilter::new(ctx, &self.tables)
    }

    async fn fetch_all(
        &self,
        operation: &str,
        mut qb: sqlx::QueryBuilder<'_, sqlx::Postgres>,
    ) -> Result<Vec<SagaRecord>, SagaStoreError> {
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode(row) {
                Ok(record) => records.push(record),
                // One unreadable saga must not hide the rest from a sweep.
                Err(err) => warn!(operation, error = %err, "skipping undecodable saga row"),
            }
        }
        Ok(records)
    }
}

fn decode(row: &PgRow) -> Result<SagaRecord, SagaStoreError> {
    let db = |e| SagaStoreError::Db(map_sqlx_error("decode_saga", e));
    let major: i16 = row.try_get("tenant_major").map_err(db)?;
    let minor: i16 = row.try_get("tenant_minor").map_err(db)?;
    let tenant = Tenant::new(
        TenantId::from_uuid(row.try_get("tenant_id").map_err(db)?),
        row.try_get::<String, _>("tenant_region").map_err(db)?,
        u16::try_from(major).map_err(|e| SagaStoreError::Codec(e.to_string()))?,
        u16::try_from(minor).map_err(|e| SagaStoreError::Codec(e.to_string()))?,
    )?;
    let saga: Saga = serde_json::from_value(row.try_get("saga_data").map_err(db)?)?;
    let stored_id = TransactionId::from_uuid(row.try_get("transaction_id").map_err(db)?);
    if stored_id != saga.transaction_id {
        return Err(SagaStoreError::Codec(format!(
            "row {stored_id} holds saga {}",
            saga.transaction_id
        )));
    }
    let status: String = row.try_get("status").map_err(db)?;
    let version: i64 = row.try_get("version").map_err(db)?;
    Ok(SagaRecord {
        tenant,
        saga,
        status: status.parse()?,
        version: u64::try_from(version).map_err(|e| SagaStoreError::Codec(e.to_string()))?,
        reservations: serde_json::from_value(row.try_get("reservations").map_err(db)?)?,
        created_at: row.try_get("created_at").map_err(db)?,
        updated_at: row.try_get("updated_at").map_err(db)?,
        timeout_at: row.try_get("timeout_at").map_err(db)?,
    })
}

fn version_i64(version: u64) -> Result<i64, SagaStoreError> {
    i64::try_from(version).map_err(|e| SagaStoreError::Codec(e.to_string()))
}

/// Status change that only applies to an open saga still at `expected_version`.
fn status_update<'a>(
    filter: &TenantFilter<'_>,
    transaction_id: TransactionId,
    expected_version: u64,
    status: SagaStatus,
) -> Result<Statement<'a>, SagaStoreError> {
    Ok(filter
        .update(TABLE)
        .set("status", status.as_str())
        .set("updated_at", Utc::now())
        .set_expr("version = version + 1")
        .and_where("transaction_id", "=", *transaction_id.as_uuid())
        .and_where("version", "=", version_i64(expected_version)?)
        .and_where_raw(OPEN))
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[instrument(skip(self, ctx), fields(transaction_id = %transaction_id), err)]
    async fn get(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
    ) -> Result<Option<SagaRecord>, SagaStoreError> {
        ctx.ensure_active()?;
        let mut qb = self
            .filter(ctx)
            .select(TABLE, COLUMNS)
            .and_where("transaction_id", "=", *transaction_id.as_uuid())
            .finish();
        let row = qb
            .build()
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_saga", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(
        skip(self, ctx, record),
        fields(transaction_id = %record.transaction_id(), version = record.version, status = %record.status),
        err
    )]
    async fn put(&self, ctx: &OperationContext, record: &mut SagaRecord) -> Result<(), SagaStoreError> {
        ctx.ensure_active()?;
        if !ctx.skips_tenant_filter() && ctx.require_tenant()? != &record.tenant {
            return Err(atlas_core::CoreError::precondition("saga belongs to another tenant").into());
        }
        let transaction_id = record.transaction_id();
        let data = serde_json::to_value(&record.saga)?;
        let reservations = serde_json::to_value(&record.reservations)?;
        let now = Utc::now();

        if record.version == 0 {
            let mut qb = self
                .filter(ctx)
                .insert(
                    TABLE,
                    &[
                        "transaction_id",
                        "tenant_id",
                        "tenant_region",
                        "tenant_major",
                        "tenant_minor",
                        "saga_type",
                        "initiated_by",
                        "status",
                        "saga_data",
                        "reservations",
                        "version",
                        "created_at",
                        "updated_at",
                        "timeout_at",
                    ],
                )
                .value(*transaction_id.as_uuid())
                .value(*record.tenant.id().as_uuid())
                .value(record.tenant.region().to_string())
                .value(record.tenant.major_version() as i16)
                .value(record.tenant.minor_version() as i16)
                .value(record.saga.saga_type.as_str())
                .value(record.saga.initiated_by.clone())
                .value(record.status.as_str())
                .value(data)
                .value(reservations)
                .value(1_i64)
                .value(record.created_at)
                .value(now)
                .value(record.timeout_at)
                .finish(None);
            qb.build().execute(&*self.pool).await.map_err(|e| {
                match map_sqlx_error("insert_saga", e) {
                    DbError::UniqueViolation { .. } => SagaStoreError::Duplicate(transaction_id),
                    other => other.into(),
                }
            })?;
        } else {
            let expected = record.version;
            let mut qb = self
                .filter(ctx)
                .update(TABLE)
                .set("status", record.status.as_str())
                .set("saga_data", data)
                .set("reservations", reservations)
                .set("timeout_at", record.timeout_at)
                .set("updated_at", now)
                .set_expr("version = version + 1")
                .and_where("transaction_id", "=", *transaction_id.as_uuid())
                .and_where("version", "=", version_i64(expected)?)
                .finish();
            let done = qb
                .build()
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_saga", e))?;
            if done.rows_affected() == 0 {
                warn!(expected, "optimistic locking conflict on saga update");
                return Err(SagaStoreError::VersionConflict {
                    transaction_id,
                    expected,
                });
            }
        }
        record.version += 1;
        record.updated_at = now;
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(transaction_id = %transaction_id, status = %status), err)]
    async fn set_status(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        expected_version: u64,
        status: SagaStatus,
    ) -> Result<bool, SagaStoreError> {
        ctx.ensure_active()?;
        let mut qb = status_update(&self.filter(ctx), transaction_id, expected_version, status)?.finish();
        let done = qb
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_saga_status", e))?;
        Ok(done.rows_affected() > 0)
    }

    async fn list_active(&self, ctx: &OperationContext) -> Result<Vec<SagaRecord>, SagaStoreError> {
        ctx.ensure_active()?;
        let qb = self
            .filter(ctx)
            .select(TABLE, COLUMNS)
            .and_where_raw(OPEN)
            .suffix("ORDER BY created_at")
            .finish();
        self.fetch_all("list_active_sagas", qb).await
    }

    async fn list_timed_out(
        &self,
        ctx: &OperationContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, SagaStoreError> {
        ctx.ensure_active()?;
        let qb = self
            .filter(ctx)
            .select(TABLE, COLUMNS)
            .and_where_raw(OPEN)
            .and_where_raw("timeout_at IS NOT NULL")
            .and_where("timeout_at", "<", now)
            .suffix("ORDER BY timeout_at")
            .finish();
        self.fetch_all("list_timed_out_sagas", qb).await
    }
}
