//! Service configuration documents with an append-only audit table.
//!
//! Services are global (not tenant-owned). Every mutation writes its
//! `service_history` row first, in the same transaction as the change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use atlas_core::OperationContext;

use super::{DbError, Insert, TenantFilter, TenantTables, map_sqlx_error};

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub id: Uuid,
    pub service_type: String,
    pub data: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for Service {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            service_type: row.try_get("type")?,
            data: row.try_get("data")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHistoryEntry {
    pub id: i64,
    pub service_id: Uuid,
    pub service_type: String,
    pub data: Option<JsonValue>,
    pub operation: String,
    pub recorded_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ServiceHistoryEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            service_id: row.try_get("service_id")?,
            service_type: row.try_get("type")?,
            data: row.try_get("data")?,
            operation: row.try_get("operation")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceRepository {
    pool: Arc<PgPool>,
    tables: TenantTables,
}

impl ServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            tables: TenantTables::atlas(),
        }
    }

    #[instrument(skip(self, ctx, service), fields(service_id = %service.id, service_type = %service.service_type), err)]
    pub async fn create(&self, ctx: &OperationContext, service: &Service) -> Result<(), DbError> {
        ctx.ensure_active()?;
        let mut tx = self.begin("create_service").await?;
        self.audit(&mut tx, ctx, service.id, &service.service_type, Some(&service.data), "CREATE")
            .await?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .insert("services", &["id", "type", "data"])
            .value(service.id)
            .value(service.service_type.clone())
            .value(service.data.clone())
            .finish(None);
        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_service", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("create_service", e))?;
        info!("service created");
        Ok(())
    }

    #[instrument(skip(self, ctx, service), fields(service_id = %service.id), err)]
    pub async fn update(&self, ctx: &OperationContext, service: &Service) -> Result<(), DbError> {
        ctx.ensure_active()?;
        let mut tx = self.begin("update_service").await?;
        self.audit(&mut tx, ctx, service.id, &service.service_type, Some(&service.data), "UPDATE")
            .await?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .update("services")
            .set("type", service.service_type.clone())
            .set("data", service.data.clone())
            .set("updated_at", Utc::now())
            .and_where("id", "=", service.id)
            .finish();
        let done = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_service", e))?;
        if done.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("service {}", service.id)));
        }
        tx.commit().await.map_err(|e| map_sqlx_error("update_service", e))?;
        Ok(())
    }

    /// Returns whether the service existed.
    #[instrument(skip(self, ctx), err)]
    pub async fn delete(&self, ctx: &OperationContext, id: Uuid) -> Result<bool, DbError> {
        ctx.ensure_active()?;
        let Some(existing) = self.get(ctx, id).await? else {
            return Ok(false);
        };
        let mut tx = self.begin("delete_service").await?;
        self.audit(&mut tx, ctx, id, &existing.service_type, None, "DELETE").await?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .delete("services")
            .and_where("id", "=", id)
            .finish();
        let done = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_service", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("delete_service", e))?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get(&self, ctx: &OperationContext, id: Uuid) -> Result<Option<Service>, DbError> {
        ctx.ensure_active()?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .select("services", "id, type, data")
            .and_where("id", "=", id)
            .finish();
        let row = qb
            .build()
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_service", e))?;
        row.map(|r| Service::from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get_service", e))
    }

    pub async fn list_by_type(&self, ctx: &OperationContext, service_type: &str) -> Result<Vec<Service>, DbError> {
        ctx.ensure_active()?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .select("services", "id, type, data")
            .and_where("type", "=", service_type.to_string())
            .suffix("ORDER BY id")
            .finish();
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_services", e))?;
        rows.iter()
            .map(Service::from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list_services", e))
    }

    /// Audit rows for one service, oldest first.
    pub async fn history(&self, ctx: &OperationContext, id: Uuid) -> Result<Vec<ServiceHistoryEntry>, DbError> {
        ctx.ensure_active()?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .select("service_history", "id, service_id, type, data, operation, recorded_at")
            .and_where("service_id", "=", id)
            .suffix("ORDER BY recorded_at, id")
            .finish();
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("service_history", e))?;
        rows.iter()
            .map(ServiceHistoryEntry::from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("service_history", e))
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, DbError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }

    async fn audit(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        ctx: &OperationContext,
        service_id: Uuid,
        service_type: &str,
        data: Option<&JsonValue>,
        operation: &'static str,
    ) -> Result<(), DbError> {
        let mut qb = audit_insert(TenantFilter::new(ctx, &self.tables), service_id, service_type, data, operation)
            .finish(None);
        qb.build()
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("service_history", e))?;
        Ok(())
    }
}

fn audit_insert<'a>(
    filter: TenantFilter<'_>,
    service_id: Uuid,
    service_type: &str,
    data: Option<&JsonValue>,
    operation: &'static str,
) -> Insert<'a> {
    filter
        .insert("service_history", &["service_id", "type", "data", "operation"])
        .value(service_id)
        .value(service_type.to_string())
        .value(data.cloned())
        .value(operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FilterDecision;
    use atlas_core::{Tenant, TenantId};

    #[test]
    fn services_are_global_even_under_a_tenant() {
        let ctx = OperationContext::background()
            .with_tenant(Tenant::new(TenantId::new(), "GMS", 83, 1).unwrap());
        let tables = TenantTables::atlas();
        let filter = TenantFilter::new(&ctx, &tables);
        assert_eq!(filter.decide("services"), FilterDecision::GlobalTable);

        let insert = audit_insert(filter, Uuid::nil(), "channel", None, "DELETE");
        assert_eq!(
            insert.sql(),
            "INSERT INTO service_history (service_id, type, data, operation) VALUES ($1, $2, $3, $4"
        );
    }
}
