//! Table definitions, applied idempotently at startup.

use sqlx::PgPool;
use tracing::{info, instrument};

use super::{DbError, TenantTables, map_sqlx_error};

pub const SCHEMA: &[(&str, &str)] = &[
    (
        "sessions_history",
        r#"
        CREATE TABLE IF NOT EXISTS sessions_history (
            id           BIGSERIAL PRIMARY KEY,
            tenant_id    UUID NOT NULL,
            character_id BIGINT NOT NULL,
            world_id     SMALLINT NOT NULL,
            channel_id   SMALLINT NOT NULL,
            login_time   TIMESTAMPTZ NOT NULL,
            logout_time  TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_history_tenant_character
            ON sessions_history (tenant_id, character_id);
        "#,
    ),
    (
        "services",
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id         UUID PRIMARY KEY,
            type       TEXT NOT NULL,
            data       JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    ),
    (
        "service_history",
        r#"
        CREATE TABLE IF NOT EXISTS service_history (
            id          BIGSERIAL PRIMARY KEY,
            service_id  UUID NOT NULL,
            type        TEXT NOT NULL,
            data        JSONB,
            operation   TEXT NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE INDEX IF NOT EXISTS idx_service_history_service
            ON service_history (service_id, recorded_at);
        "#,
    ),
    (
        "sagas",
        r#"
        CREATE TABLE IF NOT EXISTS sagas (
            transaction_id UUID PRIMARY KEY,
            tenant_id      UUID NOT NULL,
            tenant_region  TEXT NOT NULL,
            tenant_major   SMALLINT NOT NULL,
            tenant_minor   SMALLINT NOT NULL,
            saga_type      TEXT NOT NULL,
            initiated_by   TEXT NOT NULL,
            status         TEXT NOT NULL,
            saga_data      JSONB NOT NULL,
            reservations   JSONB NOT NULL DEFAULT '[]',
            version        BIGINT NOT NULL,
            created_at     TIMESTAMPTZ NOT NULL,
            updated_at     TIMESTAMPTZ NOT NULL,
            timeout_at     TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS idx_sagas_tenant_status ON sagas (tenant_id, status);
        CREATE INDEX IF NOT EXISTS idx_sagas_timeout ON sagas (status, timeout_at);
        "#,
    ),
];

impl TenantTables {
    /// Tenant-owned tables of this schema.
    pub fn atlas() -> Self {
        Self::new().register("sessions_history").register("sagas")
    }
}

#[instrument(skip(pool), err)]
pub async fn migrate(pool: &PgPool) -> Result<(), DbError> {
    for (table, ddl) in SCHEMA {
        sqlx::raw_sql(ddl)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error(&format!("migrate {table}"), e))?;
        info!(table, "table ready");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_tables_carry_tenant_column() {
        let tables = TenantTables::atlas();
        for (table, ddl) in SCHEMA {
            if tables.contains(table) {
                let normalized = ddl.split_whitespace().collect::<Vec<_>>().join(" ");
                assert!(normalized.contains("tenant_id UUID NOT NULL"), "{table}");
            }
        }
        assert!(!tables.contains("services"));
    }
}
