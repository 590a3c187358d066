//! Login/logout audit trail per character.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use atlas_core::{ChannelId, CharacterId, OperationContext, TenantId, WorldId};

use super::{DbError, Statement, TenantFilter, TenantTables, map_sqlx_error};

const TABLE: &str = "sessions_history";
const COLUMNS: &str = "id, tenant_id, character_id, world_id, channel_id, login_time, logout_time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHistory {
    pub id: i64,
    pub tenant_id: TenantId,
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub login_time: DateTime<Utc>,
    pub logout_time: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for SessionHistory {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let character_id: i64 = row.try_get("character_id")?;
        let world_id: i16 = row.try_get("world_id")?;
        let channel_id: i16 = row.try_get("channel_id")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            character_id: CharacterId(narrow(character_id, "character_id")?),
            world_id: WorldId(narrow(world_id, "world_id")?),
            channel_id: ChannelId(narrow(channel_id, "channel_id")?),
            login_time: row.try_get("login_time")?,
            logout_time: row.try_get("logout_time")?,
        })
    }
}

fn narrow<F, T>(value: F, column: &str) -> Result<T, sqlx::Error>
where
    T: TryFrom<F>,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    T::try_from(value).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

#[derive(Debug, Clone)]
pub struct SessionHistoryRepository {
    pool: Arc<PgPool>,
    tables: TenantTables,
}

impl SessionHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            tables: TenantTables::atlas(),
        }
    }

    /// Record a login; returns the new row id.
    #[instrument(skip(self, ctx), fields(character_id = %character_id), err)]
    pub async fn start(
        &self,
        ctx: &OperationContext,
        character_id: CharacterId,
        world_id: WorldId,
        channel_id: ChannelId,
        login_time: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        ctx.ensure_active()?;
        ctx.require_tenant()?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .insert(TABLE, &["character_id", "world_id", "channel_id", "login_time"])
            .value(i64::from(character_id.value()))
            .value(i16::from(world_id.value()))
            .value(i16::from(channel_id.value()))
            .value(login_time)
            .finish(Some("RETURNING id"));
        let row = qb
            .build()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("start_session", e))?;
        row.try_get("id").map_err(|e| map_sqlx_error("start_session", e))
    }

    /// Close every open session of the character; returns how many were closed.
    #[instrument(skip(self, ctx), fields(character_id = %character_id), err)]
    pub async fn end(
        &self,
        ctx: &OperationContext,
        character_id: CharacterId,
        logout_time: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        ctx.ensure_active()?;
        let mut qb = end_statement(TenantFilter::new(ctx, &self.tables), character_id, logout_time).finish();
        let done = qb
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("end_session", e))?;
        Ok(done.rows_affected())
    }

    pub async fn open_session(
        &self,
        ctx: &OperationContext,
        character_id: CharacterId,
    ) -> Result<Option<SessionHistory>, DbError> {
        ctx.ensure_active()?;
        let mut qb = TenantFilter::new(ctx, &self.tables)
            .select(TABLE, COLUMNS)
            .and_where("character_id", "=", i64::from(character_id.value()))
            .and_where_raw("logout_time IS NULL")
            .suffix("ORDER BY login_time DESC")
            .limit(1)
            .finish();
        let row = qb
            .build()
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("open_session", e))?;
        row.map(|r| SessionHistory::from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("open_session", e))
    }

    /// Sessions that overlap `[since, now)`, newest first.
    pub async fn history_since(
        &self,
        ctx: &OperationContext,
        character_id: CharacterId,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionHistory>, DbError> {
        ctx.ensure_active()?;
        let mut qb = history_statement(TenantFilter::new(ctx, &self.tables), character_id, since).finish();
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("session_history", e))?;
        rows.iter()
            .map(SessionHistory::from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("session_history", e))
    }
}

fn end_statement<'a>(filter: TenantFilter<'_>, character_id: CharacterId, logout_time: DateTime<Utc>) -> Statement<'a> {
    filter
        .update(TABLE)
        .set("logout_time", logout_time)
        .and_where("character_id", "=", i64::from(character_id.value()))
        .and_where_raw("logout_time IS NULL")
}

fn history_statement<'a>(filter: TenantFilter<'_>, character_id: CharacterId, since: DateTime<Utc>) -> Statement<'a> {
    filter
        .select(TABLE, COLUMNS)
        .and_where("character_id", "=", i64::from(character_id.value()))
        .and_where_null_or("logout_time", ">=", since)
        .suffix("ORDER BY login_time DESC")
}
