//! Postgres access: pool setup, error mapping, the tenant filter and repositories.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | `DbError` |
//! |------------|---------------|-----------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (FK / check / not-null) | `23503`, `23514`, `23502` | `Constraint` |
//! | Database (other) | any | `Query` |
//! | Io, PoolTimedOut, PoolClosed | n/a | `Unavailable` |
//! | RowNotFound | n/a | `NotFound` |
//! | Other | n/a | `Query` |

mod filter;
mod schema;
mod services;
mod sessions;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{info, instrument, warn};

use atlas_core::{Classified, CoreError, ErrorKind};

use crate::config::{ConfigError, Env};

pub use filter::{FilterDecision, Insert, Statement, TenantFilter, TenantTables};
pub use schema::{SCHEMA, migrate};
pub use services::{Service, ServiceHistoryEntry, ServiceRepository};
pub use sessions::{SessionHistory, SessionHistoryRepository};

pub const CONNECT_ATTEMPTS: u32 = 10;
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    #[error("database unavailable in {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("duplicate key in {operation}: {message}")]
    UniqueViolation { operation: String, message: String },

    #[error("constraint violated in {operation}: {message}")]
    Constraint { operation: String, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("database error in {operation}: {message}")]
    Query { operation: String, message: String },

    #[error("malformed row in {operation}: {message}")]
    Decode { operation: String, message: String },

    #[error("could not connect after {attempts} attempts: {message}")]
    ConnectFailed { attempts: u32, message: String },

    #[error(transparent)]
    Context(#[from] CoreError),
}

impl Classified for DbError {
    fn kind(&self) -> ErrorKind {
        match self {
            DbError::Unavailable { .. } => ErrorKind::Transient,
            DbError::UniqueViolation { .. } => ErrorKind::AlreadyExists,
            DbError::Constraint { .. } => ErrorKind::BadInput,
            DbError::NotFound(_) => ErrorKind::NotFound,
            DbError::Query { .. } | DbError::Decode { .. } | DbError::ConnectFailed { .. } => {
                ErrorKind::Fatal
            }
            DbError::Context(err) => err.kind(),
        }
    }
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Context(inner) => inner,
            other => match other.kind() {
                ErrorKind::Transient => CoreError::transient(other.to_string()),
                ErrorKind::AlreadyExists => CoreError::already_exists(other.to_string()),
                ErrorKind::BadInput => CoreError::bad_input(other.to_string()),
                ErrorKind::NotFound => CoreError::not_found(other.to_string()),
                _ => CoreError::fatal(other.to_string()),
            },
        }
    }
}

/// Map SQLx errors to [`DbError`].
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DbError {
    let operation = operation.to_string();
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => DbError::UniqueViolation { operation, message },
                Some("23503" | "23514" | "23502") => DbError::Constraint { operation, message },
                _ => DbError::Query { operation, message },
            }
        }
        sqlx::Error::Io(e) => DbError::Unavailable {
            operation,
            message: e.to_string(),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => DbError::Unavailable {
            message: err.to_string(),
            operation,
        },
        sqlx::Error::RowNotFound => DbError::NotFound(operation),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            DbError::Decode {
                message: err.to_string(),
                operation,
            }
        }
        other => DbError::Query {
            operation,
            message: other.to_string(),
        },
    }
}

/// Connection settings, read from `DB_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl DbConfig {
    pub fn new(user: impl Into<String>, password: impl Into<String>, host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            host: host.into(),
            port: 5432,
            name: name.into(),
            max_connections: 10,
            min_connections: 5,
            max_lifetime: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(3 * 60),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env::new(lookup);
        let defaults = Self::new(
            env.required("DB_USER")?,
            env.string("DB_PASSWORD").unwrap_or_default(),
            env.required("DB_HOST")?,
            env.required("DB_NAME")?,
        );
        Ok(Self {
            port: env.number("DB_PORT", defaults.port)?,
            max_connections: env.number("DB_MAX_OPEN_CONNS", defaults.max_connections)?,
            min_connections: env.number("DB_MAX_IDLE_CONNS", defaults.min_connections)?,
            max_lifetime: env.duration("DB_CONN_MAX_LIFETIME", defaults.max_lifetime)?,
            idle_timeout: env.duration("DB_CONN_MAX_IDLE_TIME", defaults.idle_timeout)?,
            ..defaults
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .max_lifetime(self.max_lifetime)
            .idle_timeout(self.idle_timeout)
    }
}

/// Open the pool, retrying with a fixed backoff.
#[instrument(skip(config), fields(host = %config.host, database = %config.name), err)]
pub async fn connect_with_retry(config: &DbConfig) -> Result<PgPool, DbError> {
    let mut last = String::new();
    for attempt in 1..=CONNECT_ATTEMPTS {
        match config.pool_options().connect_with(config.connect_options()).await {
            Ok(pool) => {
                info!(attempt, "connected to database");
                return Ok(pool);
            }
            Err(err) => {
                warn!(attempt, error = %err, "database connection failed");
                last = err.to_string();
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
    }
    Err(DbError::ConnectFailed {
        attempts: CONNECT_ATTEMPTS,
        message: last,
    })
}
