//! Error model shared across crates.
//!
//! Errors are grouped by *kind* rather than by type: every infrastructure error
//! implements [`Classified`] so the consumer runtime can log a uniform
//! `error_kind` and callers can map it onto a transport status.

use serde::Serialize;
use thiserror::Error;

/// Result type used by the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed headers, unparseable ids, invalid enum values.
    BadInput,
    /// Entity absent in a registry or table.
    NotFound,
    /// Duplicate login, duplicate create, stale version.
    AlreadyExists,
    /// State-machine violation.
    PreconditionFailed,
    /// Bus, Redis or database temporarily unavailable.
    Transient,
    /// Startup configuration error.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadInput => "bad_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }

    /// HTTP status a caller should see for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadInput | ErrorKind::PreconditionFailed => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::Transient => 503,
            ErrorKind::Fatal => 500,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that crosses a handler boundary.
pub trait Classified {
    fn kind(&self) -> ErrorKind;
}

/// Core-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Tenant headers were missing or malformed.
    #[error("bad tenant headers: {0}")]
    BadTenantHeaders(String),

    /// A tenant-required operation ran on an unbound context.
    #[error("no tenant in context")]
    NoTenantInContext,

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("transient failure: {0}")]
    Transient(String),

    /// The operation context was cancelled or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl Classified for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoreError::BadTenantHeaders(_)
            | CoreError::NoTenantInContext
            | CoreError::BadInput(_)
            | CoreError::InvalidId(_) => ErrorKind::BadInput,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::AlreadyExists(_) | CoreError::Conflict(_) => ErrorKind::AlreadyExists,
            CoreError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            CoreError::Transient(_) | CoreError::Cancelled => ErrorKind::Transient,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}
