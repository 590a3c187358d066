//! Process configuration read from environment variables.
//!
//! Every value has a default except the ones a deployment must choose; a value
//! that is present but unparseable is a startup error, never silently replaced.

use std::time::Duration;

use atlas_core::{Classified, CoreError, ErrorKind};

use crate::session::DEFAULT_SESSION_TIMEOUT;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_PARTITIONS: u32 = 1;
pub const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl Classified for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::fatal(err.to_string())
    }
}

/// Parse `500ms`, `5s`, `3m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(n)),
        "ms" => Some(Duration::from_millis(n)),
        "m" => Some(Duration::from_secs(n.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(n.checked_mul(3600)?)),
        _ => None,
    }
}

/// Reads variables through a lookup function so tests never touch the process env.
pub(crate) struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub(crate) fn new(lookup: F) -> Self {
        Self { lookup }
    }

    pub(crate) fn string(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    pub(crate) fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.string(name).ok_or(ConfigError::Missing(name))
    }

    pub(crate) fn duration(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(name) {
            None => Ok(default),
            Some(value) => parse_duration(&value).ok_or_else(|| ConfigError::Invalid {
                name,
                reason: "expected a duration like 500ms, 5s, 3m or 1h".into(),
                value,
            }),
        }
    }

    pub(crate) fn number<N>(&self, name: &'static str, default: N) -> Result<N, ConfigError>
    where
        N: core::str::FromStr,
        N::Err: core::fmt::Display,
    {
        match self.string(name) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: N::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

/// Settings shared by every binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub redis_url: String,
    pub partitions: u32,
    pub saga_timeout: Duration,
    pub session_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            partitions: DEFAULT_PARTITIONS,
            saga_timeout: DEFAULT_SAGA_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env::new(lookup);
        let defaults = Self::default();
        let partitions = env.number("BOOTSTRAP_PARTITIONS", defaults.partitions)?;
        if partitions == 0 {
            return Err(ConfigError::Invalid {
                name: "BOOTSTRAP_PARTITIONS",
                value: "0".into(),
                reason: "at least one partition is required".into(),
            });
        }
        Ok(Self {
            redis_url: env.string("REDIS_URL").unwrap_or(defaults.redis_url),
            partitions,
            saga_timeout: env.duration("SAGA_TIMEOUT", defaults.saga_timeout)?,
            session_timeout: env.duration("SESSION_TIMEOUT", defaults.session_timeout)?,
        })
    }
}
