//! The `session-coordinator` process: expires character sessions stuck in a
//! channel transition.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use atlas_core::CharacterId;
use atlas_events::topic::COMMAND_TOPIC_CHARACTER_SESSION;
use atlas_events::{MessageBus, Topics};
use atlas_infra::cache::RedisBackend;
use atlas_infra::config::RuntimeConfig;
use atlas_infra::db::{DbConfig, SessionHistoryRepository, connect_with_retry, migrate};
use atlas_infra::event_bus::{RedisStreamsBus, StreamsConfig};
use atlas_infra::registry::RedisRegistry;
use atlas_infra::session::{DEFAULT_SWEEP_INTERVAL, SessionEntry, SessionRegistry, SessionTimeoutTask};
use atlas_infra::worker::spawn_periodic;

use crate::shutdown;

/// Registry namespace shared with the services that log characters in.
pub const SESSION_NAMESPACE: &str = "character-session";

pub const TOPICS: &[&str] = &[COMMAND_TOPIC_CHARACTER_SESSION];

pub type Sessions = SessionRegistry<RedisRegistry<RedisBackend, CharacterId, SessionEntry>>;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// A fifth of the timeout, kept within 50ms..=1s.
pub fn sweep_interval(session_timeout: Duration) -> Duration {
    (session_timeout / 5).clamp(MIN_SWEEP_INTERVAL, DEFAULT_SWEEP_INTERVAL)
}

pub async fn run() -> anyhow::Result<()> {
    let runtime = RuntimeConfig::from_env().context("runtime configuration")?;
    let db = DbConfig::from_env().context("database configuration")?;
    let topics = Topics::from_env(TOPICS).context("topic configuration")?;

    let pool = connect_with_retry(&db).await.context("database")?;
    migrate(&pool).await.context("schema migration")?;
    let cache = RedisBackend::connect(&runtime.redis_url).await.context("redis")?;
    let bus: Arc<dyn MessageBus> = Arc::new(
        RedisStreamsBus::connect(
            &runtime.redis_url,
            StreamsConfig::default().with_partitions(runtime.partitions),
        )
        .await
        .context("message bus")?,
    );

    let sessions: Arc<Sessions> = Arc::new(SessionRegistry::new(RedisRegistry::new(cache, SESSION_NAMESPACE)));
    let timeouts = SessionTimeoutTask::new(sessions, bus, &topics)?
        .with_timeout(runtime.session_timeout)
        .with_interval(sweep_interval(runtime.session_timeout))
        .with_history(SessionHistoryRepository::new(pool));

    let (stop, stopped) = watch::channel(false);
    let workers = vec![spawn_periodic(Arc::new(timeouts), stopped)];
    info!(
        session_timeout_ms = runtime.session_timeout.as_millis() as u64,
        sweep_interval_ms = sweep_interval(runtime.session_timeout).as_millis() as u64,
        "session coordinator running"
    );

    shutdown::signal().await;
    let _ = stop.send(true);
    shutdown::join_all(workers).await;
    info!("session coordinator stopped");
    Ok(())
}
