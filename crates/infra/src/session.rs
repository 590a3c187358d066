//! Character sessions: who is logged in where, and the transition timeout sweep.
//!
//! A character moving between channels sits in [`SessionState::Transition`]; if it
//! does not log in again within the timeout, [`SessionTimeoutTask`] removes the
//! entry and asks the session service to log the character out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use atlas_core::{
    AccountId, ChannelId, CharacterId, Clock, CoreError, OperationContext, SystemClock, Tenant,
    TransactionId, WorldId,
};
use atlas_events::topic::COMMAND_TOPIC_CHARACTER_SESSION;
use atlas_events::{Envelope, MessageBody, MessageBus, Topics, emit};

use crate::db::SessionHistoryRepository;
use crate::registry::{RegistryError, TenantRegistry};
use crate::worker::PeriodicTask;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// How often [`SessionTimeoutTask`] looks for stale transitions unless configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const LOGIN_ATTEMPTS: usize = 8;

fn already_logged_in(character_id: CharacterId) -> RegistryError {
    RegistryError::AlreadyPresent(format!("session for character {character_id}"))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    LoggedIn,
    Transition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub account_id: AccountId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub state: SessionState,
    pub updated_at: DateTime<Utc>,
}

/// Commands understood by the character session service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "body",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum SessionCommand {
    Logout {
        character_id: CharacterId,
        account_id: AccountId,
        world_id: WorldId,
        channel_id: ChannelId,
        issuer: String,
    },
}

impl MessageBody for SessionCommand {
    const TYPES: &'static [&'static str] = &["LOGOUT"];

    fn type_tag(&self) -> &'static str {
        match self {
            SessionCommand::Logout { .. } => "LOGOUT",
        }
    }
}

pub struct SessionRegistry<R> {
    registry: R,
    clock: Arc<dyn Clock>,
}

impl<R> core::fmt::Debug for SessionRegistry<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl<R> SessionRegistry<R>
where
    R: TenantRegistry<CharacterId, SessionEntry>,
{
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Register a login. A second login while already logged in is refused;
    /// logging in over a pending transition replaces it. The replacement only
    /// lands if the transition is still the stored entry, so of two channels
    /// racing to log the same character in exactly one succeeds.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id(), character_id = %character_id), err)]
    pub async fn login(
        &self,
        tenant: &Tenant,
        character_id: CharacterId,
        account_id: AccountId,
        world_id: WorldId,
        channel_id: ChannelId,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(account_id, world_id, channel_id, SessionState::LoggedIn);
        for _ in 0..LOGIN_ATTEMPTS {
            match self.registry.add(tenant, character_id, entry.clone()).await {
                Err(RegistryError::AlreadyPresent(_)) => {}
                other => return other,
            }
            match self.registry.get(tenant, &character_id).await? {
                // Removed since the add; try inserting again.
                None => continue,
                Some(existing) if existing.state == SessionState::LoggedIn => {
                    return Err(already_logged_in(character_id));
                }
                Some(transition) => {
                    if self
                        .registry
                        .compare_and_swap(tenant, character_id, &transition, entry.clone())
                        .await?
                    {
                        return Ok(());
                    }
                }
            }
        }
        Err(RegistryError::Contended(format!("session for character {character_id}")))
    }

    /// Mark the character as changing channel; the timeout clock starts now.
    pub async fn transition(
        &self,
        tenant: &Tenant,
        character_id: CharacterId,
        account_id: AccountId,
        world_id: WorldId,
        channel_id: ChannelId,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(account_id, world_id, channel_id, SessionState::Transition);
        self.registry.set(tenant, character_id, entry).await
    }

    pub async fn logout(&self, tenant: &Tenant, character_id: CharacterId) -> Result<bool, RegistryError> {
        self.registry.remove(tenant, &character_id).await
    }

    pub async fn get(
        &self,
        tenant: &Tenant,
        character_id: CharacterId,
    ) -> Result<Option<SessionEntry>, RegistryError> {
        self.registry.get(tenant, &character_id).await
    }

    fn entry(
        &self,
        account_id: AccountId,
        world_id: WorldId,
        channel_id: ChannelId,
        state: SessionState,
    ) -> SessionEntry {
        SessionEntry {
            account_id,
            world_id,
            channel_id,
            state,
            updated_at: self.clock.now(),
        }
    }
}

/// Expires transition entries older than the timeout.
pub struct SessionTimeoutTask<R> {
    sessions: Arc<SessionRegistry<R>>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    timeout: Duration,
    interval: Duration,
    history: Option<SessionHistoryRepository>,
}

impl<R> SessionTimeoutTask<R>
where
    R: TenantRegistry<CharacterId, SessionEntry> + 'static,
{
    pub fn new(
        sessions: Arc<SessionRegistry<R>>,
        bus: Arc<dyn MessageBus>,
        topics: &Topics,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            sessions,
            bus,
            topic: topics.get(COMMAND_TOPIC_CHARACTER_SESSION)?.to_string(),
            timeout: DEFAULT_SESSION_TIMEOUT,
            interval: DEFAULT_SWEEP_INTERVAL,
            history: None,
        })
    }

    /// Close the character's open `sessions_history` row on every timeout logout.
    pub fn with_history(mut self, history: SessionHistoryRepository) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep; returns the characters that were logged out.
    pub async fn sweep(&self) -> Result<Vec<(Tenant, CharacterId)>, CoreError> {
        let now = self.sessions.clock.now();
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero());

        let expired: Vec<(Tenant, CharacterId, SessionEntry)> = self
            .sessions
            .registry
            .get_all_cross_tenant()
            .await?
            .into_iter()
            .filter(|(_, _, entry)| {
                entry.state == SessionState::Transition && now - entry.updated_at > timeout
            })
            .collect();

        let mut logged_out = Vec::with_capacity(expired.len());
        for (tenant, character_id, entry) in expired {
            // Only the exact entry that was seen expiring is removed; a login or
            // a fresh transition written since the snapshot stays untouched.
            if !self
                .sessions
                .registry
                .compare_and_remove(&tenant, &character_id, &entry)
                .await?
            {
                debug!(character_id = %character_id, "session changed during sweep, skipping");
                continue;
            }
            let ctx = OperationContext::background().with_tenant(tenant.clone());
            if let Err(err) = self.emit_logout(&ctx, character_id, &entry).await {
                // Put the entry back so the next sweep retries the logout, unless
                // the character has logged in again in the meantime.
                match self.sessions.registry.add(&tenant, character_id, entry).await {
                    Ok(()) | Err(RegistryError::AlreadyPresent(_)) => {}
                    Err(restore) => {
                        warn!(character_id = %character_id, error = %restore, "could not restore timed out session")
                    }
                }
                return Err(err);
            }
            info!(
                tenant_id = %tenant.id(),
                character_id = %character_id,
                "session transition timed out, logging out"
            );
            if let Some(history) = &self.history {
                if let Err(err) = history.end(&ctx, character_id, now).await {
                    warn!(character_id = %character_id, error = %err, "could not close session history");
                }
            }
            logged_out.push((tenant, character_id));
        }
        Ok(logged_out)
    }
}

impl<R> SessionTimeoutTask<R> {
    async fn emit_logout(
        &self,
        ctx: &OperationContext,
        character_id: CharacterId,
        entry: &SessionEntry,
    ) -> Result<(), CoreError> {
        let envelope = Envelope::new(
            TransactionId::new(),
            entry.world_id,
            Some(entry.channel_id),
            SessionCommand::Logout {
                character_id,
                account_id: entry.account_id,
                world_id: entry.world_id,
                channel_id: entry.channel_id,
                issuer: "INTERNAL".to_string(),
            },
        );
        emit(self.bus.as_ref(), |buffer| {
            buffer.put_envelope(ctx, &self.topic, character_id, envelope)
        })
        .await
        .map_err(|err| CoreError::transient(err.to_string()))
    }
}

#[async_trait]
impl<R> PeriodicTask for SessionTimeoutTask<R>
where
    R: TenantRegistry<CharacterId, SessionEntry> + 'static,
{
    fn name(&self) -> &str {
        "session-timeout"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<(), CoreError> {
        self.sweep().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::registry::test_support::tenant;
    use atlas_core::ManualClock;
    use atlas_events::InMemoryBus;

    fn sessions(clock: &ManualClock) -> Arc<SessionRegistry<InMemoryRegistry<CharacterId, SessionEntry>>> {
        Arc::new(SessionRegistry::new(InMemoryRegistry::new()).with_clock(Arc::new(clock.clone())))
    }

    type Write = (Tenant, CharacterId, SessionEntry);

    /// Registry that lets another writer land right after a read, the way a
    /// second channel or service instance would.
    #[derive(Default)]
    struct Interleaved {
        inner: InMemoryRegistry<CharacterId, SessionEntry>,
        after_get: std::sync::Mutex<Option<Write>>,
        after_snapshot: std::sync::Mutex<Option<Write>>,
    }

    impl Interleaved {
        async fn apply(&self, slot: &std::sync::Mutex<Option<Write>>) {
            let write = slot.lock().unwrap().take();
            if let Some((tenant, character_id, entry)) = write {
                self.inner.set(&tenant, character_id, entry).await.unwrap();
            }
        }
    }

    #[async_trait]
    impl TenantRegistry<CharacterId, SessionEntry> for Interleaved {
        async fn get(&self, tenant: &Tenant, key: &CharacterId) -> Result<Option<SessionEntry>, RegistryError> {
            let current = self.inner.get(tenant, key).await;
            self.apply(&self.after_get).await;
            current
        }

        async fn set(&self, tenant: &Tenant, key: CharacterId, value: SessionEntry) -> Result<(), RegistryError> {
            self.inner.set(tenant, key, value).await
        }

        async fn add(&self, tenant: &Tenant, key: CharacterId, value: SessionEntry) -> Result<(), RegistryError> {
            self.inner.add(tenant, key, value).await
        }

        async fn remove(&self, tenant: &Tenant, key: &CharacterId) -> Result<bool, RegistryError> {
            self.inner.remove(tenant, key).await
        }

        async fn compare_and_remove(
            &self,
            tenant: &Tenant,
            key: &CharacterId,
            expected: &SessionEntry,
        ) -> Result<bool, RegistryError> {
            self.inner.compare_and_remove(tenant, key, expected).await
        }

        async fn compare_and_swap(
            &self,
            tenant: &Tenant,
            key: CharacterId,
            expected: &SessionEntry,
            value: SessionEntry,
        ) -> Result<bool, RegistryError> {
            self.inner.compare_and_swap(tenant, key, expected, value).await
        }

        async fn get_all(&self, tenant: &Tenant) -> Result<Vec<SessionEntry>, RegistryError> {
            self.inner.get_all(tenant).await
        }

        async fn get_all_cross_tenant(&self) -> Result<Vec<(Tenant, CharacterId, SessionEntry)>, RegistryError> {
            let snapshot = self.inner.get_all_cross_tenant().await;
            self.apply(&self.after_snapshot).await;
            snapshot
        }
    }

    fn logged_in(channel: u8, clock: &ManualClock) -> SessionEntry {
        SessionEntry {
            account_id: AccountId(1),
            world_id: WorldId(0),
            channel_id: ChannelId(channel),
            state: SessionState::LoggedIn,
            updated_at: clock.now(),
        }
    }

    #[tokio::test]
    async fn second_login_conflicts_but_login_over_transition_succeeds() {
        let clock = ManualClock::default();
        let sessions = sessions(&clock);
        let t = tenant("GMS");
        let c = CharacterId(12345);

        sessions.login(&t, c, AccountId(1), WorldId(0), ChannelId(1)).await.unwrap();
        let err = sessions
            .login(&t, c, AccountId(1), WorldId(0), ChannelId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyPresent(_)));

        sessions
            .transition(&t, c, AccountId(1), WorldId(0), ChannelId(1))
            .await
            .unwrap();
        sessions.login(&t, c, AccountId(1), WorldId(0), ChannelId(2)).await.unwrap();
        let entry = sessions.get(&t, c).await.unwrap().unwrap();
        assert_eq!(entry.state, SessionState::LoggedIn);
        assert_eq!(entry.channel_id, ChannelId(2));
    }

    #[tokio::test]
    async fn login_over_transition_loses_to_a_concurrent_login() {
        let clock = ManualClock::default();
        let sessions = SessionRegistry::new(Interleaved::default()).with_clock(Arc::new(clock.clone()));
        let t = tenant("GMS");
        let c = CharacterId(12345);
        sessions
            .transition(&t, c, AccountId(1), WorldId(0), ChannelId(1))
            .await
            .unwrap();
        // Channel 9 completes its login between our read and our write.
        *sessions.registry().after_get.lock().unwrap() = Some((t.clone(), c, logged_in(9, &clock)));

        let err = sessions
            .login(&t, c, AccountId(1), WorldId(0), ChannelId(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyPresent(_)));
        assert_eq!(sessions.get(&t, c).await.unwrap().unwrap().channel_id, ChannelId(9));
    }

    #[tokio::test]
    async fn sweep_leaves_a_login_that_lands_after_the_snapshot() {
        let clock = ManualClock::default();
        let sessions =
            Arc::new(SessionRegistry::new(Interleaved::default()).with_clock(Arc::new(clock.clone())));
        let bus = Arc::new(InMemoryBus::new());
        let topics = Topics::identity(&[COMMAND_TOPIC_CHARACTER_SESSION]);
        let task = SessionTimeoutTask::new(sessions.clone(), bus.clone(), &topics).unwrap();
        let t = tenant("GMS");
        let c = CharacterId(7);

        sessions
            .transition(&t, c, AccountId(1), WorldId(0), ChannelId(3))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(5100));
        *sessions.registry().after_snapshot.lock().unwrap() = Some((t.clone(), c, logged_in(4, &clock)));

        assert!(task.sweep().await.unwrap().is_empty());
        let entry = sessions.get(&t, c).await.unwrap().unwrap();
        assert_eq!(entry.state, SessionState::LoggedIn);
        assert_eq!(entry.channel_id, ChannelId(4));
        assert!(bus.produced().is_empty());
    }

    #[tokio::test]
    async fn logout_is_retried_when_the_bus_was_down() {
        let clock = ManualClock::default();
        let sessions = sessions(&clock);
        let bus = Arc::new(InMemoryBus::new());
        let topics = Topics::identity(&[COMMAND_TOPIC_CHARACTER_SESSION]);
        let task = SessionTimeoutTask::new(sessions.clone(), bus.clone(), &topics).unwrap();
        let t = tenant("GMS");
        let c = CharacterId(7);

        sessions
            .transition(&t, c, AccountId(70), WorldId(0), ChannelId(3))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(5100));

        bus.set_available(false);
        assert!(task.sweep().await.is_err());
        assert_eq!(
            sessions.get(&t, c).await.unwrap().map(|e| e.state),
            Some(SessionState::Transition)
        );

        bus.set_available(true);
        assert_eq!(task.sweep().await.unwrap(), vec![(t.clone(), c)]);
        assert!(sessions.get(&t, c).await.unwrap().is_none());
        assert_eq!(bus.produced().len(), 1);
    }

    #[tokio::test]
    async fn stale_transition_is_logged_out_once() {
        let clock = ManualClock::default();
        let sessions = sessions(&clock);
        let bus = Arc::new(InMemoryBus::new());
        let topics = Topics::identity(&[COMMAND_TOPIC_CHARACTER_SESSION]);
        let task = SessionTimeoutTask::new(sessions.clone(), bus.clone(), &topics).unwrap();
        let t = tenant("GMS");

        sessions
            .transition(&t, CharacterId(7), AccountId(70), WorldId(0), ChannelId(3))
            .await
            .unwrap();
        sessions
            .login(&t, CharacterId(8), AccountId(80), WorldId(0), ChannelId(3))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(4900));
        assert!(task.sweep().await.unwrap().is_empty());

        clock.advance(Duration::from_millis(200));
        let out = task.sweep().await.unwrap();
        assert_eq!(out, vec![(t.clone(), CharacterId(7))]);
        assert!(sessions.get(&t, CharacterId(7)).await.unwrap().is_none());
        assert!(sessions.get(&t, CharacterId(8)).await.unwrap().is_some());

        let produced = bus.produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].topic, COMMAND_TOPIC_CHARACTER_SESSION);
        assert_eq!(Tenant::from_headers(&produced[0].headers).unwrap(), t);
        let envelope = produced[0].envelope().unwrap().decode::<SessionCommand>().unwrap();
        let SessionCommand::Logout { character_id, .. } = envelope.body;
        assert_eq!(character_id, CharacterId(7));

        assert!(task.sweep().await.unwrap().is_empty());
        assert_eq!(bus.produced().len(), 1);
    }
}
