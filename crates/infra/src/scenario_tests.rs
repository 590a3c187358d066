//! End-to-end scenarios across registries, the consumer runtime and the
//! orchestrator, all on in-process backends.
//!
//! - Map membership and sessions stay inside their tenant
//! - A storage deposit saga runs command by command over the bus
//! - A failing step is compensated and the saga reported failed
//! - Reservations and the distributed mutex behave under time and contention

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use atlas_core::{
    AccountId, AssetId, ChannelId, CharacterId, Field, ItemId, ManualClock, MapId, OperationContext,
    TransactionId, WorldId,
};
use atlas_events::topic::*;
use atlas_events::{
    Envelope, Handler, HandlerError, HandlerOutcome, InMemoryBus, Message, MessageBuffer, MessageBus,
    PartitionKey, RawEnvelope, Topics,
};
use atlas_saga::payload::TransferToStorage;
use atlas_saga::{Action, AssetSnapshot, Saga, SagaCommand, SagaType, Step, StepStatusBody, StepStatusEvent};

use crate::cache::InMemoryBackend;
use crate::consumer::{ConsumerConfig, ConsumerManager};
use crate::lock::{DistributedMutex, LockConfig};
use crate::registry::test_support::tenant;
use crate::registry::{CharacterMapRegistry, RedisRegistry, RegistryError};
use crate::reservation::{ReservationRegistry, SlotKey};
use crate::saga::{
    AssetLocation, InMemoryAssetSource, InMemorySagaStore, SagaCommandHandler, SagaOrchestrator, SagaStatus,
    SagaStore, StepStatusHandler,
};
use crate::session::{SessionEntry, SessionRegistry, SessionState, SessionTimeoutTask};
use crate::worker::spawn_periodic_worker;

const TOPICS: &[&str] = &[
    COMMAND_TOPIC_SAGA,
    EVENT_TOPIC_SAGA_STATUS,
    EVENT_TOPIC_SAGA_STEP_STATUS,
    COMMAND_TOPIC_CHARACTER,
    COMMAND_TOPIC_COMPARTMENT,
    COMMAND_TOPIC_STORAGE,
    COMMAND_TOPIC_CASH_SHOP,
    COMMAND_TOPIC_QUEST,
    COMMAND_TOPIC_CHARACTER_SESSION,
];

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn map_membership_is_tenant_isolated() {
    let maps = CharacterMapRegistry::new(InMemoryBackend::new());
    let a = tenant("GMS");
    let b = tenant("GMS");
    let field = Field::new(WorldId(0), ChannelId(1), MapId(100000000));

    maps.enter(&a, &field, CharacterId(100)).await.unwrap();
    maps.enter(&b, &field, CharacterId(200)).await.unwrap();
    assert_eq!(maps.get_in_map(&a, &field).await.unwrap(), vec![CharacterId(100)]);
    assert_eq!(maps.get_in_map(&b, &field).await.unwrap(), vec![CharacterId(200)]);

    maps.exit(&a, &field, CharacterId(100)).await.unwrap();
    assert!(maps.get_in_map(&a, &field).await.unwrap().is_empty());
    assert_eq!(maps.get_in_map(&b, &field).await.unwrap(), vec![CharacterId(200)]);
}

#[tokio::test]
async fn login_conflicts_until_the_session_is_in_transition() {
    let sessions = SessionRegistry::new(RedisRegistry::<_, CharacterId, SessionEntry>::new(
        InMemoryBackend::new(),
        "character-session",
    ));
    let t = tenant("GMS");
    let c = CharacterId(12345);

    sessions.login(&t, c, AccountId(1), WorldId(0), ChannelId(1)).await.unwrap();
    let err = sessions
        .login(&t, c, AccountId(1), WorldId(0), ChannelId(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyPresent(_)));

    // Same character id under another tenant is a different session.
    sessions
        .login(&tenant("GMS"), c, AccountId(1), WorldId(0), ChannelId(1))
        .await
        .unwrap();

    sessions.transition(&t, c, AccountId(1), WorldId(0), ChannelId(1)).await.unwrap();
    sessions.login(&t, c, AccountId(1), WorldId(0), ChannelId(2)).await.unwrap();
    assert_eq!(sessions.get(&t, c).await.unwrap().unwrap().state, SessionState::LoggedIn);
}

#[tokio::test(start_paused = true)]
async fn periodic_sweep_logs_out_a_stale_transition() {
    let clock = ManualClock::default();
    let sessions = Arc::new(
        SessionRegistry::new(RedisRegistry::<_, CharacterId, SessionEntry>::new(
            InMemoryBackend::new(),
            "character-session",
        ))
        .with_clock(Arc::new(clock.clone())),
    );
    let bus = InMemoryBus::new();
    let task = SessionTimeoutTask::new(sessions.clone(), Arc::new(bus.clone()), &Topics::identity(TOPICS))
        .unwrap()
        .with_interval(Duration::from_millis(100));
    let t = tenant("GMS");
    sessions
        .transition(&t, CharacterId(7), AccountId(70), WorldId(0), ChannelId(1))
        .await
        .unwrap();

    let worker = spawn_periodic_worker(Arc::new(task));
    clock.advance(Duration::from_millis(4900));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(bus.produced_to(COMMAND_TOPIC_CHARACTER_SESSION).is_empty());

    clock.advance(Duration::from_millis(200));
    tokio::time::sleep(Duration::from_millis(350)).await;
    let logouts = bus.produced_to(COMMAND_TOPIC_CHARACTER_SESSION);
    assert_eq!(logouts.len(), 1);
    let envelope = logouts[0].envelope().unwrap();
    assert_eq!(envelope.kind, "LOGOUT");
    assert_eq!(envelope.body["characterId"], 7);
    assert!(sessions.get(&t, CharacterId(7)).await.unwrap().is_none());
    worker.shutdown().await;
}

/// Stands in for a step-executing service: answers every command with a step
/// status event, failing the kinds listed in `fail`.
struct FakeService {
    seen: Mutex<Vec<String>>,
    fail: &'static [&'static str],
}

impl FakeService {
    fn new(fail: &'static [&'static str]) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail,
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for FakeService {
    fn name(&self) -> &str {
        "fake-service"
    }

    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &RawEnvelope,
        buffer: &mut MessageBuffer,
    ) -> Result<HandlerOutcome, HandlerError> {
        ctx.require_tenant()?;
        self.seen.lock().unwrap().push(envelope.kind.clone());
        let body = StepStatusBody {
            step_id: None,
            details: json!({ "assetId": 901, "reason": "slot locked" }),
        };
        let event = if self.fail.contains(&envelope.kind.as_str()) {
            StepStatusEvent::Failed(body)
        } else {
            StepStatusEvent::Completed(body)
        };
        buffer.put_envelope(
            ctx,
            EVENT_TOPIC_SAGA_STEP_STATUS,
            envelope.transaction_id,
            Envelope::new(envelope.transaction_id, envelope.world_id, None, event),
        )?;
        Ok(HandlerOutcome::Continue)
    }
}

struct SagaStack {
    bus: InMemoryBus,
    store: Arc<InMemorySagaStore>,
    reservations: Arc<ReservationRegistry<InMemoryBackend>>,
    consumers: crate::worker::WorkerHandle,
}

async fn saga_stack(storage: Arc<FakeService>, compartment: Arc<FakeService>) -> SagaStack {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemorySagaStore::new());
    let assets = InMemoryAssetSource::new();
    assets.insert(
        AssetLocation::CharacterSlot {
            character_id: CharacterId(1),
            inventory_type: 2,
            slot: 1,
        },
        AssetSnapshot {
            asset_id: AssetId(700),
            template_id: ItemId(2000000),
            reference_id: 12,
            reference_type: "consumable".into(),
            reference_data: json!({}),
            quantity: 20,
            compartment_id: Uuid::nil(),
        },
    );
    let reservations = Arc::new(ReservationRegistry::new(InMemoryBackend::new()));
    let orchestrator = Arc::new(
        SagaOrchestrator::new(store.clone(), Arc::new(assets), Topics::identity(TOPICS))
            .with_reservations(reservations.clone()),
    );

    let manager = ConsumerManager::new(Arc::new(bus.clone()));
    for (name, topic) in [
        ("saga-command", COMMAND_TOPIC_SAGA),
        ("saga-step-status", EVENT_TOPIC_SAGA_STEP_STATUS),
        ("storage", COMMAND_TOPIC_STORAGE),
        ("compartment", COMMAND_TOPIC_COMPARTMENT),
    ] {
        manager.add_consumer(ConsumerConfig::new(name, topic, "scenario"));
    }
    manager.register_handler(COMMAND_TOPIC_SAGA, Arc::new(SagaCommandHandler::typed(orchestrator.clone())));
    manager.register_handler(EVENT_TOPIC_SAGA_STEP_STATUS, Arc::new(StepStatusHandler::typed(orchestrator)));
    manager.register_handler(COMMAND_TOPIC_STORAGE, storage);
    manager.register_handler(COMMAND_TOPIC_COMPARTMENT, compartment);
    let consumers = manager.spawn().await.unwrap();

    SagaStack {
        bus,
        store,
        reservations,
        consumers,
    }
}

fn deposit(tx: TransactionId) -> Message {
    let saga = Saga::new(tx, SagaType::StorageOperation, "character:1")
        .with_step(Step::pending(
            "deposit",
            Action::TransferToStorage(TransferToStorage {
                transaction_id: tx,
                character_id: CharacterId(1),
                world_id: WorldId(0),
                account_id: AccountId(5),
                source_slot: 1,
                source_inventory_type: 2,
                quantity: 1,
            }),
            Utc::now(),
        ))
        .unwrap();
    Message::from_envelope(
        COMMAND_TOPIC_SAGA,
        tx,
        Envelope::new(tx, WorldId(0), None, SagaCommand::Create(saga)),
    )
    .unwrap()
}

fn saga_statuses(bus: &InMemoryBus) -> Vec<RawEnvelope> {
    bus.produced_to(EVENT_TOPIC_SAGA_STATUS)
        .iter()
        .map(|m| m.envelope().unwrap())
        .collect()
}

#[tokio::test]
async fn storage_deposit_saga_runs_to_completion_over_the_bus() {
    let storage = FakeService::new(&[]);
    let compartment = FakeService::new(&[]);
    let stack = saga_stack(storage.clone(), compartment.clone()).await;
    let t = tenant("GMS");
    let tx = TransactionId::new();

    stack.bus.produce(vec![deposit(tx).with_tenant(&t)]).await.unwrap();
    assert!(eventually(|| saga_statuses(&stack.bus).len() == 1).await);

    let status = &saga_statuses(&stack.bus)[0];
    assert_eq!(status.kind, "COMPLETED");
    assert_eq!(status.transaction_id, tx);

    let accept = &stack.bus.produced_to(COMMAND_TOPIC_STORAGE)[0];
    assert_eq!(accept.key, PartitionKey::from(tx));
    assert_eq!(accept.envelope().unwrap().kind, "ACCEPT");
    let release = &stack.bus.produced_to(COMMAND_TOPIC_COMPARTMENT)[0];
    assert_eq!(release.envelope().unwrap().kind, "RELEASE");
    assert_eq!(storage.seen(), vec!["ACCEPT"]);
    assert_eq!(compartment.seen(), vec!["RELEASE"]);

    let ctx = OperationContext::background().with_tenant(t.clone());
    let record = stack.store.get(&ctx, tx).await.unwrap().unwrap();
    assert_eq!(record.status, SagaStatus::Completed);
    assert_eq!(
        stack
            .reservations
            .reserved_quantity(&t, SlotKey::new(1, 2, 1))
            .await
            .unwrap(),
        0
    );
    stack.consumers.shutdown().await;
}

#[tokio::test]
async fn failed_release_is_compensated_and_reported() {
    let storage = FakeService::new(&[]);
    let compartment = FakeService::new(&["RELEASE"]);
    let stack = saga_stack(storage.clone(), compartment).await;
    let t = tenant("GMS");
    let tx = TransactionId::new();

    stack.bus.produce(vec![deposit(tx).with_tenant(&t)]).await.unwrap();
    assert!(eventually(|| saga_statuses(&stack.bus).len() == 1).await);

    let failed = &saga_statuses(&stack.bus)[0];
    assert_eq!(failed.kind, "FAILED");
    assert_eq!(failed.body["failedStep"], "deposit.release");
    assert_eq!(failed.body["reason"], "slot locked");

    // The accepted asset is released from storage again.
    let storage_commands: Vec<String> = stack
        .bus
        .produced_to(COMMAND_TOPIC_STORAGE)
        .iter()
        .map(|m| m.envelope().unwrap().kind)
        .collect();
    assert_eq!(storage_commands, vec!["ACCEPT", "RELEASE"]);
    assert!(eventually(|| storage.seen().len() == 2).await);

    let ctx = OperationContext::background().with_tenant(t.clone());
    let record = stack.store.get(&ctx, tx).await.unwrap().unwrap();
    assert_eq!(record.status, SagaStatus::Failed);
    assert!(record.reservations.is_empty());
    stack.consumers.shutdown().await;
}

#[tokio::test]
async fn reserved_quantity_tracks_adds_removals_and_expiry() {
    let clock = ManualClock::default();
    let backend = InMemoryBackend::new();
    let reservations = ReservationRegistry::new(backend.clone())
        .with_mutex(DistributedMutex::new(backend))
        .with_clock(Arc::new(clock.clone()));
    let t = tenant("GMS");
    let slot = SlotKey::new(1, 1, 3);
    let ttl = Duration::from_secs(10);

    let txs = [TransactionId::new(), TransactionId::new(), TransactionId::new()];
    for (tx, quantity) in txs.iter().zip([2, 3, 5]) {
        reservations.add(&t, *tx, slot, ItemId(2000000), quantity, ttl).await.unwrap();
    }
    assert_eq!(reservations.reserved_quantity(&t, slot).await.unwrap(), 10);

    reservations.remove(&t, txs[1], slot).await.unwrap();
    assert_eq!(reservations.reserved_quantity(&t, slot).await.unwrap(), 7);

    clock.advance(Duration::from_secs(11));
    assert_eq!(reservations.reserved_quantity(&t, slot).await.unwrap(), 0);
    assert!(reservations.list(&t, slot).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn contended_lock_is_exclusive_and_survives_a_crashed_holder() {
    let mutex = DistributedMutex::with_config(
        InMemoryBackend::new(),
        LockConfig::default()
            .with_ttl(Duration::from_secs(2))
            .with_acquire_timeout(Duration::from_secs(10)),
    );

    let (a, b) = tokio::join!(mutex.lock("invlock:1:1"), async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        let started = tokio::time::Instant::now();
        let guard = mutex.lock("invlock:1:1").await;
        (guard, started.elapsed())
    });
    let first = a.unwrap();
    let (second, waited) = b;
    let second = second.unwrap();
    // The first holder never unlocks; its key expires after the TTL.
    assert!(!first.forced());
    assert!(!second.forced());
    assert!(waited <= Duration::from_secs(2) + Duration::from_millis(100));
    assert!(waited >= Duration::from_secs(1));
    drop(first);
    assert!(mutex.unlock(second).await.unwrap());

    let first = mutex.lock("invlock:1:1").await.unwrap();
    let contender = {
        let mutex = mutex.clone();
        tokio::spawn(async move { mutex.lock("invlock:1:1").await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!contender.is_finished());
    assert!(mutex.unlock(first).await.unwrap());
    let next = contender.await.unwrap().unwrap();
    assert!(mutex.unlock(next).await.unwrap());
}
