//! Saga execution engine.
//!
//! The orchestrator owns no state between calls: every entry point loads the
//! saga record, moves it forward, stores it at the version it was read at and
//! only then releases the staged commands into the caller's buffer. A lost race
//! surfaces as a transient [`SagaStoreError::VersionConflict`], so the bus
//! redelivers the triggering message and the work is redone on fresh state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use atlas_core::{
    Classified, Clock, CoreError, ErrorKind, OperationContext, SystemClock, TransactionId, WorldId,
};
use atlas_events::topic::EVENT_TOPIC_SAGA_STATUS;
use atlas_events::{BusError, Envelope, MessageBuffer, RawEnvelope, Topics};
use atlas_saga::payload::StartQuest;
use atlas_saga::{
    Action, AssetSnapshot, Saga, SagaError, SagaStatusEvent, Step, StepOutcome, StepStatusBody,
    compensation_for, expand,
};

use crate::cache::CacheBackend;
use crate::config::DEFAULT_SAGA_TIMEOUT;
use crate::reservation::{ReservationError, ReservationRegistry, SlotKey};
use crate::saga::assets::{AssetError, AssetLocation, AssetSource};
use crate::saga::store::{SagaRecord, SagaStatus, SagaStore, SagaStoreError};

/// How much longer than the saga a reservation lives.
const RESERVATION_GRACE: Duration = Duration::from_secs(60);

const RESULT_NEXT_QUEST_ID: &str = "nextQuestId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub saga_timeout: Duration,
    pub reservation_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            saga_timeout: DEFAULT_SAGA_TIMEOUT,
            reservation_ttl: DEFAULT_SAGA_TIMEOUT + RESERVATION_GRACE,
        }
    }
}

impl OrchestratorConfig {
    /// Also stretches the reservation TTL past the new timeout.
    pub fn with_saga_timeout(mut self, timeout: Duration) -> Self {
        self.saga_timeout = timeout;
        self.reservation_ttl = timeout + RESERVATION_GRACE;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("saga {0} not found")]
    UnknownSaga(TransactionId),

    #[error("step {step_id} of saga {transaction_id} is not the step awaiting a result")]
    UnexpectedStep {
        transaction_id: TransactionId,
        step_id: String,
    },

    #[error("step {0} has no command route")]
    Unroutable(String),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Store(#[from] SagaStoreError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("cannot encode step payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Context(#[from] CoreError),
}

impl Classified for OrchestratorError {
    fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::UnknownSaga(_) => ErrorKind::NotFound,
            OrchestratorError::UnexpectedStep { .. } => ErrorKind::PreconditionFailed,
            OrchestratorError::Unroutable(_) | OrchestratorError::Encode(_) => ErrorKind::Fatal,
            OrchestratorError::Saga(err) => err.kind(),
            OrchestratorError::Store(err) => err.kind(),
            OrchestratorError::Asset(err) => err.kind(),
            OrchestratorError::Reservation(err) => err.kind(),
            OrchestratorError::Bus(err) => err.kind(),
            OrchestratorError::Context(err) => err.kind(),
        }
    }
}

impl From<OrchestratorError> for CoreError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Context(inner) => inner,
            other => match other.kind() {
                ErrorKind::BadInput => CoreError::bad_input(other.to_string()),
                ErrorKind::NotFound => CoreError::not_found(other.to_string()),
                ErrorKind::AlreadyExists => CoreError::already_exists(other.to_string()),
                ErrorKind::PreconditionFailed => CoreError::precondition(other.to_string()),
                ErrorKind::Transient => CoreError::transient(other.to_string()),
                ErrorKind::Fatal => CoreError::fatal(other.to_string()),
            },
        }
    }
}

pub struct SagaOrchestrator<B> {
    store: Arc<dyn SagaStore>,
    assets: Arc<dyn AssetSource>,
    reservations: Option<Arc<ReservationRegistry<B>>>,
    topics: Topics,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl<B> core::fmt::Debug for SagaOrchestrator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("config", &self.config)
            .field("reserving", &self.reservations.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: CacheBackend> SagaOrchestrator<B> {
    pub fn new(store: Arc<dyn SagaStore>, assets: Arc<dyn AssetSource>, topics: Topics) -> Self {
        Self {
            store,
            assets,
            reservations: None,
            topics,
            clock: Arc::new(SystemClock),
            config: OrchestratorConfig::default(),
        }
    }

    /// Reserve the source slot of character-side moves while they are in flight.
    pub fn with_reservations(mut self, reservations: Arc<ReservationRegistry<B>>) -> Self {
        self.reservations = Some(reservations);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    /// Start a saga. A transaction id that is already known is a redelivery and
    /// leaves `buffer` untouched.
    #[instrument(skip(self, ctx, saga, buffer), fields(transaction_id = %saga.transaction_id, saga_type = %saga.saga_type.as_str()), err)]
    pub async fn create(
        &self,
        ctx: &OperationContext,
        saga: Saga,
        buffer: &mut MessageBuffer,
    ) -> Result<(), OrchestratorError> {
        let tenant = ctx.require_tenant()?.clone();
        let transaction_id = saga.transaction_id;
        if self.store.get(ctx, transaction_id).await?.is_some() {
            debug!("saga already exists; create ignored");
            return Ok(());
        }
        saga.validate()?;

        let mut record = SagaRecord::new(tenant, saga, self.clock.now(), self.config.saga_timeout);
        let mut staged = MessageBuffer::new();
        self.advance(ctx, &mut record, &mut staged).await?;
        match self.store.put(ctx, &mut record).await {
            Ok(()) => {}
            Err(SagaStoreError::Duplicate(_)) => {
                debug!("saga created concurrently; create ignored");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        absorb(buffer, staged);
        info!(tenant_id = %record.tenant.id(), status = %record.status, "saga created");
        Ok(())
    }

    /// Apply a step result reported by the service that executed it.
    ///
    /// The result is matched to the earliest pending step. A named step that
    /// is no longer pending means the event was already applied; it is ignored.
    #[instrument(skip(self, ctx, body, buffer), fields(transaction_id = %transaction_id, ?outcome), err)]
    pub async fn step_completed(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        outcome: StepOutcome,
        body: StepStatusBody,
        buffer: &mut MessageBuffer,
    ) -> Result<SagaStatus, OrchestratorError> {
        let Some(mut record) = self.store.get(ctx, transaction_id).await? else {
            return Err(OrchestratorError::UnknownSaga(transaction_id));
        };
        if !record.status.is_open() {
            debug!(status = %record.status, "step result for a finished saga ignored");
            return Ok(record.status);
        }
        let Some((index, current)) = record.saga.current_step() else {
            debug!("no pending step; step result ignored");
            return Ok(record.status);
        };
        if let Some(step_id) = body.step_id.as_deref() {
            if step_id != current.step_id {
                let applied = record
                    .saga
                    .position(step_id)
                    .and_then(|i| record.saga.step(i))
                    .is_some_and(|s| !s.is_pending());
                if applied {
                    debug!(step_id, "step result already applied");
                    return Ok(record.status);
                }
                return Err(OrchestratorError::UnexpectedStep {
                    transaction_id,
                    step_id: step_id.to_string(),
                });
            }
        }

        let now = self.clock.now();
        let step_id = current.step_id.clone();
        record.saga.with_step_status(index, outcome.into(), now)?;
        if !body.details.is_null() {
            record.saga.set_step_result(index, body.details.clone())?;
        }
        debug!(step_id = %step_id, "step result applied");

        let mut staged = MessageBuffer::new();
        match outcome {
            StepOutcome::Success => {
                chain_quest(&mut record.saga, index, now)?;
                self.advance(ctx, &mut record, &mut staged).await?;
            }
            StepOutcome::Failure => {
                let reason = failure_reason(&body.details);
                self.compensate(ctx, &mut record, &step_id, reason, &mut staged)
                    .await?;
            }
        }
        record.updated_at = now;
        self.store.put(ctx, &mut record).await?;
        absorb(buffer, staged);
        Ok(record.status)
    }

    /// Move to the next executable step: expand high-level steps, then stage
    /// the command of the earliest pending step, or finish the saga.
    async fn advance(
        &self,
        ctx: &OperationContext,
        record: &mut SagaRecord,
        buffer: &mut MessageBuffer,
    ) -> Result<(), OrchestratorError> {
        loop {
            let Some((index, step)) = record.saga.current_step() else {
                return self.complete(ctx, record, buffer).await;
            };
            if !step.action.is_high_level() {
                return self.emit_step(ctx, record.transaction_id(), step, buffer);
            }

            let action = step.action.clone();
            let step_id = step.step_id.clone();
            let location = AssetLocation::of(&action)
                .ok_or_else(|| OrchestratorError::Unroutable(step_id.clone()))?;
            let asset = self.assets.snapshot(ctx, location).await?;
            self.reserve(record, &action, &asset).await?;
            if !expand(&mut record.saga, &asset, self.clock.now())? {
                return Err(SagaError::Inconsistent(format!("step {step_id} did not expand")).into());
            }
            debug!(step_id = %step_id, index, "high-level step expanded");
        }
    }

    fn emit_step(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        step: &Step,
        buffer: &mut MessageBuffer,
    ) -> Result<(), OrchestratorError> {
        emit_action(ctx, &self.topics, transaction_id, &step.action, buffer)
            .map_err(|err| match err {
                OrchestratorError::Unroutable(_) => OrchestratorError::Unroutable(step.step_id.clone()),
                other => other,
            })?;
        debug!(step_id = %step.step_id, action = step.action.tag(), "step command staged");
        Ok(())
    }

    async fn reserve(
        &self,
        record: &mut SagaRecord,
        action: &Action,
        asset: &AssetSnapshot,
    ) -> Result<(), OrchestratorError> {
        let Some(reservations) = &self.reservations else {
            return Ok(());
        };
        let Action::TransferToStorage(p) = action else {
            return Ok(());
        };
        let slot = SlotKey::new(p.character_id.value(), p.source_inventory_type, p.source_slot);
        let transaction_id = record.transaction_id();
        let held = reservations
            .list(&record.tenant, slot)
            .await?
            .iter()
            .any(|r| r.transaction_id == transaction_id);
        if !held {
            let quantity = if p.quantity == 0 {
                asset.quantity
            } else {
                p.quantity.min(asset.quantity)
            };
            reservations
                .add(
                    &record.tenant,
                    transaction_id,
                    slot,
                    asset.template_id,
                    quantity,
                    self.config.reservation_ttl,
                )
                .await?;
        }
        if !record.reservations.contains(&slot) {
            record.reservations.push(slot);
        }
        Ok(())
    }

    async fn release_reservations(&self, record: &mut SagaRecord) -> Result<(), OrchestratorError> {
        let slots = std::mem::take(&mut record.reservations);
        let Some(reservations) = &self.reservations else {
            return Ok(());
        };
        for slot in slots {
            match reservations
                .remove(&record.tenant, record.transaction_id(), slot)
                .await
            {
                Ok(_) => {}
                Err(ReservationError::NotFound { .. }) => {
                    debug!(owner = slot.owner, slot = slot.slot, "reservation already expired");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        ctx: &OperationContext,
        record: &mut SagaRecord,
        buffer: &mut MessageBuffer,
    ) -> Result<(), OrchestratorError> {
        self.release_reservations(record).await?;
        let event = SagaStatusEvent::Completed {
            saga_type: record.saga.saga_type,
            initiated_by: record.saga.initiated_by.clone(),
        };
        self.emit_status(ctx, record, event, buffer)?;
        record.status = SagaStatus::Completed;
        info!(tenant_id = %record.tenant.id(), transaction_id = %record.transaction_id(), "saga completed");
        Ok(())
    }

    /// Undo the completed prefix, newest first, then report the failure.
    async fn compensate(
        &self,
        ctx: &OperationContext,
        record: &mut SagaRecord,
        failed_step: &str,
        reason: String,
        buffer: &mut MessageBuffer,
    ) -> Result<(), OrchestratorError> {
        record.status = SagaStatus::Compensating;
        let transaction_id = record.transaction_id();
        for step in record.saga.completed_prefix().iter().rev() {
            match compensation_for(step) {
                Some(inverse) => {
                    emit_action(ctx, &self.topics, transaction_id, &inverse, buffer)?;
                    debug!(step_id = %step.step_id, action = inverse.tag(), "compensation staged");
                }
                None => {
                    warn!(step_id = %step.step_id, action = step.action.tag(), "step has no compensation; skipped");
                }
            }
        }
        self.release_reservations(record).await?;

        let event = SagaStatusEvent::Failed {
            saga_type: record.saga.saga_type,
            initiated_by: record.saga.initiated_by.clone(),
            reason: reason.clone(),
            failed_step: failed_step.to_string(),
        };
        self.emit_status(ctx, record, event, buffer)?;
        record.status = SagaStatus::Failed;
        warn!(
            tenant_id = %record.tenant.id(),
            transaction_id = %transaction_id,
            failed_step,
            reason = %reason,
            "saga failed"
        );
        Ok(())
    }

    fn emit_status(
        &self,
        ctx: &OperationContext,
        record: &SagaRecord,
        event: SagaStatusEvent,
        buffer: &mut MessageBuffer,
    ) -> Result<(), OrchestratorError> {
        let topic = self.topics.get(EVENT_TOPIC_SAGA_STATUS)?;
        let world_id = record
            .saga
            .steps()
            .first()
            .map(|s| s.action.world_id())
            .unwrap_or(WorldId(0));
        let transaction_id = record.transaction_id();
        buffer.put_envelope(
            ctx,
            topic,
            transaction_id,
            Envelope::new(transaction_id, world_id, None, event),
        )?;
        Ok(())
    }
}

/// Stage the command executing `action`, keyed by the transaction id.
fn emit_action(
    ctx: &OperationContext,
    topics: &Topics,
    transaction_id: TransactionId,
    action: &Action,
    buffer: &mut MessageBuffer,
) -> Result<(), OrchestratorError> {
    let route = action
        .route()
        .ok_or_else(|| OrchestratorError::Unroutable(action.tag().to_string()))?;
    let (_, payload) = action.to_parts()?;
    let envelope = RawEnvelope {
        transaction_id,
        world_id: action.world_id(),
        channel_id: action.channel_id(),
        kind: route.command.to_string(),
        body: payload,
    };
    buffer.put_raw(ctx, topics.get(route.topic)?, transaction_id, &envelope)?;
    Ok(())
}

/// A completed quest that names a follow-up starts it next, in the same saga.
fn chain_quest(saga: &mut Saga, index: usize, now: DateTime<Utc>) -> Result<(), SagaError> {
    let Some(step) = saga.step(index) else {
        return Err(SagaError::StepOutOfRange(index));
    };
    let Action::CompleteQuest(p) = &step.action else {
        return Ok(());
    };
    let Some(next_quest_id) = step.result_u32(RESULT_NEXT_QUEST_ID).filter(|id| *id != 0) else {
        return Ok(());
    };
    let chained = Step::pending(
        format!("{}.start_{next_quest_id}", step.step_id),
        Action::StartQuest(StartQuest {
            character_id: p.character_id,
            world_id: p.world_id,
            quest_id: next_quest_id,
            npc_id: p.npc_id,
        }),
        now,
    );
    debug!(quest_id = p.quest_id, next_quest_id, "quest chain continues");
    saga.insert_after(index, chained)
}

fn failure_reason(details: &JsonValue) -> String {
    ["reason", "error"]
        .iter()
        .find_map(|field| details.get(field).and_then(JsonValue::as_str))
        .unwrap_or("step failed")
        .to_string()
}

fn absorb(buffer: &mut MessageBuffer, staged: MessageBuffer) {
    for message in staged.into_messages() {
        buffer.put(message);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::cache::InMemoryBackend;
    use crate::registry::test_support::tenant;
    use crate::saga::assets::InMemoryAssetSource;
    use crate::saga::store::InMemorySagaStore;
    use atlas_core::{AccountId, AssetId, CharacterId, ItemId, ManualClock, Tenant};
    use atlas_events::{Message, PartitionKey};
    use atlas_events::topic::*;
    use atlas_saga::payload::{AwardMesos, CompleteQuest, TransferToStorage};
    use atlas_saga::{SagaType, StepStatus};

    const TOPICS: &[&str] = &[
        COMMAND_TOPIC_CHARACTER,
        COMMAND_TOPIC_COMPARTMENT,
        COMMAND_TOPIC_STORAGE,
        COMMAND_TOPIC_CASH_SHOP,
        COMMAND_TOPIC_QUEST,
        EVENT_TOPIC_SAGA_STATUS,
    ];

    struct Harness {
        orchestrator: SagaOrchestrator<InMemoryBackend>,
        store: Arc<InMemorySagaStore>,
        reservations: Arc<ReservationRegistry<InMemoryBackend>>,
        tenant: Tenant,
        ctx: OperationContext,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
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
        let reservations =
            Arc::new(ReservationRegistry::new(InMemoryBackend::new()).with_clock(clock.clone()));
        let orchestrator = SagaOrchestrator::new(store.clone(), Arc::new(assets), Topics::identity(TOPICS))
            .with_reservations(reservations.clone())
            .with_clock(clock);
        let tenant = tenant("GMS");
        Harness {
            orchestrator,
            store,
            reservations,
            ctx: OperationContext::background().with_tenant(tenant.clone()),
            tenant,
        }
    }

    fn storage_saga(quantity: u32) -> Saga {
        let tx = TransactionId::new();
        Saga::new(tx, SagaType::StorageOperation, "character:1")
            .with_step(Step::pending(
                "deposit",
                Action::TransferToStorage(TransferToStorage {
                    transaction_id: tx,
                    character_id: CharacterId(1),
                    world_id: WorldId(0),
                    account_id: AccountId(5),
                    source_slot: 1,
                    source_inventory_type: 2,
                    quantity,
                }),
                Utc::now(),
            ))
            .unwrap()
    }

    fn only(buffer: MessageBuffer) -> (Message, RawEnvelope) {
        let messages = buffer.into_messages();
        assert_eq!(messages.len(), 1, "{messages:?}");
        let message = messages.into_iter().next().unwrap();
        let envelope = message.envelope().unwrap();
        (message, envelope)
    }

    fn completed(step_id: Option<&str>, details: JsonValue) -> StepStatusBody {
        StepStatusBody {
            step_id: step_id.map(str::to_string),
            details,
        }
    }

    fn slot() -> SlotKey {
        SlotKey::new(1, 2, 1)
    }

    #[tokio::test]
    async fn storage_transfer_expands_and_runs_in_order() {
        let h = harness();
        let saga = storage_saga(1);
        let tx = saga.transaction_id;

        let mut buffer = MessageBuffer::new();
        h.orchestrator.create(&h.ctx, saga, &mut buffer).await.unwrap();
        let (message, envelope) = only(buffer);
        assert_eq!(message.topic, COMMAND_TOPIC_STORAGE);
        assert_eq!(message.key, PartitionKey::from(tx));
        assert_eq!(envelope.kind, "ACCEPT");
        assert_eq!(envelope.transaction_id, tx);
        assert_eq!(envelope.body["quantity"], 1);

        let record = h.store.get(&h.ctx, tx).await.unwrap().unwrap();
        let ids: Vec<_> = record.saga.steps().iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["deposit.accept", "deposit.release"]);
        assert_eq!(record.reservations, vec![slot()]);
        assert_eq!(h.reservations.reserved_quantity(&h.tenant, slot()).await.unwrap(), 1);

        let mut buffer = MessageBuffer::new();
        let status = h
            .orchestrator
            .step_completed(&h.ctx, tx, StepOutcome::Success, completed(None, json!({"assetId": 901})), &mut buffer)
            .await
            .unwrap();
        assert_eq!(status, SagaStatus::Active);
        let (message, envelope) = only(buffer);
        assert_eq!(message.topic, COMMAND_TOPIC_COMPARTMENT);
        assert_eq!(envelope.kind, "RELEASE");
        assert_eq!(envelope.body["assetId"], 700);

        let mut buffer = MessageBuffer::new();
        let status = h
            .orchestrator
            .step_completed(&h.ctx, tx, StepOutcome::Success, completed(None, JsonValue::Null), &mut buffer)
            .await
            .unwrap();
        assert_eq!(status, SagaStatus::Completed);
        let (message, envelope) = only(buffer);
        assert_eq!(message.topic, EVENT_TOPIC_SAGA_STATUS);
        assert_eq!(envelope.kind, "COMPLETED");
        assert_eq!(h.reservations.reserved_quantity(&h.tenant, slot()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_release_compensates_the_accept() {
        let h = harness();
        let saga = storage_saga(0);
        let tx = saga.transaction_id;
        h.orchestrator
            .create(&h.ctx, saga, &mut MessageBuffer::new())
            .await
            .unwrap();
        assert_eq!(h.reservations.reserved_quantity(&h.tenant, slot()).await.unwrap(), 20);
        h.orchestrator
            .step_completed(
                &h.ctx,
                tx,
                StepOutcome::Success,
                completed(Some("deposit.accept"), json!({"assetId": 901})),
                &mut MessageBuffer::new(),
            )
            .await
            .unwrap();

        let mut buffer = MessageBuffer::new();
        let status = h
            .orchestrator
            .step_completed(
                &h.ctx,
                tx,
                StepOutcome::Failure,
                completed(Some("deposit.release"), json!({"reason": "slot locked"})),
                &mut buffer,
            )
            .await
            .unwrap();
        assert_eq!(status, SagaStatus::Failed);

        let undo = buffer.get(COMMAND_TOPIC_STORAGE);
        assert_eq!(undo.len(), 1);
        let undo = undo[0].envelope().unwrap();
        assert_eq!(undo.kind, "RELEASE");
        assert_eq!(undo.body["assetId"], 901);

        let status_events = buffer.get(EVENT_TOPIC_SAGA_STATUS);
        assert_eq!(status_events.len(), 1);
        let failed = status_events[0].envelope().unwrap();
        assert_eq!(failed.kind, "FAILED");
        assert_eq!(failed.body["failedStep"], "deposit.release");
        assert_eq!(failed.body["reason"], "slot locked");

        let record = h.store.get(&h.ctx, tx).await.unwrap().unwrap();
        assert_eq!(record.status, SagaStatus::Failed);
        assert!(record.reservations.is_empty());
        assert_eq!(h.reservations.reserved_quantity(&h.tenant, slot()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn compensation_runs_newest_first_and_skips_irreversible_steps() {
        let h = harness();
        let tx = TransactionId::new();
        let mesos = |amount| {
            Action::AwardMesos(AwardMesos {
                character_id: CharacterId(1),
                world_id: WorldId(0),
                channel_id: atlas_core::ChannelId(1),
                actor_id: 0,
                actor_type: "SYSTEM".into(),
                amount,
            })
        };
        let saga = Saga::new(tx, SagaType::QuestReward, "npc:9000")
            .with_step(Step::pending("first", mesos(100), Utc::now()))
            .unwrap()
            .with_step(Step::pending("second", mesos(250), Utc::now()))
            .unwrap()
            .with_step(Step::pending("third", mesos(5), Utc::now()))
            .unwrap();
        h.orchestrator
            .create(&h.ctx, saga, &mut MessageBuffer::new())
            .await
            .unwrap();
        for _ in 0..2 {
            h.orchestrator
                .step_completed(&h.ctx, tx, StepOutcome::Success, StepStatusBody::default(), &mut MessageBuffer::new())
                .await
                .unwrap();
        }
        let mut buffer = MessageBuffer::new();
        h.orchestrator
            .step_completed(&h.ctx, tx, StepOutcome::Failure, StepStatusBody::default(), &mut buffer)
            .await
            .unwrap();

        let amounts: Vec<_> = buffer
            .get(COMMAND_TOPIC_CHARACTER)
            .iter()
            .map(|m| m.envelope().unwrap().body["amount"].as_i64().unwrap())
            .collect();
        assert_eq!(amounts, vec![-250, -100]);
    }

    #[tokio::test]
    async fn completed_quest_with_follow_up_chains_a_start() {
        let h = harness();
        let tx = TransactionId::new();
        let saga = Saga::new(tx, SagaType::QuestComplete, "character:1")
            .with_step(Step::pending(
                "complete",
                Action::CompleteQuest(CompleteQuest {
                    character_id: CharacterId(1),
                    world_id: WorldId(0),
                    quest_id: 2000,
                    npc_id: 9010000,
                    force: false,
                }),
                Utc::now(),
            ))
            .unwrap();
        h.orchestrator
            .create(&h.ctx, saga, &mut MessageBuffer::new())
            .await
            .unwrap();

        let mut buffer = MessageBuffer::new();
        let status = h
            .orchestrator
            .step_completed(&h.ctx, tx, StepOutcome::Success, completed(None, json!({"nextQuestId": 2001})), &mut buffer)
            .await
            .unwrap();
        assert_eq!(status, SagaStatus::Active);
        let (message, envelope) = only(buffer);
        assert_eq!(message.topic, COMMAND_TOPIC_QUEST);
        assert_eq!(envelope.kind, "START");
        assert_eq!(envelope.body["questId"], 2001);
        assert_eq!(envelope.transaction_id, tx);

        let record = h.store.get(&h.ctx, tx).await.unwrap().unwrap();
        assert_eq!(record.saga.steps().len(), 2);
        assert_eq!(record.saga.steps()[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn redelivered_messages_are_absorbed() {
        let h = harness();
        let saga = storage_saga(1);
        let tx = saga.transaction_id;
        h.orchestrator
            .create(&h.ctx, saga.clone(), &mut MessageBuffer::new())
            .await
            .unwrap();

        let mut again = MessageBuffer::new();
        h.orchestrator.create(&h.ctx, saga, &mut again).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(h.reservations.list(&h.tenant, slot()).await.unwrap().len(), 1);

        let accept = || completed(Some("deposit.accept"), json!({"assetId": 1}));
        h.orchestrator
            .step_completed(&h.ctx, tx, StepOutcome::Success, accept(), &mut MessageBuffer::new())
            .await
            .unwrap();
        let mut replay = MessageBuffer::new();
        let status = h
            .orchestrator
            .step_completed(&h.ctx, tx, StepOutcome::Success, accept(), &mut replay)
            .await
            .unwrap();
        assert_eq!(status, SagaStatus::Active);
        assert!(replay.is_empty());
    }

    #[tokio::test]
    async fn unknown_saga_and_foreign_tenant_read_as_not_found() {
        let h = harness();
        let saga = storage_saga(1);
        let tx = saga.transaction_id;
        h.orchestrator
            .create(&h.ctx, saga, &mut MessageBuffer::new())
            .await
            .unwrap();

        let other = OperationContext::background().with_tenant(tenant("EMS"));
        let err = h
            .orchestrator
            .step_completed(&other, tx, StepOutcome::Success, StepStatusBody::default(), &mut MessageBuffer::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn missing_asset_fails_create_without_side_effects() {
        let h = harness();
        let tx = TransactionId::new();
        let saga = Saga::new(tx, SagaType::StorageOperation, "character:2")
            .with_step(Step::pending(
                "deposit",
                Action::TransferToStorage(TransferToStorage {
                    transaction_id: tx,
                    character_id: CharacterId(2),
                    world_id: WorldId(0),
                    account_id: AccountId(5),
                    source_slot: 9,
                    source_inventory_type: 2,
                    quantity: 1,
                }),
                Utc::now(),
            ))
            .unwrap();
        let mut buffer = MessageBuffer::new();
        let err = h.orchestrator.create(&h.ctx, saga, &mut buffer).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(buffer.is_empty());
        assert!(h.store.get(&h.ctx, tx).await.unwrap().is_none());
    }
}
