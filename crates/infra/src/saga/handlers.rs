//! Bus handlers feeding the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use atlas_core::OperationContext;
use atlas_events::{Envelope, HandlerError, HandlerOutcome, MessageBuffer, Typed, TypedHandler};
use atlas_saga::{SagaCommand, StepStatusEvent};

use crate::cache::CacheBackend;
use crate::saga::orchestrator::SagaOrchestrator;

/// `CREATE` on the saga command topic.
pub struct SagaCommandHandler<B> {
    orchestrator: Arc<SagaOrchestrator<B>>,
}

impl<B: CacheBackend> SagaCommandHandler<B> {
    pub fn typed(orchestrator: Arc<SagaOrchestrator<B>>) -> Typed<SagaCommand, Self> {
        Typed::new("saga-command", Self { orchestrator })
    }
}

#[async_trait]
impl<B: CacheBackend> TypedHandler<SagaCommand> for SagaCommandHandler<B> {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: Envelope<SagaCommand>,
        buffer: &mut MessageBuffer,
    ) -> Result<HandlerOutcome, HandlerError> {
        match envelope.body {
            SagaCommand::Create(mut saga) => {
                // The envelope id is authoritative.
                if saga.transaction_id != envelope.transaction_id {
                    warn!(
                        envelope_transaction_id = %envelope.transaction_id,
                        body_transaction_id = %saga.transaction_id,
                        "saga body carries a different transaction id"
                    );
                    saga.transaction_id = envelope.transaction_id;
                }
                self.orchestrator.create(ctx, saga, buffer).await?;
            }
        }
        Ok(HandlerOutcome::Continue)
    }
}

/// `COMPLETED` / `FAILED` on the step status event topic.
pub struct StepStatusHandler<B> {
    orchestrator: Arc<SagaOrchestrator<B>>,
}

impl<B: CacheBackend> StepStatusHandler<B> {
    pub fn typed(orchestrator: Arc<SagaOrchestrator<B>>) -> Typed<StepStatusEvent, Self> {
        Typed::new("saga-step-status", Self { orchestrator })
    }
}

#[async_trait]
impl<B: CacheBackend> TypedHandler<StepStatusEvent> for StepStatusHandler<B> {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: Envelope<StepStatusEvent>,
        buffer: &mut MessageBuffer,
    ) -> Result<HandlerOutcome, HandlerError> {
        let outcome = envelope.body.outcome();
        self.orchestrator
            .step_completed(ctx, envelope.transaction_id, outcome, envelope.body.into_body(), buffer)
            .await?;
        Ok(HandlerOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::cache::InMemoryBackend;
    use crate::registry::test_support::tenant;
    use crate::saga::assets::InMemoryAssetSource;
    use crate::saga::store::{InMemorySagaStore, SagaStatus, SagaStore};
    use atlas_core::{CharacterId, ErrorKind, TransactionId, WorldId};
    use atlas_events::topic::{COMMAND_TOPIC_QUEST, EVENT_TOPIC_SAGA_STATUS};
    use atlas_events::{Handler, RawEnvelope, Topics};
    use atlas_saga::payload::StartQuest;
    use atlas_saga::{Action, Saga, SagaType, Step};

    fn raw(tx: TransactionId, kind: &str, body: serde_json::Value) -> RawEnvelope {
        serde_json::from_value(json!({
            "transactionId": tx.to_string(),
            "worldId": 0,
            "type": kind,
            "body": body,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_complete_over_the_wire() {
        let store = Arc::new(InMemorySagaStore::new());
        let orchestrator: Arc<SagaOrchestrator<InMemoryBackend>> = Arc::new(SagaOrchestrator::new(
            store.clone(),
            Arc::new(InMemoryAssetSource::new()),
            Topics::identity(&[COMMAND_TOPIC_QUEST, EVENT_TOPIC_SAGA_STATUS]),
        ));
        let commands = SagaCommandHandler::typed(orchestrator.clone());
        let statuses = StepStatusHandler::typed(orchestrator);
        let ctx = OperationContext::background().with_tenant(tenant("GMS"));

        let tx = TransactionId::new();
        let saga = Saga::new(tx, SagaType::QuestStart, "npc:1012000")
            .with_step(Step::pending(
                "start",
                Action::StartQuest(StartQuest {
                    character_id: CharacterId(4),
                    world_id: WorldId(0),
                    quest_id: 1000,
                    npc_id: 1012000,
                }),
                Utc::now(),
            ))
            .unwrap();
        let create = raw(tx, "CREATE", serde_json::to_value(&saga).unwrap());

        // Not for this handler: ignored without touching the store.
        let mut buffer = MessageBuffer::new();
        statuses.handle(&ctx, &create, &mut buffer).await.unwrap();
        assert!(buffer.is_empty());

        commands.handle(&ctx, &create, &mut buffer).await.unwrap();
        assert_eq!(buffer.get(COMMAND_TOPIC_QUEST).len(), 1);

        let mut buffer = MessageBuffer::new();
        statuses
            .handle(&ctx, &raw(tx, "COMPLETED", json!({ "details": {} })), &mut buffer)
            .await
            .unwrap();
        assert_eq!(buffer.get(EVENT_TOPIC_SAGA_STATUS).len(), 1);
        let record = store.get(&ctx, tx).await.unwrap().unwrap();
        assert_eq!(record.status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_transaction_is_not_retryable() {
        let orchestrator: Arc<SagaOrchestrator<InMemoryBackend>> = Arc::new(SagaOrchestrator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(InMemoryAssetSource::new()),
            Topics::identity(&[EVENT_TOPIC_SAGA_STATUS]),
        ));
        let statuses = StepStatusHandler::typed(orchestrator);
        let ctx = OperationContext::background().with_tenant(tenant("GMS"));
        let err = statuses
            .handle(&ctx, &raw(TransactionId::new(), "FAILED", json!({})), &mut MessageBuffer::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }
}
