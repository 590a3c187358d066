//! The `saga-orchestrator` process.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use atlas_core::CoreResult;
use atlas_events::topic::*;
use atlas_events::{MessageBus, Topics};
use atlas_infra::cache::{CacheBackend, RedisBackend};
use atlas_infra::config::RuntimeConfig;
use atlas_infra::consumer::{ConsumerConfig, ConsumerManager};
use atlas_infra::db::{DbConfig, connect_with_retry, migrate};
use atlas_infra::event_bus::{RedisStreamsBus, StreamsConfig};
use atlas_infra::lock::DistributedMutex;
use atlas_infra::reservation::ReservationRegistry;
use atlas_infra::saga::{
    AssetEndpoints, HttpAssetSource, OrchestratorConfig, PostgresSagaStore, SagaCommandHandler,
    SagaOrchestrator, SagaStore, StepStatusHandler, StuckSagaSweep,
};
use atlas_infra::worker::spawn_periodic;

use crate::shutdown;

pub const CONSUMER_GROUP: &str = "saga-orchestrator";

/// Every topic the orchestrator reads from or routes commands to.
pub const TOPICS: &[&str] = &[
    COMMAND_TOPIC_SAGA,
    EVENT_TOPIC_SAGA_STATUS,
    EVENT_TOPIC_SAGA_STEP_STATUS,
    COMMAND_TOPIC_CHARACTER,
    COMMAND_TOPIC_COMPARTMENT,
    COMMAND_TOPIC_STORAGE,
    COMMAND_TOPIC_CASH_SHOP,
    COMMAND_TOPIC_QUEST,
    COMMAND_TOPIC_BUFF,
    COMMAND_TOPIC_MAP,
    COMMAND_TOPIC_CONSUMABLE,
    COMMAND_TOPIC_REACTOR,
];

/// Subscribe the orchestrator to saga commands and step status events.
pub fn register<B: CacheBackend>(
    manager: &ConsumerManager,
    orchestrator: Arc<SagaOrchestrator<B>>,
    topics: &Topics,
) -> CoreResult<()> {
    let commands = topics.get(COMMAND_TOPIC_SAGA)?;
    let step_status = topics.get(EVENT_TOPIC_SAGA_STEP_STATUS)?;

    manager.add_consumer(ConsumerConfig::new("saga_command", commands, CONSUMER_GROUP));
    manager.add_consumer(ConsumerConfig::new("saga_step_status", step_status, CONSUMER_GROUP));
    manager.register_handler(commands, Arc::new(SagaCommandHandler::typed(orchestrator.clone())));
    manager.register_handler(step_status, Arc::new(StepStatusHandler::typed(orchestrator)));
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    let runtime = RuntimeConfig::from_env().context("runtime configuration")?;
    let db = DbConfig::from_env().context("database configuration")?;
    let endpoints = AssetEndpoints::from_env().context("asset service configuration")?;
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

    let store: Arc<dyn SagaStore> = Arc::new(PostgresSagaStore::new(pool));
    let reservations =
        Arc::new(ReservationRegistry::new(cache.clone()).with_mutex(DistributedMutex::new(cache)));
    let orchestrator = Arc::new(
        SagaOrchestrator::new(store.clone(), Arc::new(HttpAssetSource::new(endpoints)), topics.clone())
            .with_reservations(reservations)
            .with_config(OrchestratorConfig::default().with_saga_timeout(runtime.saga_timeout)),
    );

    let manager = ConsumerManager::new(bus);
    register(&manager, orchestrator, &topics)?;

    let (stop, stopped) = watch::channel(false);
    let mut workers = manager.start(stopped.clone()).await.context("consumers")?;
    workers.push(spawn_periodic(Arc::new(StuckSagaSweep::new(store)), stopped));
    info!(
        partitions = runtime.partitions,
        saga_timeout_ms = runtime.saga_timeout.as_millis() as u64,
        "saga orchestrator running"
    );

    shutdown::signal().await;
    let _ = stop.send(true);
    shutdown::join_all(workers).await;
    info!("saga orchestrator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use atlas_core::{CharacterId, Classified, ErrorKind, Tenant, TenantId, TransactionId, WorldId};
    use atlas_events::{Envelope, InMemoryBus, Message};
    use atlas_infra::cache::InMemoryBackend;
    use atlas_infra::saga::InMemoryAssetSource;
    use atlas_infra::saga::InMemorySagaStore;
    use atlas_saga::payload::StartQuest;
    use atlas_saga::{Action, Saga, SagaCommand, SagaType, Step};

    /// Deployment-specific topic names behind the variables.
    fn topics() -> Topics {
        let names: HashMap<&str, String> = TOPICS
            .iter()
            .map(|v| (*v, format!("atlas.{}", v.to_lowercase())))
            .collect();
        Topics::resolve(TOPICS, |v| names.get(v).cloned()).unwrap()
    }

    #[test]
    fn missing_topic_variable_is_fatal() {
        let err = Topics::resolve(TOPICS, |_| None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn wired_orchestrator_consumes_resolved_topics() {
        let topics = topics();
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemorySagaStore::new());
        let orchestrator: Arc<SagaOrchestrator<InMemoryBackend>> = Arc::new(SagaOrchestrator::new(
            store,
            Arc::new(InMemoryAssetSource::new()),
            topics.clone(),
        ));
        let manager = ConsumerManager::new(Arc::new(bus.clone()));
        register(&manager, orchestrator, &topics).unwrap();
        let workers = manager.spawn().await.unwrap();

        let tenant = Tenant::new(TenantId::new(), "GMS", 83, 1).unwrap();
        let tx = TransactionId::new();
        let saga = Saga::new(tx, SagaType::QuestStart, "npc:2000")
            .with_step(Step::pending(
                "start",
                Action::StartQuest(StartQuest {
                    character_id: CharacterId(9),
                    world_id: WorldId(0),
                    quest_id: 2001,
                    npc_id: 2000,
                }),
                Utc::now(),
            ))
            .unwrap();
        let create = Message::from_envelope(
            "atlas.command_topic_saga",
            tx,
            Envelope::new(tx, WorldId(0), None, SagaCommand::Create(saga)),
        )
        .unwrap()
        .with_tenant(&tenant);
        bus.produce(vec![create]).await.unwrap();

        let mut started = Vec::new();
        for _ in 0..200 {
            started = bus.produced_to("atlas.command_topic_quest");
            if !started.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(started.len(), 1);
        let envelope = started[0].envelope().unwrap();
        assert_eq!(envelope.kind, "START");
        assert_eq!(envelope.body["questId"], json!(2001));
        workers.shutdown().await;
    }
}
