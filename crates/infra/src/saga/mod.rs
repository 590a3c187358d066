//! Saga infrastructure: persistence, asset lookup, the execution engine and
//! the bus handlers that drive it.

pub mod assets;
pub mod handlers;
pub mod orchestrator;
pub mod postgres;
pub mod store;
pub mod sweep;

pub use assets::{AssetEndpoints, AssetError, AssetLocation, AssetSource, HttpAssetSource, InMemoryAssetSource};
pub use handlers::{SagaCommandHandler, StepStatusHandler};
pub use orchestrator::{OrchestratorConfig, OrchestratorError, SagaOrchestrator};
pub use postgres::PostgresSagaStore;
pub use store::{InMemorySagaStore, SagaRecord, SagaStatus, SagaStore, SagaStoreError};
pub use sweep::StuckSagaSweep;
