//! Infrastructure layer: Redis-shaped registries, Postgres, the Redis streams
//! bus, the consumer runtime and the saga orchestrator.

pub mod cache;
pub mod coalesced;
pub mod config;
pub mod consumer;
pub mod db;
pub mod event_bus;
pub mod lock;
pub mod registry;
pub mod reservation;
pub mod saga;
pub mod session;
pub mod worker;

#[cfg(test)]
mod scenario_tests;

pub use consumer::{ConsumerConfig, ConsumerManager, HandlerId, RetryPolicy};
pub use worker::{PeriodicTask, WorkerHandle, spawn_periodic, spawn_periodic_worker};
