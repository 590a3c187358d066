//! Partitioned message bus abstraction (mechanics only).
//!
//! The bus is an append-only, partitioned log with consumer groups:
//!
//! - **Partitioned**: a message's [`PartitionKey`](crate::PartitionKey) selects one
//!   partition; messages on one partition are delivered in production order.
//! - **At-least-once**: a delivery that is not committed is delivered again, so
//!   handlers must be idempotent.
//! - **Consumer groups**: each group keeps its own committed position per partition.
//! - **Dead letters**: an implementation may divert a delivery that keeps failing
//!   after a bounded number of attempts.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let mut sub = bus.subscribe("COMMAND_TOPIC_SAGA", "saga-orchestrator", 0, StartOffset::Earliest).await?;
//! while let Some(delivery) = sub.next().await? {
//!     match process(&delivery.message).await {
//!         Ok(()) => sub.commit(&delivery).await?,
//!         Err(_) => sub.reject(&delivery).await?,
//!     }
//! }
//! ```
//!
//! `next()` returns `Ok(None)` when nothing arrived within the implementation's
//! poll window, giving the caller a chance to observe shutdown.

use std::sync::Arc;

use async_trait::async_trait;

use atlas_core::{Classified, ErrorKind};

use crate::message::Message;

/// Where a new consumer group starts reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

/// One attempt at processing a message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub partition: u32,
    /// Position of the message in its partition (offset or stream entry id).
    pub id: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("subscription closed")]
    Closed,
}

impl From<serde_json::Error> for BusError {
    fn from(value: serde_json::Error) -> Self {
        BusError::Serialization(value.to_string())
    }
}

impl Classified for BusError {
    fn kind(&self) -> ErrorKind {
        match self {
            BusError::Unavailable(_) | BusError::Closed => ErrorKind::Transient,
            BusError::Serialization(_) => ErrorKind::BadInput,
            BusError::UnknownTopic(_) => ErrorKind::Fatal,
        }
    }
}

/// Reader bound to one `(topic, group, partition)`.
///
/// Subscriptions are driven by a single task; that is what gives per-key ordering.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` if the poll window elapsed without one.
    async fn next(&mut self) -> Result<Option<Delivery>, BusError>;

    /// Mark the delivery as processed for this group.
    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Leave the delivery for redelivery (or dead-letter it once attempts run out).
    async fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

/// Domain-agnostic partitioned bus.
///
/// `produce` takes a whole batch: transactional implementations make the batch
/// visible all-or-nothing, others produce it in order and report the first failure.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn produce(&self, batch: Vec<Message>) -> Result<(), BusError>;

    async fn partitions(&self, topic: &str) -> Result<u32, BusError>;

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn produce(&self, batch: Vec<Message>) -> Result<(), BusError> {
        (**self).produce(batch).await
    }

    async fn partitions(&self, topic: &str) -> Result<u32, BusError> {
        (**self).partitions(topic).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>, BusError> {
        (**self).subscribe(topic, group, partition, start).await
    }
}
