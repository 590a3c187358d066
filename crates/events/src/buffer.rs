//! Per-handler emit buffer.
//!
//! Handlers never talk to the bus directly. They enqueue outbound messages into a
//! [`MessageBuffer`]; the caller produces the whole buffer as one batch only after
//! the handler returned successfully. A failed handler's buffer is discarded.

use atlas_core::OperationContext;

use crate::bus::{BusError, MessageBus};
use crate::envelope::{Envelope, MessageBody, RawEnvelope};
use crate::message::{Message, PartitionKey};

#[derive(Debug, Default, Clone)]
pub struct MessageBuffer {
    topics: Vec<(String, Vec<Message>)>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message under its topic. Order within a topic is preserved.
    pub fn put(&mut self, message: Message) {
        match self.topics.iter_mut().find(|(t, _)| *t == message.topic) {
            Some((_, messages)) => messages.push(message),
            None => self.topics.push((message.topic.clone(), vec![message])),
        }
    }

    /// Encode a typed envelope, stamp tenant and trace headers from `ctx`, enqueue it.
    pub fn put_envelope<B: MessageBody>(
        &mut self,
        ctx: &OperationContext,
        topic: &str,
        key: impl Into<PartitionKey>,
        envelope: Envelope<B>,
    ) -> Result<(), BusError> {
        let message = Message::from_envelope(topic, key, envelope)?;
        self.put(stamp(ctx, message));
        Ok(())
    }

    /// [`put_envelope`](Self::put_envelope) for an envelope whose body is already JSON.
    pub fn put_raw(
        &mut self,
        ctx: &OperationContext,
        topic: &str,
        key: impl Into<PartitionKey>,
        envelope: &RawEnvelope,
    ) -> Result<(), BusError> {
        let message = Message::from_raw(topic, key, envelope)?;
        self.put(stamp(ctx, message));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.topics.iter().all(|(_, m)| m.is_empty())
    }

    pub fn len(&self) -> usize {
        self.topics.iter().map(|(_, m)| m.len()).sum()
    }

    pub fn get(&self, topic: &str) -> &[Message] {
        self.topics
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, m)| m.as_slice())
            .unwrap_or(&[])
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|(t, _)| t.as_str())
    }

    /// Flatten into one batch: topics in first-use order, messages in enqueue order.
    pub fn into_messages(self) -> Vec<Message> {
        self.topics.into_iter().flat_map(|(_, m)| m).collect()
    }

    /// Produce everything as one batch. An empty buffer is a no-op.
    pub async fn flush<B: MessageBus + ?Sized>(self, bus: &B) -> Result<(), BusError> {
        if self.is_empty() {
            return Ok(());
        }
        bus.produce(self.into_messages()).await
    }
}

fn stamp(ctx: &OperationContext, mut message: Message) -> Message {
    if let Some(tenant) = ctx.tenant() {
        message = message.with_tenant(tenant);
    }
    if let Some(trace) = ctx.trace() {
        message = message.with_trace(&trace.child());
    }
    message
}

/// Build a buffer with `f` and produce it only if `f` succeeds.
pub async fn emit<B, F, T, E>(bus: &B, f: F) -> Result<T, E>
where
    B: MessageBus + ?Sized,
    F: FnOnce(&mut MessageBuffer) -> Result<T, E>,
    E: From<BusError>,
{
    let mut buffer = MessageBuffer::new();
    let value = f(&mut buffer)?;
    buffer.flush(bus).await?;
    Ok(value)
}
