//! In-memory partitioned bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::{BusError, Delivery, MessageBus, StartOffset, Subscription};
use crate::message::Message;

const DEFAULT_PARTITIONS: u32 = 4;
const DEFAULT_POLL: Duration = Duration::from_millis(50);
const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug)]
struct State {
    logs: HashMap<String, Vec<Vec<Message>>>,
    committed: HashMap<(String, String, u32), u64>,
    produced: Vec<Message>,
    dead_letters: Vec<Delivery>,
    available: bool,
    max_deliveries: u32,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    partitions: u32,
}

/// In-memory partitioned log with consumer-group offsets.
///
/// - No IO
/// - Same partitioning rule as the Redis bus (`key % partitions`)
/// - Rejected deliveries are redelivered until `max_deliveries`, then dead-lettered
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    logs: HashMap::new(),
                    committed: HashMap::new(),
                    produced: Vec::new(),
                    dead_letters: Vec::new(),
                    available: true,
                    max_deliveries: DEFAULT_MAX_DELIVERIES,
                }),
                notify: Notify::new(),
                partitions: partitions.max(1),
            }),
        }
    }

    pub fn set_max_deliveries(&self, max: u32) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.max_deliveries = max.max(1);
        }
    }

    /// Simulate an outage: `produce` fails while unavailable.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.available = available;
        }
    }

    /// Every produced message, in production order.
    pub fn produced(&self) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .map(|s| s.produced.clone())
            .unwrap_or_default()
    }

    pub fn produced_to(&self, topic: &str) -> Vec<Message> {
        self.produced()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.inner
            .state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Unavailable("in-memory bus lock poisoned".into()))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn produce(&self, batch: Vec<Message>) -> Result<(), BusError> {
        {
            let mut state = self.inner.lock()?;
            if !state.available {
                return Err(BusError::Unavailable("in-memory bus marked unavailable".into()));
            }
            let partitions = self.inner.partitions as usize;
            for message in batch {
                let partition = message.key.partition(self.inner.partitions) as usize;
                state
                    .logs
                    .entry(message.topic.clone())
                    .or_insert_with(|| vec![Vec::new(); partitions])[partition]
                    .push(message.clone());
                state.produced.push(message);
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn partitions(&self, _topic: &str) -> Result<u32, BusError> {
        Ok(self.inner.partitions)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>, BusError> {
        if partition >= self.inner.partitions {
            return Err(BusError::UnknownTopic(format!("{topic} partition {partition}")));
        }
        let position = {
            let state = self.inner.lock()?;
            let committed = state
                .committed
                .get(&(topic.to_string(), group.to_string(), partition))
                .copied();
            match (committed, start) {
                (Some(offset), _) => offset,
                (None, StartOffset::Earliest) => 0,
                (None, StartOffset::Latest) => state
                    .logs
                    .get(topic)
                    .map(|p| p[partition as usize].len() as u64)
                    .unwrap_or(0),
            }
        };
        Ok(Box::new(InMemorySubscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            partition,
            position,
            attempts: HashMap::new(),
        }))
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    partition: u32,
    position: u64,
    attempts: HashMap<u64, u32>,
}

impl InMemorySubscription {
    fn try_take(&mut self) -> Result<Option<Delivery>, BusError> {
        let state = self.inner.lock()?;
        let Some(message) = state
            .logs
            .get(&self.topic)
            .and_then(|p| p[self.partition as usize].get(self.position as usize))
            .cloned()
        else {
            return Ok(None);
        };
        drop(state);

        let offset = self.position;
        self.position += 1;
        let attempt = self.attempts.entry(offset).or_insert(0);
        *attempt += 1;
        Ok(Some(Delivery {
            message,
            partition: self.partition,
            id: offset.to_string(),
            attempt: *attempt,
        }))
    }

    fn advance_committed(&mut self, offset: u64) -> Result<(), BusError> {
        let mut state = self.inner.lock()?;
        let slot = state
            .committed
            .entry((self.topic.clone(), self.group.clone(), self.partition))
            .or_insert(0);
        *slot = (*slot).max(offset + 1);
        self.attempts.remove(&offset);
        Ok(())
    }
}

fn offset_of(delivery: &Delivery) -> Result<u64, BusError> {
    delivery
        .id
        .parse()
        .map_err(|_| BusError::Serialization(format!("bad delivery id {}", delivery.id)))
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError> {
        let inner = self.inner.clone();
        let notified = inner.notify.notified();
        if let Some(delivery) = self.try_take()? {
            return Ok(Some(delivery));
        }
        let _ = tokio::time::timeout(DEFAULT_POLL, notified).await;
        self.try_take()
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.advance_committed(offset_of(delivery)?)
    }

    async fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let offset = offset_of(delivery)?;
        let max = self.inner.lock()?.max_deliveries;
        if delivery.attempt >= max {
            self.inner.lock()?.dead_letters.push(delivery.clone());
            return self.advance_committed(offset);
        }
        self.position = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PartitionKey;

    fn msg(topic: &str, key: u64, body: &str) -> Message {
        Message::new(topic, PartitionKey::new(key), body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn same_key_is_delivered_in_order() {
        let bus = InMemoryBus::with_partitions(2);
        bus.produce(vec![msg("t", 3, "a"), msg("t", 3, "b"), msg("t", 4, "x")])
            .await
            .unwrap();

        let mut sub = bus.subscribe("t", "g", 1, StartOffset::Earliest).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(first.message.payload, b"a");
        assert_eq!(second.message.payload, b"b");
        assert!(sub.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_the_next_subscription() {
        let bus = InMemoryBus::with_partitions(1);
        bus.produce(vec![msg("t", 1, "a"), msg("t", 1, "b")]).await.unwrap();

        let mut sub = bus.subscribe("t", "g", 0, StartOffset::Earliest).await.unwrap();
        let a = sub.next().await.unwrap().unwrap();
        sub.commit(&a).await.unwrap();
        let _b = sub.next().await.unwrap().unwrap();
        drop(sub);

        let mut again = bus.subscribe("t", "g", 0, StartOffset::Earliest).await.unwrap();
        let redelivered = again.next().await.unwrap().unwrap();
        assert_eq!(redelivered.message.payload, b"b");

        let mut other_group = bus.subscribe("t", "h", 0, StartOffset::Earliest).await.unwrap();
        assert_eq!(other_group.next().await.unwrap().unwrap().message.payload, b"a");
    }

    #[tokio::test]
    async fn rejected_deliveries_retry_then_dead_letter() {
        let bus = InMemoryBus::with_partitions(1);
        bus.set_max_deliveries(2);
        bus.produce(vec![msg("t", 1, "poison"), msg("t", 1, "ok")]).await.unwrap();

        let mut sub = bus.subscribe("t", "g", 0, StartOffset::Earliest).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        sub.reject(&first).await.unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!((second.id.as_str(), second.attempt), ("0", 2));
        sub.reject(&second).await.unwrap();

        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.message.payload, b"ok");
        assert_eq!(bus.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn latest_skips_history_and_outage_fails_produce() {
        let bus = InMemoryBus::with_partitions(1);
        bus.produce(vec![msg("t", 1, "old")]).await.unwrap();
        let mut sub = bus.subscribe("t", "g", 0, StartOffset::Latest).await.unwrap();
        assert!(sub.next().await.unwrap().is_none());

        bus.set_available(false);
        assert!(matches!(
            bus.produce(vec![msg("t", 1, "lost")]).await,
            Err(BusError::Unavailable(_))
        ));
        bus.set_available(true);
        bus.produce(vec![msg("t", 1, "new")]).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().message.payload, b"new");
    }
}
