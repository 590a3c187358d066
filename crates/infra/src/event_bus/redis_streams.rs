//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: `atlas:bus:<topic>:<partition>`, one stream per partition
//! - **Dead letters**: `atlas:bus:<topic>:<partition>:dlq`
//! - **Consumer groups**: one per `ConsumerConfig::group_id`, created on subscribe
//! - **Entry fields**: `key`, `headers` (JSON object), `payload` (envelope bytes)
//!
//! ## Delivery
//!
//! A subscription reads its own pending entries (`XREADGROUP ... 0`) before new
//! ones (`>`), so a rejected delivery is retried before anything behind it and
//! per-partition order holds. `XACK` happens only on commit. Once an entry has
//! been delivered `max_deliveries` times a reject moves it to the dead-letter
//! stream and acknowledges it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use atlas_events::{BusError, Delivery, Headers, Message, MessageBus, PartitionKey, StartOffset, Subscription};

const STREAM_PREFIX: &str = "atlas:bus";
const DEFAULT_MAX_DELIVERIES: u32 = 5;
const DEFAULT_BLOCK: Duration = Duration::from_millis(100);

const FIELD_KEY: &str = "key";
const FIELD_HEADERS: &str = "headers";
const FIELD_PAYLOAD: &str = "payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsConfig {
    pub partitions: u32,
    pub max_deliveries: u32,
    /// How long `next()` blocks waiting for new entries.
    pub block: Duration,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            block: DEFAULT_BLOCK,
        }
    }
}

impl StreamsConfig {
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }
}

/// Producer side shares one managed connection; every subscription opens its
/// own, since a blocking read would stall a shared multiplexed connection.
#[derive(Clone)]
pub struct RedisStreamsBus {
    client: redis::Client,
    conn: ConnectionManager,
    config: StreamsConfig,
}

impl core::fmt::Debug for RedisStreamsBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn unavailable(err: redis::RedisError) -> BusError {
    BusError::Unavailable(err.to_string())
}

fn stream_key(topic: &str, partition: u32) -> String {
    format!("{STREAM_PREFIX}:{topic}:{partition}")
}

fn dead_letter_key(topic: &str, partition: u32) -> String {
    format!("{}:dlq", stream_key(topic, partition))
}

impl RedisStreamsBus {
    #[instrument(skip(url), err)]
    pub async fn connect(url: &str, config: StreamsConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(unavailable)?;
        Ok(Self { client, conn, config })
    }

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(
        conn: &mut MultiplexedConnection,
        stream: &str,
        group: &str,
        start: StartOffset,
    ) -> Result<(), BusError> {
        let from = match start {
            StartOffset::Earliest => "0",
            StartOffset::Latest => "$",
        };
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(from)
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(unavailable(err)),
        }
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    /// One `MULTI`/`EXEC`, so the batch is visible all-or-nothing.
    async fn produce(&self, batch: Vec<Message>) -> Result<(), BusError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for message in &batch {
            let partition = message.key.partition(self.config.partitions);
            let headers = serde_json::to_string(&message.headers)?;
            pipe.cmd("XADD")
                .arg(stream_key(&message.topic, partition))
                .arg("*")
                .arg(FIELD_KEY)
                .arg(message.key.value())
                .arg(FIELD_HEADERS)
                .arg(headers)
                .arg(FIELD_PAYLOAD)
                .arg(message.payload.as_slice())
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        debug!(count = batch.len(), "batch produced");
        Ok(())
    }

    async fn partitions(&self, _topic: &str) -> Result<u32, BusError> {
        Ok(self.config.partitions)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>, BusError> {
        if partition >= self.config.partitions {
            return Err(BusError::UnknownTopic(format!("{topic} partition {partition}")));
        }
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(unavailable)?;
        let stream = stream_key(topic, partition);
        Self::ensure_group(&mut conn, &stream, group, start).await?;
        Ok(Box::new(RedisStreamsSubscription {
            conn,
            topic: topic.to_string(),
            partition,
            dead_letters: dead_letter_key(topic, partition),
            stream,
            group: group.to_string(),
            consumer: format!("{group}-{}", Uuid::now_v7()),
            config: self.config,
            pending_first: true,
        }))
    }
}

struct RedisStreamsSubscription {
    conn: MultiplexedConnection,
    topic: String,
    partition: u32,
    stream: String,
    dead_letters: String,
    group: String,
    consumer: String,
    config: StreamsConfig,
    /// Set after a reject and at start-up: own pending entries come first.
    pending_first: bool,
}

impl RedisStreamsSubscription {
    async fn read(&mut self, from: &str, block: Option<Duration>) -> Result<Option<StreamId>, BusError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer).arg("COUNT").arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(u64::try_from(block.as_millis()).unwrap_or(u64::MAX));
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(from);
        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn).await.map_err(unavailable)?;
        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    /// How often the entry has been handed out so far.
    async fn delivery_count(&mut self, id: &str) -> Result<u32, BusError> {
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(&mut self.conn)
            .await
            .map_err(unavailable)?;
        Ok(reply
            .ids
            .first()
            .map(|p| u32::try_from(p.times_delivered).unwrap_or(u32::MAX))
            .unwrap_or(1))
    }

    async fn ack(&mut self, id: &str) -> Result<(), BusError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut self.conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

/// Rebuild the bus message stored in a stream entry.
fn decode_entry(topic: &str, entry: &StreamId) -> Result<Message, BusError> {
    let key: u64 = entry
        .get(FIELD_KEY)
        .ok_or_else(|| BusError::Serialization(format!("entry {} has no key", entry.id)))?;
    let payload: Vec<u8> = entry
        .get(FIELD_PAYLOAD)
        .ok_or_else(|| BusError::Serialization(format!("entry {} has no payload", entry.id)))?;
    let headers: Headers = match entry.get::<String>(FIELD_HEADERS) {
        Some(raw) => serde_json::from_str(&raw)?,
        None => BTreeMap::new(),
    };
    let mut message = Message::new(topic, PartitionKey::new(key), payload);
    message.headers = headers;
    Ok(message)
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError> {
        if self.pending_first {
            match self.read("0", None).await? {
                Some(entry) => {
                    let attempt = self.delivery_count(&entry.id).await?;
                    return self.deliver(entry, attempt).await;
                }
                None => self.pending_first = false,
            }
        }
        match self.read(">", Some(self.config.block)).await? {
            Some(entry) => self.deliver(entry, 1).await,
            None => Ok(None),
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.ack(&delivery.id).await
    }

    async fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        if delivery.attempt < self.config.max_deliveries {
            self.pending_first = true;
            return Ok(());
        }
        let headers = serde_json::to_string(&delivery.message.headers)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&self.dead_letters)
            .arg("*")
            .arg("original_id")
            .arg(&delivery.id)
            .arg("attempts")
            .arg(delivery.attempt)
            .arg(FIELD_KEY)
            .arg(delivery.message.key.value())
            .arg(FIELD_HEADERS)
            .arg(headers)
            .arg(FIELD_PAYLOAD)
            .arg(delivery.message.payload.as_slice())
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&delivery.id)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await.map_err(unavailable)?;
        warn!(
            topic = %self.topic,
            partition = self.partition,
            message_id = %delivery.id,
            attempts = delivery.attempt,
            "message sent to dead-letter stream"
        );
        Ok(())
    }
}

impl RedisStreamsSubscription {
    async fn deliver(&mut self, entry: StreamId, attempt: u32) -> Result<Option<Delivery>, BusError> {
        // Trimmed entries stay in the pending list with no fields.
        if entry.map.is_empty() {
            warn!(stream = %self.stream, message_id = %entry.id, "pending entry no longer exists; acknowledged");
            self.ack(&entry.id).await?;
            return Ok(None);
        }
        let message = match decode_entry(&self.topic, &entry) {
            Ok(message) => message,
            Err(err) => {
                warn!(stream = %self.stream, message_id = %entry.id, error = %err, "undecodable entry; acknowledged");
                self.ack(&entry.id).await?;
                return Ok(None);
            }
        };
        Ok(Some(Delivery {
            message,
            partition: self.partition,
            id: entry.id,
            attempt,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use redis::Value;

    use super::*;

    #[test]
    fn keys_are_per_topic_partition() {
        assert_eq!(stream_key("COMMAND_TOPIC_SAGA", 3), "atlas:bus:COMMAND_TOPIC_SAGA:3");
        assert_eq!(
            dead_letter_key("COMMAND_TOPIC_SAGA", 3),
            "atlas:bus:COMMAND_TOPIC_SAGA:3:dlq"
        );
    }

    #[test]
    fn decodes_stream_entry_into_message() {
        let mut map = HashMap::new();
        map.insert(FIELD_KEY.to_string(), Value::Data(b"42".to_vec()));
        map.insert(
            FIELD_HEADERS.to_string(),
            Value::Data(br#"{"REGION":"GMS"}"#.to_vec()),
        );
        map.insert(FIELD_PAYLOAD.to_string(), Value::Data(b"{}".to_vec()));
        let entry = StreamId {
            id: "1-0".into(),
            map,
        };
        let message = decode_entry("EVENT_TOPIC_SAGA_STATUS", &entry).unwrap();
        assert_eq!(message.key, PartitionKey::new(42));
        assert_eq!(message.headers.get("REGION").map(String::as_str), Some("GMS"));
        assert_eq!(message.payload, b"{}".to_vec());
        assert_eq!(message.topic, "EVENT_TOPIC_SAGA_STATUS");
    }

    #[test]
    fn entry_without_payload_is_rejected() {
        let mut map = HashMap::new();
        map.insert(FIELD_KEY.to_string(), Value::Data(b"1".to_vec()));
        let entry = StreamId {
            id: "1-0".into(),
            map,
        };
        assert!(matches!(
            decode_entry("T", &entry),
            Err(BusError::Serialization(_))
        ));
    }
}
