use std::collections::BTreeMap;

use atlas_core::context::{SPAN_ID_HEADER, TRACE_ID_HEADER};
use atlas_core::{CharacterId, MapId, Tenant, TraceContext, TransactionId};

use crate::envelope::{Envelope, MessageBody, RawEnvelope};

pub type Headers = BTreeMap<String, String>;

/// Integer partition key derived from the primary domain id.
///
/// The bus maps a key onto `key % partitions`, so every message for one key is
/// consumed in production order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(u64);

impl PartitionKey {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn partition(self, partitions: u32) -> u32 {
        (self.0 % u64::from(partitions.max(1))) as u32
    }
}

impl From<u32> for PartitionKey {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}

impl From<CharacterId> for PartitionKey {
    fn from(value: CharacterId) -> Self {
        Self::from(value.value())
    }
}

impl From<MapId> for PartitionKey {
    fn from(value: MapId) -> Self {
        Self::from(value.value())
    }
}

impl From<TransactionId> for PartitionKey {
    fn from(value: TransactionId) -> Self {
        let (hi, lo) = value.as_uuid().as_u64_pair();
        Self(hi ^ lo)
    }
}

/// Unit of transport: what the bus stores, partitions and redelivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: PartitionKey,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, key: PartitionKey, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            headers: Headers::new(),
            payload,
        }
    }

    /// Serialize a typed envelope.
    pub fn from_envelope<B: MessageBody>(
        topic: impl Into<String>,
        key: impl Into<PartitionKey>,
        envelope: Envelope<B>,
    ) -> Result<Self, serde_json::Error> {
        Self::from_raw(topic, key, &envelope.into_raw()?)
    }

    pub fn from_raw(
        topic: impl Into<String>,
        key: impl Into<PartitionKey>,
        envelope: &RawEnvelope,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, key.into(), serde_json::to_vec(envelope)?))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_tenant(mut self, tenant: &Tenant) -> Self {
        for (name, value) in tenant.to_headers() {
            self.headers.insert(name.to_string(), value);
        }
        self
    }

    pub fn with_trace(mut self, trace: &TraceContext) -> Self {
        self.headers
            .insert(TRACE_ID_HEADER.to_string(), trace.trace_id().to_string());
        self.headers
            .insert(SPAN_ID_HEADER.to_string(), trace.span_id().to_string());
        self
    }

    pub fn envelope(&self) -> Result<RawEnvelope, serde_json::Error> {
        RawEnvelope::from_slice(&self.payload)
    }
}
