//! Message bus mechanics: envelopes, partitioned bus abstraction, emit buffer,
//! handler dispatch and header parsing.
//!
//! Runtime pieces that need Redis or a worker pool live in `atlas-infra`.

pub mod buffer;
pub mod bus;
pub mod envelope;
pub mod handler;
pub mod headers;
pub mod in_memory_bus;
pub mod message;
pub mod topic;

pub use buffer::{MessageBuffer, emit};
pub use bus::{BusError, Delivery, MessageBus, StartOffset, Subscription};
pub use envelope::{DecodeError, Envelope, MessageBody, RawEnvelope};
pub use handler::{Handler, HandlerError, HandlerOutcome, Typed, TypedHandler};
pub use headers::{HeaderParser, TenantHeaderParser, TraceHeaderParser, default_parsers, parse_headers};
pub use in_memory_bus::InMemoryBus;
pub use message::{Headers, Message, PartitionKey};
pub use topic::Topics;
