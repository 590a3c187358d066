//! `atlas-core`: tenant identity, operation context and the shared error taxonomy.
//!
//! Everything here is free of I/O. Registries, stores and the message bus build on
//! these types to keep every unit of work bound to exactly one tenant.

pub mod clock;
pub mod context;
pub mod error;
pub mod id;
pub mod tenant;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Cancellation, CancellationSource, OperationContext, TraceContext};
pub use error::{Classified, CoreError, CoreResult, ErrorKind};
pub use id::{
    AccountId, AssetId, ChannelId, CharacterId, Field, ItemId, MapId, TenantId, TransactionId,
    WorldId,
};
pub use tenant::{HeaderLookup, Tenant};
pub use version::ExpectedVersion;
