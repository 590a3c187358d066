//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a tenant (multi-tenant boundary).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

/// Identifier of a saga / distributed transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier (UUIDv7, time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(TenantId, "TenantId");
impl_uuid_newtype!(TransactionId, "TransactionId");

/// Game-side numeric identifiers. Transparent on the wire.
macro_rules! numeric_id {
    ($(#[$meta:meta])* $t:ident($inner:ty), $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub $inner);

        impl $t {
            pub fn value(self) -> $inner {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$inner> for $t {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<$inner>()
                    .map(Self)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))
            }
        }
    };
}

numeric_id!(CharacterId(u32), "CharacterId");
numeric_id!(AccountId(u32), "AccountId");
numeric_id!(
    /// Item template identifier.
    ItemId(u32),
    "ItemId"
);
numeric_id!(
    /// Concrete asset (item instance) identifier.
    AssetId(u32),
    "AssetId"
);
numeric_id!(MapId(u32), "MapId");
numeric_id!(WorldId(u8), "WorldId");
numeric_id!(ChannelId(u8), "ChannelId");

/// Game-topology coordinate: `(world, channel, map, instance)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub map_id: MapId,
    #[serde(default)]
    pub instance: Uuid,
}

impl Field {
    pub fn new(world_id: WorldId, channel_id: ChannelId, map_id: MapId) -> Self {
        Self {
            world_id,
            channel_id,
            map_id,
            instance: Uuid::nil(),
        }
    }

    pub fn with_instance(mut self, instance: Uuid) -> Self {
        self.instance = instance;
        self
    }
}

impl core::fmt::Display for Field {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.world_id, self.channel_id, self.map_id, self.instance
        )
    }
}
