//! Step payloads, one fixed schema per action.
//!
//! Field names are camelCase on the wire. Internal payloads (`accept_*`,
//! `release_*`) are only ever produced by expansion, with asset data filled in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use atlas_core::{AccountId, AssetId, ChannelId, CharacterId, ItemId, MapId, TransactionId, WorldId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetail {
    pub template_id: ItemId,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardAsset {
    pub character_id: CharacterId,
    pub item: ItemDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardMesos {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub actor_id: u32,
    pub actor_type: String,
    /// Negative amounts deduct.
    pub amount: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceDistribution {
    pub experience_type: String,
    pub amount: u32,
    #[serde(default)]
    pub attr1: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardExperience {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub distributions: Vec<ExperienceDistribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductExperience {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub amount: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyAsset {
    pub character_id: CharacterId,
    pub template_id: ItemId,
    pub quantity: u32,
    #[serde(default)]
    pub remove_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositToStorage {
    pub character_id: CharacterId,
    pub account_id: AccountId,
    pub world_id: WorldId,
    pub slot: i16,
    pub template_id: ItemId,
    pub reference_id: u32,
    pub reference_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    pub quantity: u32,
    #[serde(default)]
    pub owner_id: u32,
    #[serde(default)]
    pub flag: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToStorage {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub account_id: AccountId,
    pub source_slot: i16,
    pub source_inventory_type: u8,
    /// 0 moves the whole stack.
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawFromStorage {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub account_id: AccountId,
    pub source_slot: i16,
    pub inventory_type: u8,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToCashShop {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub account_id: AccountId,
    pub cash_id: i64,
    pub source_inventory_type: u8,
    pub compartment_type: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawFromCashShop {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub account_id: AccountId,
    pub cash_id: i64,
    pub compartment_type: u8,
    pub inventory_type: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptToStorage {
    pub transaction_id: TransactionId,
    pub world_id: WorldId,
    pub account_id: AccountId,
    pub character_id: CharacterId,
    pub template_id: ItemId,
    pub reference_id: u32,
    pub reference_type: String,
    #[serde(default)]
    pub reference_data: JsonValue,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseFromCharacter {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub inventory_type: u8,
    pub asset_id: AssetId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptToCharacter {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub inventory_type: u8,
    pub template_id: ItemId,
    pub reference_id: u32,
    pub reference_type: String,
    #[serde(default)]
    pub reference_data: JsonValue,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseFromStorage {
    pub transaction_id: TransactionId,
    pub world_id: WorldId,
    pub account_id: AccountId,
    pub character_id: CharacterId,
    pub asset_id: AssetId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptToCashShop {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub account_id: AccountId,
    pub compartment_id: Uuid,
    pub compartment_type: u8,
    pub cash_id: i64,
    pub template_id: ItemId,
    pub reference_id: u32,
    pub reference_type: String,
    #[serde(default)]
    pub reference_data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseFromCashShop {
    pub transaction_id: TransactionId,
    pub character_id: CharacterId,
    pub account_id: AccountId,
    pub compartment_id: Uuid,
    pub compartment_type: u8,
    pub asset_id: AssetId,
    pub cash_id: i64,
    pub template_id: ItemId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetHp {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub amount: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAllBuffs {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub map_id: MapId,
    #[serde(default)]
    pub instance: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarpToPortal {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub map_id: MapId,
    #[serde(default)]
    pub instance: Uuid,
    pub portal_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldEffectWeather {
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub map_id: MapId,
    #[serde(default)]
    pub instance: Uuid,
    pub item_id: ItemId,
    pub message: String,
    pub duration_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyConsumableEffect {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub item_id: ItemId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQuest {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub quest_id: u32,
    pub npc_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteQuest {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub quest_id: u32,
    pub npc_id: u32,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnReactorDrops {
    pub character_id: CharacterId,
    pub world_id: WorldId,
    pub channel_id: ChannelId,
    pub map_id: MapId,
    #[serde(default)]
    pub instance: Uuid,
    pub reactor_id: u32,
    pub classification: String,
    pub x: i16,
    pub y: i16,
    /// `"drop"` for simultaneous, `"spray"` for staggered drops.
    pub drop_type: String,
    #[serde(default)]
    pub meso: bool,
    #[serde(default)]
    pub meso_chance: u32,
    #[serde(default)]
    pub meso_min: u32,
    #[serde(default)]
    pub meso_max: u32,
    #[serde(default)]
    pub min_items: u32,
}
