//! Closed action vocabulary.
//!
//! Every step carries exactly one [`Action`]; the variant fixes the payload schema
//! and the command it is executed as.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use atlas_core::{ChannelId, CharacterId, WorldId};
use atlas_events::topic::{
    COMMAND_TOPIC_BUFF, COMMAND_TOPIC_CASH_SHOP, COMMAND_TOPIC_CHARACTER,
    COMMAND_TOPIC_COMPARTMENT, COMMAND_TOPIC_CONSUMABLE, COMMAND_TOPIC_MAP, COMMAND_TOPIC_QUEST,
    COMMAND_TOPIC_REACTOR, COMMAND_TOPIC_STORAGE,
};

use crate::payload::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum Action {
    AwardMesos(AwardMesos),
    AwardAsset(AwardAsset),
    AwardExperience(AwardExperience),
    DestroyAsset(DestroyAsset),
    DepositToStorage(DepositToStorage),
    TransferToStorage(TransferToStorage),
    WithdrawFromStorage(WithdrawFromStorage),
    TransferToCashShop(TransferToCashShop),
    WithdrawFromCashShop(WithdrawFromCashShop),
    SetHp(SetHp),
    DeductExperience(DeductExperience),
    CancelAllBuffs(CancelAllBuffs),
    WarpToPortal(WarpToPortal),
    FieldEffectWeather(FieldEffectWeather),
    ApplyConsumableEffect(ApplyConsumableEffect),
    StartQuest(StartQuest),
    CompleteQuest(CompleteQuest),
    SpawnReactorDrops(SpawnReactorDrops),
    AcceptToStorage(AcceptToStorage),
    ReleaseFromCharacter(ReleaseFromCharacter),
    AcceptToCharacter(AcceptToCharacter),
    ReleaseFromStorage(ReleaseFromStorage),
    AcceptToCashShop(AcceptToCashShop),
    ReleaseFromCashShop(ReleaseFromCashShop),
}

/// Where and as what a step is executed: topic variable plus command `type`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Route {
    pub topic: &'static str,
    pub command: &'static str,
}

const fn route(topic: &'static str, command: &'static str) -> Option<Route> {
    Some(Route { topic, command })
}

impl Action {
    pub fn tag(&self) -> &'static str {
        match self {
            Action::AwardMesos(_) => "award_mesos",
            Action::AwardAsset(_) => "award_asset",
            Action::AwardExperience(_) => "award_experience",
            Action::DestroyAsset(_) => "destroy_asset",
            Action::DepositToStorage(_) => "deposit_to_storage",
            Action::TransferToStorage(_) => "transfer_to_storage",
            Action::WithdrawFromStorage(_) => "withdraw_from_storage",
            Action::TransferToCashShop(_) => "transfer_to_cash_shop",
            Action::WithdrawFromCashShop(_) => "withdraw_from_cash_shop",
            Action::SetHp(_) => "set_hp",
            Action::DeductExperience(_) => "deduct_experience",
            Action::CancelAllBuffs(_) => "cancel_all_buffs",
            Action::WarpToPortal(_) => "warp_to_portal",
            Action::FieldEffectWeather(_) => "field_effect_weather",
            Action::ApplyConsumableEffect(_) => "apply_consumable_effect",
            Action::StartQuest(_) => "start_quest",
            Action::CompleteQuest(_) => "complete_quest",
            Action::SpawnReactorDrops(_) => "spawn_reactor_drops",
            Action::AcceptToStorage(_) => "accept_to_storage",
            Action::ReleaseFromCharacter(_) => "release_from_character",
            Action::AcceptToCharacter(_) => "accept_to_character",
            Action::ReleaseFromStorage(_) => "release_from_storage",
            Action::AcceptToCashShop(_) => "accept_to_cash_shop",
            Action::ReleaseFromCashShop(_) => "release_from_cash_shop",
        }
    }

    /// High-level actions are never executed directly; they expand first.
    pub fn is_high_level(&self) -> bool {
        matches!(
            self,
            Action::TransferToStorage(_)
                | Action::WithdrawFromStorage(_)
                | Action::TransferToCashShop(_)
                | Action::WithdrawFromCashShop(_)
        )
    }

    /// Command route, `None` for high-level actions.
    pub fn route(&self) -> Option<Route> {
        match self {
            Action::AwardMesos(_) => route(COMMAND_TOPIC_CHARACTER, "REQUEST_CHANGE_MESO"),
            Action::AwardExperience(_) => route(COMMAND_TOPIC_CHARACTER, "AWARD_EXPERIENCE"),
            Action::DeductExperience(_) => route(COMMAND_TOPIC_CHARACTER, "DEDUCT_EXPERIENCE"),
            Action::SetHp(_) => route(COMMAND_TOPIC_CHARACTER, "SET_HP"),
            Action::WarpToPortal(_) => route(COMMAND_TOPIC_CHARACTER, "CHANGE_MAP"),
            Action::AwardAsset(_) => route(COMMAND_TOPIC_COMPARTMENT, "CREATE_ASSET"),
            Action::DestroyAsset(_) => route(COMMAND_TOPIC_COMPARTMENT, "DESTROY"),
            Action::AcceptToCharacter(_) => route(COMMAND_TOPIC_COMPARTMENT, "ACCEPT"),
            Action::ReleaseFromCharacter(_) => route(COMMAND_TOPIC_COMPARTMENT, "RELEASE"),
            Action::DepositToStorage(_) => route(COMMAND_TOPIC_STORAGE, "DEPOSIT"),
            Action::AcceptToStorage(_) => route(COMMAND_TOPIC_STORAGE, "ACCEPT"),
            Action::ReleaseFromStorage(_) => route(COMMAND_TOPIC_STORAGE, "RELEASE"),
            Action::AcceptToCashShop(_) => route(COMMAND_TOPIC_CASH_SHOP, "ACCEPT"),
            Action::ReleaseFromCashShop(_) => route(COMMAND_TOPIC_CASH_SHOP, "RELEASE"),
            Action::CancelAllBuffs(_) => route(COMMAND_TOPIC_BUFF, "CANCEL_ALL"),
            Action::FieldEffectWeather(_) => route(COMMAND_TOPIC_MAP, "WEATHER_START"),
            Action::ApplyConsumableEffect(_) => {
                route(COMMAND_TOPIC_CONSUMABLE, "APPLY_CONSUMABLE_EFFECT")
            }
            Action::StartQuest(_) => route(COMMAND_TOPIC_QUEST, "START"),
            Action::CompleteQuest(_) => route(COMMAND_TOPIC_QUEST, "COMPLETE"),
            Action::SpawnReactorDrops(_) => route(COMMAND_TOPIC_REACTOR, "SPAWN_DROPS"),
            Action::TransferToStorage(_)
            | Action::WithdrawFromStorage(_)
            | Action::TransferToCashShop(_)
            | Action::WithdrawFromCashShop(_) => None,
        }
    }

    pub fn character_id(&self) -> Option<CharacterId> {
        Some(match self {
            Action::AwardMesos(p) => p.character_id,
            Action::AwardAsset(p) => p.character_id,
            Action::AwardExperience(p) => p.character_id,
            Action::DestroyAsset(p) => p.character_id,
            Action::DepositToStorage(p) => p.character_id,
            Action::TransferToStorage(p) => p.character_id,
            Action::WithdrawFromStorage(p) => p.character_id,
            Action::TransferToCashShop(p) => p.character_id,
            Action::WithdrawFromCashShop(p) => p.character_id,
            Action::SetHp(p) => p.character_id,
            Action::DeductExperience(p) => p.character_id,
            Action::CancelAllBuffs(p) => p.character_id,
            Action::WarpToPortal(p) => p.character_id,
            Action::ApplyConsumableEffect(p) => p.character_id,
            Action::StartQuest(p) => p.character_id,
            Action::CompleteQuest(p) => p.character_id,
            Action::SpawnReactorDrops(p) => p.character_id,
            Action::AcceptToStorage(p) => p.character_id,
            Action::ReleaseFromCharacter(p) => p.character_id,
            Action::AcceptToCharacter(p) => p.character_id,
            Action::ReleaseFromStorage(p) => p.character_id,
            Action::AcceptToCashShop(p) => p.character_id,
            Action::ReleaseFromCashShop(p) => p.character_id,
            Action::FieldEffectWeather(_) => return None,
        })
    }

    /// World the command envelope is addressed to (0 when the payload has none).
    pub fn world_id(&self) -> WorldId {
        match self {
            Action::AwardMesos(p) => p.world_id,
            Action::AwardExperience(p) => p.world_id,
            Action::DepositToStorage(p) => p.world_id,
            Action::TransferToStorage(p) => p.world_id,
            Action::WithdrawFromStorage(p) => p.world_id,
            Action::SetHp(p) => p.world_id,
            Action::DeductExperience(p) => p.world_id,
            Action::CancelAllBuffs(p) => p.world_id,
            Action::WarpToPortal(p) => p.world_id,
            Action::FieldEffectWeather(p) => p.world_id,
            Action::ApplyConsumableEffect(p) => p.world_id,
            Action::StartQuest(p) => p.world_id,
            Action::CompleteQuest(p) => p.world_id,
            Action::SpawnReactorDrops(p) => p.world_id,
            Action::AcceptToStorage(p) => p.world_id,
            Action::ReleaseFromStorage(p) => p.world_id,
            _ => WorldId(0),
        }
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Action::AwardMesos(p) => Some(p.channel_id),
            Action::AwardExperience(p) => Some(p.channel_id),
            Action::SetHp(p) => Some(p.channel_id),
            Action::DeductExperience(p) => Some(p.channel_id),
            Action::CancelAllBuffs(p) => Some(p.channel_id),
            Action::WarpToPortal(p) => Some(p.channel_id),
            Action::FieldEffectWeather(p) => Some(p.channel_id),
            Action::ApplyConsumableEffect(p) => Some(p.channel_id),
            Action::SpawnReactorDrops(p) => Some(p.channel_id),
            _ => None,
        }
    }

    /// Split into `(tag, payload)` as stored in a step record.
    pub fn to_parts(&self) -> Result<(&'static str, JsonValue), serde_json::Error> {
        let payload = match serde_json::to_value(self)? {
            JsonValue::Object(mut map) => map.remove("payload").unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        };
        Ok((self.tag(), payload))
    }

    /// Rebuild from a stored `(tag, payload)` pair; unknown tags are rejected.
    pub fn from_parts(tag: &str, payload: JsonValue) -> Result<Self, serde_json::Error> {
        let mut map = Map::with_capacity(2);
        map.insert("action".into(), JsonValue::String(tag.to_string()));
        map.insert("payload".into(), payload);
        serde_json::from_value(JsonValue::Object(map))
    }
}
