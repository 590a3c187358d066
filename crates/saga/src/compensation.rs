//! Inverse actions for completed steps.
//!
//! Accept steps are undone by releasing the asset they created, using the
//! `assetId` reported in the step's completion details (0 asks the owning
//! service to resolve the asset by transaction id). Release steps always come
//! last in an expansion, so a completed release never needs undoing.

use atlas_core::AssetId;

use crate::action::Action;
use crate::model::Step;
use crate::payload::*;

const RESULT_ASSET_ID: &str = "assetId";

/// Inverse of a completed step, `None` when the action has no inverse.
pub fn compensation_for(step: &Step) -> Option<Action> {
    let created = || AssetId(step.result_u32(RESULT_ASSET_ID).unwrap_or(0));

    let inverse = match &step.action {
        Action::AcceptToStorage(p) => Action::ReleaseFromStorage(ReleaseFromStorage {
            transaction_id: p.transaction_id,
            world_id: p.world_id,
            account_id: p.account_id,
            character_id: p.character_id,
            asset_id: created(),
            quantity: p.quantity,
        }),
        Action::AcceptToCharacter(p) => Action::ReleaseFromCharacter(ReleaseFromCharacter {
            transaction_id: p.transaction_id,
            character_id: p.character_id,
            inventory_type: p.inventory_type,
            asset_id: created(),
            quantity: p.quantity,
        }),
        Action::AcceptToCashShop(p) => Action::ReleaseFromCashShop(ReleaseFromCashShop {
            transaction_id: p.transaction_id,
            character_id: p.character_id,
            account_id: p.account_id,
            compartment_id: p.compartment_id,
            compartment_type: p.compartment_type,
            asset_id: created(),
            cash_id: p.cash_id,
            template_id: p.template_id,
        }),
        Action::AwardMesos(p) => Action::AwardMesos(AwardMesos {
            amount: p.amount.saturating_neg(),
            ..p.clone()
        }),
        Action::AwardAsset(p) => Action::DestroyAsset(DestroyAsset {
            character_id: p.character_id,
            template_id: p.item.template_id,
            quantity: p.item.quantity,
            remove_all: false,
        }),
        Action::DestroyAsset(p) if !p.remove_all => Action::AwardAsset(AwardAsset {
            character_id: p.character_id,
            item: ItemDetail {
                template_id: p.template_id,
                quantity: p.quantity,
                expiration: None,
            },
        }),
        Action::AwardExperience(p) => Action::DeductExperience(DeductExperience {
            character_id: p.character_id,
            world_id: p.world_id,
            channel_id: p.channel_id,
            amount: p
                .distributions
                .iter()
                .fold(0u32, |acc, d| acc.saturating_add(d.amount)),
        }),
        Action::DeductExperience(p) => Action::AwardExperience(AwardExperience {
            character_id: p.character_id,
            world_id: p.world_id,
            channel_id: p.channel_id,
            distributions: vec![ExperienceDistribution {
                experience_type: "WHITE".into(),
                amount: p.amount,
                attr1: 0,
            }],
        }),
        _ => return None,
    };
    Some(inverse)
}
