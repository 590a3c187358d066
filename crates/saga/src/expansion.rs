//! High-level step expansion.
//!
//! `transfer_to_storage`, `withdraw_from_storage`, `transfer_to_cash_shop` and
//! `withdraw_from_cash_shop` are replaced on first visit by an accept step at the
//! destination followed by a release step at the source. The derived steps are
//! named `<id>.accept` and `<id>.release` and are persisted, so visiting the saga
//! again finds an internal step in front and does nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use atlas_core::{AssetId, ItemId};

use crate::action::Action;
use crate::model::{Saga, SagaError, Step};
use crate::payload::*;

/// What the source service knows about the asset being moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSnapshot {
    pub asset_id: AssetId,
    pub template_id: ItemId,
    pub reference_id: u32,
    pub reference_type: String,
    #[serde(default)]
    pub reference_data: JsonValue,
    pub quantity: u32,
    /// Cash shop compartment on the cash shop side of the move; nil lets the
    /// cash shop resolve it from the compartment type.
    #[serde(default)]
    pub compartment_id: Uuid,
}

impl AssetSnapshot {
    /// Requested quantity, where 0 means the whole stack.
    fn take(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.quantity
        } else {
            requested.min(self.quantity)
        }
    }
}

/// Internal steps replacing a high-level `step`; `None` when it is not high-level.
pub fn expansion_for(step: &Step, asset: &AssetSnapshot, now: DateTime<Utc>) -> Option<[Step; 2]> {
    let (accept, release) = match &step.action {
        Action::TransferToStorage(p) => {
            let quantity = asset.take(p.quantity);
            (
                Action::AcceptToStorage(AcceptToStorage {
                    transaction_id: p.transaction_id,
                    world_id: p.world_id,
                    account_id: p.account_id,
                    character_id: p.character_id,
                    template_id: asset.template_id,
                    reference_id: asset.reference_id,
                    reference_type: asset.reference_type.clone(),
                    reference_data: asset.reference_data.clone(),
                    quantity,
                }),
                Action::ReleaseFromCharacter(ReleaseFromCharacter {
                    transaction_id: p.transaction_id,
                    character_id: p.character_id,
                    inventory_type: p.source_inventory_type,
                    asset_id: asset.asset_id,
                    quantity,
                }),
            )
        }
        Action::WithdrawFromStorage(p) => {
            let quantity = asset.take(p.quantity);
            (
                Action::AcceptToCharacter(AcceptToCharacter {
                    transaction_id: p.transaction_id,
                    character_id: p.character_id,
                    inventory_type: p.inventory_type,
                    template_id: asset.template_id,
                    reference_id: asset.reference_id,
                    reference_type: asset.reference_type.clone(),
                    reference_data: asset.reference_data.clone(),
                    quantity,
                }),
                Action::ReleaseFromStorage(ReleaseFromStorage {
                    transaction_id: p.transaction_id,
                    world_id: p.world_id,
                    account_id: p.account_id,
                    character_id: p.character_id,
                    asset_id: asset.asset_id,
                    quantity,
                }),
            )
        }
        Action::TransferToCashShop(p) => (
            Action::AcceptToCashShop(AcceptToCashShop {
                transaction_id: p.transaction_id,
                character_id: p.character_id,
                account_id: p.account_id,
                compartment_id: asset.compartment_id,
                compartment_type: p.compartment_type,
                cash_id: p.cash_id,
                template_id: asset.template_id,
                reference_id: asset.reference_id,
                reference_type: asset.reference_type.clone(),
                reference_data: asset.reference_data.clone(),
            }),
            Action::ReleaseFromCharacter(ReleaseFromCharacter {
                transaction_id: p.transaction_id,
                character_id: p.character_id,
                inventory_type: p.source_inventory_type,
                asset_id: asset.asset_id,
                quantity: asset.quantity,
            }),
        ),
        Action::WithdrawFromCashShop(p) => (
            Action::AcceptToCharacter(AcceptToCharacter {
                transaction_id: p.transaction_id,
                character_id: p.character_id,
                inventory_type: p.inventory_type,
                template_id: asset.template_id,
                reference_id: asset.reference_id,
                reference_type: asset.reference_type.clone(),
                reference_data: asset.reference_data.clone(),
                quantity: asset.quantity,
            }),
            Action::ReleaseFromCashShop(ReleaseFromCashShop {
                transaction_id: p.transaction_id,
                character_id: p.character_id,
                account_id: p.account_id,
                compartment_id: asset.compartment_id,
                compartment_type: p.compartment_type,
                asset_id: asset.asset_id,
                cash_id: p.cash_id,
                template_id: asset.template_id,
            }),
        ),
        _ => return None,
    };

    Some([
        Step::pending(format!("{}.accept", step.step_id), accept, now),
        Step::pending(format!("{}.release", step.step_id), release, now),
    ])
}

/// Expand the current step in place. Returns `true` if the saga changed.
pub fn expand(saga: &mut Saga, asset: &AssetSnapshot, now: DateTime<Utc>) -> Result<bool, SagaError> {
    let Some((index, step)) = saga.current_step() else {
        return Ok(false);
    };
    let Some(steps) = expansion_for(step, asset, now) else {
        return Ok(false);
    };
    saga.replace_step(index, steps.into())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SagaType, StepStatus};
    use atlas_core::{AccountId, CharacterId, TransactionId, WorldId};

    fn asset() -> AssetSnapshot {
        AssetSnapshot {
            asset_id: AssetId(4411),
            template_id: ItemId(2000000),
            reference_id: 88,
            reference_type: "consumable".into(),
            reference_data: serde_json::json!({ "quantity": 50 }),
            quantity: 50,
            compartment_id: Uuid::nil(),
        }
    }

    fn storage_saga(quantity: u32) -> Saga {
        let tx = TransactionId::new();
        Saga::new(tx, SagaType::StorageOperation, "character:1")
            .with_step(Step::pending(
                "move",
                Action::TransferToStorage(TransferToStorage {
                    transaction_id: tx,
                    character_id: CharacterId(1),
                    world_id: WorldId(0),
                    account_id: AccountId(3),
                    source_slot: 4,
                    source_inventory_type: 2,
                    quantity,
                }),
                Utc::now(),
            ))
            .unwrap()
    }

    #[test]
    fn transfer_to_storage_becomes_accept_then_release() {
        let mut saga = storage_saga(0);
        assert!(expand(&mut saga, &asset(), Utc::now()).unwrap());

        let steps = saga.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_id, "move.accept");
        assert_eq!(steps[1].step_id, "move.release");
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));

        match (&steps[0].action, &steps[1].action) {
            (Action::AcceptToStorage(accept), Action::ReleaseFromCharacter(release)) => {
                assert_eq!(accept.quantity, 50);
                assert_eq!(accept.reference_id, 88);
                assert_eq!(release.asset_id, AssetId(4411));
                assert_eq!(release.inventory_type, 2);
            }
            other => panic!("unexpected expansion: {other:?}"),
        }
    }

    #[test]
    fn partial_quantity_is_capped_by_stack() {
        let mut saga = storage_saga(10);
        expand(&mut saga, &asset(), Utc::now()).unwrap();
        let Action::AcceptToStorage(accept) = &saga.steps()[0].action else {
            panic!("expected accept_to_storage");
        };
        assert_eq!(accept.quantity, 10);
    }

    #[test]
    fn expansion_is_idempotent() {
        let mut saga = storage_saga(0);
        expand(&mut saga, &asset(), Utc::now()).unwrap();
        let once = saga.clone();
        assert!(!expand(&mut saga, &asset(), Utc::now()).unwrap());
        assert_eq!(saga, once);
    }

    #[test]
    fn cash_shop_withdrawal_releases_from_cash_shop() {
        let tx = TransactionId::new();
        let step = Step::pending(
            "cash",
            Action::WithdrawFromCashShop(WithdrawFromCashShop {
                transaction_id: tx,
                character_id: CharacterId(1),
                account_id: AccountId(3),
                cash_id: 900,
                compartment_type: 1,
                inventory_type: 5,
            }),
            Utc::now(),
        );
        let [accept, release] = expansion_for(&step, &asset(), Utc::now()).unwrap();
        assert_eq!(accept.action.tag(), "accept_to_character");
        assert_eq!(release.action.tag(), "release_from_cash_shop");
    }
}
