//! Saga and step model.
//!
//! A [`Saga`] is an ordered list of [`Step`]s. Steps only ever move from
//! `pending` to `completed` or `failed`, and they do so left to right, so the
//! completed steps always form a prefix of the list. Every mutator here checks
//! that shape; a saga that violates it is reported as [`SagaError::Inconsistent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

use atlas_core::{Classified, ErrorKind, TransactionId};

use crate::action::Action;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaType {
    InventoryTransaction,
    QuestReward,
    TradeTransaction,
    CharacterCreation,
    StorageOperation,
    CashShopOperation,
    CharacterRespawn,
    GachaponTransaction,
    FieldEffectUse,
    QuestStart,
    QuestComplete,
    ReactorDrop,
}

impl SagaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaType::InventoryTransaction => "inventory_transaction",
            SagaType::QuestReward => "quest_reward",
            SagaType::TradeTransaction => "trade_transaction",
            SagaType::CharacterCreation => "character_creation",
            SagaType::StorageOperation => "storage_operation",
            SagaType::CashShopOperation => "cash_shop_operation",
            SagaType::CharacterRespawn => "character_respawn",
            SagaType::GachaponTransaction => "gachapon_transaction",
            SagaType::FieldEffectUse => "field_effect_use",
            SagaType::QuestStart => "quest_start",
            SagaType::QuestComplete => "quest_complete",
            SagaType::ReactorDrop => "reactor_drop",
        }
    }
}

impl core::fmt::Display for SagaType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

impl core::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        })
    }
}

/// State derived from step statuses alone. Terminal `failed` is a persistence
/// status: it is reached once compensation has been issued.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Completed,
    Compensating,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SagaError {
    #[error("saga has no steps")]
    EmptySaga,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step {step_id} cannot move from {from} to {to}")]
    InvalidTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step index {0} out of range")]
    StepOutOfRange(usize),

    #[error("inconsistent saga: {0}")]
    Inconsistent(String),
}

impl Classified for SagaError {
    fn kind(&self) -> ErrorKind {
        match self {
            SagaError::EmptySaga | SagaError::DuplicateStepId(_) => ErrorKind::BadInput,
            _ => ErrorKind::PreconditionFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "StepRecord")]
pub struct Step {
    pub step_id: String,
    pub status: StepStatus,
    pub action: Action,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Details reported with the completion event (`assetId`, `nextQuestId`, ...).
    pub result: Option<JsonValue>,
}

impl Step {
    pub fn pending(step_id: impl Into<String>, action: Action, now: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            action,
            created_at: now,
            updated_at: now,
            result: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    /// Integer field from the completion details, if reported.
    pub fn result_u32(&self, field: &str) -> Option<u32> {
        self.result
            .as_ref()?
            .get(field)?
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
    }
}

/// Persisted step shape: the action is split into its tag and payload.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepRecord {
    step_id: String,
    status: StepStatus,
    action: String,
    #[serde(default)]
    payload: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<JsonValue>,
}

impl TryFrom<StepRecord> for Step {
    type Error = serde_json::Error;

    fn try_from(record: StepRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            step_id: record.step_id,
            status: record.status,
            action: Action::from_parts(&record.action, record.payload)?,
            created_at: record.created_at,
            updated_at: record.updated_at,
            result: record.result,
        })
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (tag, payload) = self.action.to_parts().map_err(serde::ser::Error::custom)?;
        StepRecord {
            step_id: self.step_id.clone(),
            status: self.status,
            action: tag.to_string(),
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            result: self.result.clone(),
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Saga {
    pub transaction_id: TransactionId,
    pub saga_type: SagaType,
    pub initiated_by: String,
    steps: Vec<Step>,
}

impl Saga {
    pub fn new(
        transaction_id: TransactionId,
        saga_type: SagaType,
        initiated_by: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            saga_type,
            initiated_by: initiated_by.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step (builder style).
    pub fn with_step(mut self, step: Step) -> Result<Self, SagaError> {
        if self.position(&step.step_id).is_some() {
            return Err(SagaError::DuplicateStepId(step.step_id));
        }
        self.steps.push(step);
        Ok(self)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// The earliest pending step.
    pub fn current_step(&self) -> Option<(usize, &Step)> {
        self.steps.iter().enumerate().find(|(_, s)| s.is_pending())
    }

    pub fn furthest_completed_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .rposition(|s| s.status == StepStatus::Completed)
    }

    pub fn failed_step(&self) -> Option<(usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.status == StepStatus::Failed)
    }

    /// Completed steps, in execution order.
    pub fn completed_prefix(&self) -> &[Step] {
        let end = self
            .steps
            .iter()
            .position(|s| s.status != StepStatus::Completed)
            .unwrap_or(self.steps.len());
        &self.steps[..end]
    }

    pub fn progress(&self) -> Progress {
        if self.failed_step().is_some() {
            Progress::Compensating
        } else if self.current_step().is_some() {
            Progress::InProgress
        } else {
            Progress::Completed
        }
    }

    /// Move one step out of `pending`. Only the earliest pending step may move,
    /// and nothing moves once a step has failed.
    pub fn with_step_status(
        &mut self,
        index: usize,
        status: StepStatus,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        let step = self.steps.get(index).ok_or(SagaError::StepOutOfRange(index))?;
        if !step.is_pending() || status == StepStatus::Pending {
            return Err(SagaError::InvalidTransition {
                step_id: step.step_id.clone(),
                from: step.status,
                to: status,
            });
        }
        if let Some((failed, _)) = self.failed_step() {
            return Err(SagaError::Inconsistent(format!(
                "step {} already failed",
                self.steps[failed].step_id
            )));
        }
        if self.current_step().map(|(i, _)| i) != Some(index) {
            return Err(SagaError::Inconsistent(format!(
                "step {} is not the earliest pending step",
                step.step_id
            )));
        }

        let step = &mut self.steps[index];
        step.status = status;
        step.updated_at = now;
        Ok(())
    }

    pub fn set_step_result(&mut self, index: usize, result: JsonValue) -> Result<(), SagaError> {
        let step = self
            .steps
            .get_mut(index)
            .ok_or(SagaError::StepOutOfRange(index))?;
        step.result = Some(result);
        Ok(())
    }

    /// Replace one pending step by several (expansion).
    pub fn replace_step(&mut self, index: usize, replacement: Vec<Step>) -> Result<(), SagaError> {
        let step = self.steps.get(index).ok_or(SagaError::StepOutOfRange(index))?;
        if !step.is_pending() {
            return Err(SagaError::Inconsistent(format!(
                "cannot replace {} step {}",
                step.status, step.step_id
            )));
        }
        for (i, new) in replacement.iter().enumerate() {
            let clash = self
                .steps
                .iter()
                .enumerate()
                .any(|(j, s)| j != index && s.step_id == new.step_id)
                || replacement[..i].iter().any(|s| s.step_id == new.step_id);
            if clash {
                return Err(SagaError::DuplicateStepId(new.step_id.clone()));
            }
        }
        self.steps.splice(index..=index, replacement);
        Ok(())
    }

    /// Insert a pending step directly after `index` (quest chaining).
    pub fn insert_after(&mut self, index: usize, step: Step) -> Result<(), SagaError> {
        if index >= self.steps.len() {
            return Err(SagaError::StepOutOfRange(index));
        }
        if self.position(&step.step_id).is_some() {
            return Err(SagaError::DuplicateStepId(step.step_id));
        }
        if !step.is_pending() {
            return Err(SagaError::Inconsistent(format!(
                "inserted step {} must be pending",
                step.step_id
            )));
        }
        self.steps.insert(index + 1, step);
        Ok(())
    }

    /// Check structural invariants: non-empty, unique step ids, completed steps
    /// form a prefix and at most one step has failed (directly after that prefix).
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.steps.is_empty() {
            return Err(SagaError::EmptySaga);
        }
        for (i, step) in self.steps.iter().enumerate() {
            if self.steps[..i].iter().any(|s| s.step_id == step.step_id) {
                return Err(SagaError::DuplicateStepId(step.step_id.clone()));
            }
        }

        let tail = &self.steps[self.completed_prefix().len()..];
        let rest = match tail.first() {
            Some(first) if first.status == StepStatus::Failed => &tail[1..],
            _ => tail,
        };
        if let Some(bad) = rest.iter().find(|s| !s.is_pending()) {
            return Err(SagaError::Inconsistent(format!(
                "step {} is {} after an unfinished step",
                bad.step_id, bad.status
            )));
        }
        Ok(())
    }
}
