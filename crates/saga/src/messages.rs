//! Bodies for the saga command topic and the two saga event topics.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use atlas_events::MessageBody;

use crate::model::{Saga, SagaType, StepStatus};

/// `COMMAND_TOPIC_SAGA`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum SagaCommand {
    #[serde(rename = "CREATE")]
    Create(Saga),
}

impl MessageBody for SagaCommand {
    const TYPES: &'static [&'static str] = &["CREATE"];

    fn type_tag(&self) -> &'static str {
        "CREATE"
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
}

impl From<StepOutcome> for StepStatus {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Success => StepStatus::Completed,
            StepOutcome::Failure => StepStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatusBody {
    /// Reporting services may name the step; otherwise the earliest pending
    /// step of the transaction is matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub details: JsonValue,
}

/// `EVENT_TOPIC_SAGA_STEP_STATUS`, emitted by the services executing steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum StepStatusEvent {
    #[serde(rename = "COMPLETED")]
    Completed(StepStatusBody),
    #[serde(rename = "FAILED")]
    Failed(StepStatusBody),
}

impl StepStatusEvent {
    pub fn outcome(&self) -> StepOutcome {
        match self {
            StepStatusEvent::Completed(_) => StepOutcome::Success,
            StepStatusEvent::Failed(_) => StepOutcome::Failure,
        }
    }

    pub fn body(&self) -> &StepStatusBody {
        match self {
            StepStatusEvent::Completed(body) | StepStatusEvent::Failed(body) => body,
        }
    }

    pub fn into_body(self) -> StepStatusBody {
        match self {
            StepStatusEvent::Completed(body) | StepStatusEvent::Failed(body) => body,
        }
    }
}

impl MessageBody for StepStatusEvent {
    const TYPES: &'static [&'static str] = &["COMPLETED", "FAILED"];

    fn type_tag(&self) -> &'static str {
        match self {
            StepStatusEvent::Completed(_) => "COMPLETED",
            StepStatusEvent::Failed(_) => "FAILED",
        }
    }
}

/// `EVENT_TOPIC_SAGA_STATUS`, emitted once per saga when it terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatusEvent {
    #[serde(rename_all = "camelCase")]
    Completed {
        saga_type: SagaType,
        initiated_by: String,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        saga_type: SagaType,
        initiated_by: String,
        reason: String,
        failed_step: String,
    },
}

impl MessageBody for SagaStatusEvent {
    const TYPES: &'static [&'static str] = &["COMPLETED", "FAILED"];

    fn type_tag(&self) -> &'static str {
        match self {
            SagaStatusEvent::Completed { .. } => "COMPLETED",
            SagaStatusEvent::Failed { .. } => "FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{TransactionId, WorldId};
    use atlas_events::{Envelope, RawEnvelope};

    #[test]
    fn step_status_event_decodes_from_wire() {
        let tx = TransactionId::new();
        let raw: RawEnvelope = serde_json::from_value(serde_json::json!({
            "transactionId": tx.to_string(),
            "worldId": 0,
            "type": "COMPLETED",
            "body": { "details": { "nextQuestId": 2001 } }
        }))
        .unwrap();
        let env = raw.decode::<StepStatusEvent>().unwrap();
        assert_eq!(env.transaction_id, tx);
        assert_eq!(env.body.outcome(), StepOutcome::Success);
        assert_eq!(env.body.body().details["nextQuestId"], 2001);
        assert_eq!(env.body.body().step_id, None);
    }

    #[test]
    fn saga_status_failed_carries_reason() {
        let env = Envelope::new(
            TransactionId::new(),
            WorldId(0),
            None,
            SagaStatusEvent::Failed {
                saga_type: SagaType::StorageOperation,
                initiated_by: "character:1".into(),
                reason: "step failed".into(),
                failed_step: "move.release".into(),
            },
        );
        let json = serde_json::to_value(env.into_raw().unwrap()).unwrap();
        assert_eq!(json["type"], "FAILED");
        assert_eq!(json["body"]["sagaType"], "storage_operation");
        assert_eq!(json["body"]["failedStep"], "move.release");
    }
}
