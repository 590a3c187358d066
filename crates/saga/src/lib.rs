//! Saga / process manager model (pure, no I/O).
//!
//! - A saga is an ordered list of typed steps identified by a transaction id
//! - Steps move `pending -> completed` or `pending -> failed`, left to right
//! - High-level steps expand into internal steps before they are executed
//! - Completed steps are undone in reverse order through inverse actions
//!
//! Persistence, emission and event correlation live in `atlas-infra::saga`.

pub mod action;
pub mod compensation;
pub mod expansion;
pub mod messages;
pub mod model;
pub mod payload;

pub use action::{Action, Route};
pub use compensation::compensation_for;
pub use expansion::{AssetSnapshot, expand, expansion_for};
pub use messages::{SagaCommand, SagaStatusEvent, StepOutcome, StepStatusBody, StepStatusEvent};
pub use model::{Progress, Saga, SagaError, SagaType, Step, StepStatus};
