//! Stage adapters for the planner, executor and verifier.
//!
//! Each adapter renders its prompt, calls the generator, validates the
//! response and translates it into a [`StateUpdate`]. Stage-level problems
//! become state fields via [`StageError`]; only a generator `Err` (a service
//! fault) is returned to the engine.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::budget::call_timeout;
use crate::core::state_update::{FieldValue, StateUpdate};
use crate::core::types::{Stage, Status};
use crate::io::generator::{GenerationRequest, Generator};
use crate::io::prompt::PromptBuilder;

pub mod executor;
pub mod planner;
pub mod schema;
pub mod verifier;

/// Stage failure taxonomy. Rendered into state fields, never returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("Planner error: {0}")]
    PlanningFailed(String),
    #[error("Execution error: {0}")]
    ExecutionFailed(String),
    #[error("Verifier error: {0}")]
    VerificationFailed(String),
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            StageError::PlanningFailed(_) => Stage::Planner,
            StageError::ExecutionFailed(_) => Stage::Executor,
            StageError::VerificationFailed(_) => Stage::Verifier,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            StageError::PlanningFailed(_) => Status::PlanningFailed,
            StageError::ExecutionFailed(_) => Status::ExecutionFailed,
            StageError::VerificationFailed(_) => Status::VerificationFailed,
        }
    }

    /// Failed status plus exactly one retry and one reason. Planner failures
    /// also record the diagnostic as the run's error message.
    pub fn into_update(self) -> StateUpdate {
        let reason = self.to_string();
        let update = StateUpdate::new().status(self.status());
        let update = match self {
            StageError::PlanningFailed(_) => {
                update.with(FieldValue::ErrorMessage(reason.clone()))
            }
            StageError::VerificationFailed(_) => {
                update.with(FieldValue::VerificationPassed(false))
            }
            StageError::ExecutionFailed(_) => update,
        };
        update.retry(reason)
    }
}

/// Per-run context shared by the adapters.
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    pub prompts: &'a PromptBuilder,
    pub deadline: Instant,
    /// Upper bound for one generation call, further capped by `deadline`.
    pub per_call_timeout: Duration,
    /// Emit stage payloads at `info` instead of `debug`.
    pub debug: bool,
}

impl StageContext<'_> {
    /// Call the generator for `stage`. Fails only on service faults,
    /// including an exhausted run budget.
    pub(crate) fn generate<G: Generator + ?Sized>(
        &self,
        generator: &G,
        stage: Stage,
        prompt: String,
        output_schema: &'static str,
    ) -> Result<Value> {
        let request = GenerationRequest {
            stage,
            prompt,
            output_schema,
            timeout: call_timeout(self.deadline, self.per_call_timeout)?,
        };
        generator.generate(&request)
    }

    /// Log a stage payload at the level selected by the per-run debug flag.
    pub(crate) fn payload(&self, stage: Stage, label: &str, payload: &str) {
        if self.debug {
            info!(%stage, label, payload, "stage payload");
        } else {
            debug!(%stage, label, payload, "stage payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_update::apply_update;
    use crate::core::types::WorkflowState;

    #[test]
    fn stage_errors_bump_retries_once() {
        let mut state = WorkflowState::new("q");
        apply_update(
            &mut state,
            StageError::ExecutionFailed("division by zero".to_string()).into_update(),
        )
        .expect("merge");
        assert_eq!(state.status, Status::ExecutionFailed);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.retry_reasons, vec!["Execution error: division by zero"]);
        assert!(state.error_message.is_empty());
    }

    #[test]
    fn planner_errors_set_the_error_message() {
        let mut state = WorkflowState::new("q");
        apply_update(
            &mut state,
            StageError::PlanningFailed("empty plan".to_string()).into_update(),
        )
        .expect("merge");
        assert_eq!(state.status, Status::PlanningFailed);
        assert_eq!(state.error_message, "Planner error: empty plan");
        assert_eq!(state.retry_reasons.len(), 1);
    }

    #[test]
    fn verifier_errors_clear_the_aggregate_verdict() {
        let mut state = WorkflowState::new("q");
        state.verification.passed = true;
        apply_update(
            &mut state,
            StageError::VerificationFailed("bad json".to_string()).into_update(),
        )
        .expect("merge");
        assert!(!state.verification.passed);
        assert_eq!(state.retry_reasons, vec!["Verifier error: bad json"]);
        assert_eq!(StageError::VerificationFailed(String::new()).stage(), Stage::Verifier);
    }
}
