//! Finalizer: turns a terminal workflow state into the user-facing result.
//!
//! Pure functions only; no further generation or sandbox calls happen here.

use serde::{Deserialize, Serialize};

use crate::core::types::{CheckResult, Status, WorkflowState};

const GENERIC_SUCCESS: &str = "Solution verified successfully";
const GENERIC_FAILURE: &str = "Unable to solve the problem after multiple attempts";

/// User-facing status. Never one of the intermediate workflow statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Success,
    Failed,
}

impl FinalStatus {
    pub fn as_status(self) -> Status {
        match self {
            FinalStatus::Success => Status::Success,
            FinalStatus::Failed => Status::Failed,
        }
    }
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The control loop reached the finalizer normally.
    Completed,
    /// The whole-run step ceiling was hit; fatal abort.
    IterationCeiling,
    /// The generation service (or other orchestration plumbing) failed.
    ServiceError,
}

/// Output contract handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutput {
    pub answer: Option<String>,
    pub status: FinalStatus,
    pub reasoning: String,
    pub plan: String,
    pub checks: Vec<CheckResult>,
    pub retries: u32,
    pub code: String,
    pub termination: Termination,
}

/// Decide the final status and user-facing reasoning for a normally
/// terminated run.
pub fn finalize(state: &WorkflowState) -> SolveOutput {
    let (status, reasoning) = if state.verification.passed {
        (FinalStatus::Success, success_reasoning(state))
    } else {
        (FinalStatus::Failed, failure_reasoning(state))
    };
    build_output(state, status, reasoning, Termination::Completed)
}

/// Build the output for a run that was aborted before reaching the finalizer.
///
/// The answer is always withheld and the abort diagnostic becomes the
/// reasoning.
pub fn finalize_aborted(state: &WorkflowState, termination: Termination, message: &str) -> SolveOutput {
    let mut output = build_output(
        state,
        FinalStatus::Failed,
        format!("Error: {message}"),
        termination,
    );
    output.answer = None;
    output
}

fn success_reasoning(state: &WorkflowState) -> String {
    first_non_blank(&[
        state.solution_reasoning.as_str(),
        state.verification.reasoning.as_str(),
    ])
        .unwrap_or(GENERIC_SUCCESS)
        .to_string()
}

/// Failure cascade: verifier reasoning, fatal error, last retry reason,
/// solution reasoning, generic message.
fn failure_reasoning(state: &WorkflowState) -> String {
    if !state.verification.reasoning.trim().is_empty() {
        return format!(
            "Unable to verify the solution. {}",
            state.verification.reasoning.trim()
        );
    }
    if !state.error_message.trim().is_empty() {
        return format!("Error: {}", state.error_message.trim());
    }
    if let Some(last) = state.retry_reasons.last() {
        return format!("Failed after retries. Last reason: {last}");
    }
    if !state.solution_reasoning.trim().is_empty() {
        return format!(
            "Solution attempted but verification failed. {}",
            state.solution_reasoning.trim()
        );
    }
    GENERIC_FAILURE.to_string()
}

fn first_non_blank<'a>(candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn build_output(
    state: &WorkflowState,
    status: FinalStatus,
    reasoning: String,
    termination: Termination,
) -> SolveOutput {
    SolveOutput {
        answer: state.answer().map(ToString::to_string),
        status,
        reasoning,
        plan: state.plan.summary.clone(),
        checks: state.verification.checks.clone(),
        retries: state.retry_count,
        code: state.code.clone(),
        termination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionOutcome, ResultValue};

    fn failed_state() -> WorkflowState {
        let mut state = WorkflowState::new("q");
        state.status = Status::VerificationFailed;
        state
    }

    #[test]
    fn success_prefers_solution_reasoning() {
        let mut state = WorkflowState::new("q");
        state.verification.passed = true;
        state.verification.reasoning = "verifier says ok".to_string();
        state.solution_reasoning = "added the apples".to_string();
        state.execution = ExecutionOutcome::ok(Some(ResultValue::Int(9)));

        let output = finalize(&state);
        assert_eq!(output.status, FinalStatus::Success);
        assert_eq!(output.reasoning, "added the apples");
        assert_eq!(output.answer.as_deref(), Some("9"));
        assert_eq!(output.termination, Termination::Completed);
    }

    #[test]
    fn success_falls_back_to_verifier_then_generic() {
        let mut state = WorkflowState::new("q");
        state.verification.passed = true;
        state.verification.reasoning = "checks out".to_string();
        assert_eq!(finalize(&state).reasoning, "checks out");

        state.verification.reasoning.clear();
        assert_eq!(finalize(&state).reasoning, GENERIC_SUCCESS);
    }

    #[test]
    fn failure_cascade_follows_priority() {
        let mut state = failed_state();
        state.solution_reasoning = "tried".to_string();
        state.retry_reasons.push("Execution error: boom".to_string());
        state.retry_count = 1;
        state.error_message = "planner broke".to_string();
        state.verification.reasoning = "answer is off".to_string();

        assert_eq!(
            finalize(&state).reasoning,
            "Unable to verify the solution. answer is off"
        );

        state.verification.reasoning.clear();
        assert_eq!(finalize(&state).reasoning, "Error: planner broke");

        state.error_message.clear();
        assert_eq!(
            finalize(&state).reasoning,
            "Failed after retries. Last reason: Execution error: boom"
        );

        state.retry_reasons.clear();
        assert_eq!(
            finalize(&state).reasoning,
            "Solution attempted but verification failed. tried"
        );

        state.solution_reasoning.clear();
        assert_eq!(finalize(&state).reasoning, GENERIC_FAILURE);
    }

    #[test]
    fn output_status_is_never_intermediate() {
        let output = finalize(&failed_state());
        assert_eq!(output.status, FinalStatus::Failed);
        let json = serde_json::to_value(&output).expect("json");
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn aborted_output_withholds_answer() {
        let mut state = failed_state();
        state.execution = ExecutionOutcome::ok(Some(ResultValue::Int(3)));
        let output = finalize_aborted(&state, Termination::IterationCeiling, "ceiling hit");

        assert_eq!(output.answer, None);
        assert_eq!(output.status, FinalStatus::Failed);
        assert_eq!(output.reasoning, "Error: ceiling hit");
        assert_eq!(output.termination, Termination::IterationCeiling);
    }
}
