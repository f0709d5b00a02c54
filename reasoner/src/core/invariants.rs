//! Run-level invariants checked after every merged update.

use crate::core::types::{Status, WorkflowState};

/// Check invariants of a workflow state:
/// - one retry reason per recorded failure
/// - terminal statuses are reserved for the finalizer
/// - `verified` implies the aggregate verdict passed
/// - `executed` implies the sandbox run succeeded
///
/// Returns a list of stable error messages (empty on success).
pub fn validate_invariants(state: &WorkflowState, finalized: bool) -> Vec<String> {
    let mut errors = Vec::new();

    if state.retry_reasons.len() != state.retry_count as usize {
        errors.push(format!(
            "retry_reasons has {} entries but retry_count is {}",
            state.retry_reasons.len(),
            state.retry_count
        ));
    }

    if state.status.is_terminal() && !finalized {
        errors.push(format!(
            "status '{}' may only be set by the finalizer",
            state.status
        ));
    }

    if state.status == Status::Verified && !state.verification.passed {
        errors.push("status is verified but aggregate verdict did not pass".to_string());
    }

    if state.status == Status::Executed && !state.execution.success {
        errors.push("status is executed but execution did not succeed".to_string());
    }

    errors
}
