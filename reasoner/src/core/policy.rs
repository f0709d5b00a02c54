//! Retry and escalation policy.
//!
//! Decides, after each stage, whether the run advances, loops back to the
//! planner, or escalates to the finalizer. The retry budget is a single
//! counter shared by all three stages.

use serde::Serialize;

use crate::core::types::{Stage, Status, WorkflowState};

/// Next hop chosen after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Planner,
    Executor,
    Verifier,
    Finalizer,
}

impl Route {
    pub fn stage(self) -> Option<Stage> {
        match self {
            Route::Planner => Some(Stage::Planner),
            Route::Executor => Some(Stage::Executor),
            Route::Verifier => Some(Stage::Verifier),
            Route::Finalizer => None,
        }
    }
}

/// Whether the shared retry budget is spent.
pub fn budget_exhausted(state: &WorkflowState, max_retries: u32) -> bool {
    state.retry_count >= max_retries
}

/// Route after the planner: a usable plan goes to the executor, otherwise
/// retry planning until the budget is spent.
pub fn after_planner(state: &WorkflowState, max_retries: u32) -> Route {
    if state.status == Status::Planned {
        Route::Executor
    } else if budget_exhausted(state, max_retries) {
        Route::Finalizer
    } else {
        Route::Planner
    }
}

/// Route after the executor: successful runs are verified; failures loop back
/// to the planner, or skip verification entirely once the budget is spent.
pub fn after_executor(state: &WorkflowState, max_retries: u32) -> Route {
    if state.status == Status::Executed {
        Route::Verifier
    } else if budget_exhausted(state, max_retries) {
        Route::Finalizer
    } else {
        Route::Planner
    }
}

/// Route after the verifier: finish on a passing aggregate verdict or a spent
/// budget, otherwise replan.
pub fn after_verifier(state: &WorkflowState, max_retries: u32) -> Route {
    if state.verification.passed || budget_exhausted(state, max_retries) {
        Route::Finalizer
    } else {
        Route::Planner
    }
}

/// Dispatch to the routing rule of `stage`.
pub fn next_route(stage: Stage, state: &WorkflowState, max_retries: u32) -> Route {
    match stage {
        Stage::Planner => after_planner(state, max_retries),
        Stage::Executor => after_executor(state, max_retries),
        Stage::Verifier => after_verifier(state, max_retries),
    }
}
