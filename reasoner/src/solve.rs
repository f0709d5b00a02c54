//! Top-level solve entry point: one question in, one [`SolveOutput`] out.
//!
//! Every outcome, including aborts and service faults, is turned into an
//! output with a concise reasoning string. Nothing is propagated.

use tracing::{error, info, info_span};

use crate::core::finalize::{SolveOutput, Termination, finalize, finalize_aborted};
use crate::core::types::WorkflowState;
use crate::io::generator::Generator;
use crate::workflow::{RunOptions, StepRecord, Workflow, WorkflowError};

/// Solve `question` with a fresh [`WorkflowState`].
pub fn solve<G, F>(
    question: &str,
    workflow: &Workflow,
    generator: &G,
    options: RunOptions,
    on_step: F,
) -> SolveOutput
where
    G: Generator + ?Sized,
    F: FnMut(&StepRecord),
{
    let span = info_span!("solve", debug = options.debug);
    let _guard = span.enter();

    let mut state = WorkflowState::new(question.trim());
    let output = match workflow.run(&mut state, generator, options, on_step) {
        Ok(()) => finalize(&state),
        Err(err) => {
            error!(error = %err, "run aborted");
            let termination = match &err {
                WorkflowError::IterationCeilingExceeded { .. } => Termination::IterationCeiling,
                WorkflowError::Generation(_) | WorkflowError::InvalidUpdate(_) => {
                    Termination::ServiceError
                }
            };
            finalize_aborted(&state, termination, &err.to_string())
        }
    };
    info!(
        status = ?output.status,
        termination = ?output.termination,
        retries = output.retries,
        "run finished"
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::finalize::FinalStatus;
    use crate::io::config::{IsolationMode, SolverConfig};
    use crate::test_support::{ScriptedGenerator, executor_response, planner_response};
    use std::path::Path;

    fn workflow(config: &SolverConfig) -> Workflow {
        let mut config = config.clone();
        config.sandbox.isolation = IsolationMode::InProcess;
        let sandbox = config.sandbox(Path::new("/unused"));
        Workflow::new(&config, sandbox)
    }

    #[test]
    fn service_fault_becomes_failed_output() {
        let generator = ScriptedGenerator::new(Vec::new());
        let output = solve(
            "q",
            &workflow(&SolverConfig::default()),
            &generator,
            RunOptions::default(),
            |_| {},
        );
        assert_eq!(output.status, FinalStatus::Failed);
        assert_eq!(output.termination, Termination::ServiceError);
        assert!(output.answer.is_none());
        assert!(output.reasoning.starts_with("Error: generation service failed"));
    }

    #[test]
    fn ceiling_abort_is_distinguishable() {
        let config = SolverConfig {
            max_retries: 50,
            max_iterations: 4,
            ..SolverConfig::default()
        };
        let generator = ScriptedGenerator::new(vec![
            planner_response(&["a"]),
            executor_response("result = 1 / 0"),
            planner_response(&["b"]),
            executor_response("result = 1 / 0"),
        ]);
        let output = solve("q", &workflow(&config), &generator, RunOptions::default(), |_| {});
        assert_eq!(output.status, FinalStatus::Failed);
        assert_eq!(output.termination, Termination::IterationCeiling);
        assert_eq!(output.retries, 2);
        assert!(output.reasoning.contains("iteration ceiling exceeded"));
    }
}
