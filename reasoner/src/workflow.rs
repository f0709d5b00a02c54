//! Workflow engine: drives planner, executor and verifier over one
//! [`WorkflowState`] until the retry policy routes to the finalizer.
//!
//! Two independent bounds apply. The retry budget is enforced by
//! [`crate::core::policy`]; the iteration ceiling is enforced here and
//! aborts the run.

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::agents::StageContext;
use crate::agents::executor::ExecutorAgent;
use crate::agents::planner::PlannerAgent;
use crate::agents::verifier::VerifierAgent;
use crate::core::invariants::validate_invariants;
use crate::core::policy::{Route, next_route};
use crate::core::state_update::{StateUpdate, apply_update};
use crate::core::types::{Stage, Status, WorkflowState};
use crate::io::config::SolverConfig;
use crate::io::generator::Generator;
use crate::io::prompt::PromptBuilder;
use crate::sandbox::Sandbox;

/// Per-request options, passed explicitly down to the stage adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Log stage payloads at `info` instead of `debug`.
    pub debug: bool,
}

/// One stage invocation, reported to the `on_step` callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// 1-based count of stage invocations in this run.
    pub step: u32,
    pub stage: Stage,
    /// Status after the stage's update was merged.
    pub status: Status,
    pub retry_count: u32,
    pub route: Route,
    pub duration_ms: u64,
}

/// Whole-run aborts. Stage failures never show up here.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("iteration ceiling exceeded: {steps} steps run, max_iterations is {max_iterations}")]
    IterationCeilingExceeded { steps: u32, max_iterations: u32 },
    #[error("generation service failed: {0:#}")]
    Generation(anyhow::Error),
    /// A stage produced an update the engine refuses to merge.
    #[error("state update rejected: {0}")]
    InvalidUpdate(String),
}

/// Stage adapters plus the run bounds, built once per configuration.
#[derive(Debug, Clone)]
pub struct Workflow {
    planner: PlannerAgent,
    executor: ExecutorAgent,
    verifier: VerifierAgent,
    prompts: PromptBuilder,
    max_retries: u32,
    max_iterations: u32,
    run_timeout: Duration,
    call_timeout: Duration,
}

impl Workflow {
    pub fn new(config: &SolverConfig, sandbox: Sandbox) -> Self {
        Self {
            planner: PlannerAgent,
            executor: ExecutorAgent::new(sandbox, config.sandbox.allowed_imports.clone()),
            verifier: VerifierAgent,
            prompts: PromptBuilder::new(config.generator.prompt_budget_bytes),
            max_retries: config.max_retries,
            max_iterations: config.max_iterations,
            run_timeout: config.run_timeout(),
            call_timeout: config.generator_timeout(),
        }
    }

    /// Run stages until the policy routes to the finalizer.
    ///
    /// `state` is left as it was after the last merged update, also on error,
    /// so the caller can still build an aborted output from it.
    pub fn run<G, F>(
        &self,
        state: &mut WorkflowState,
        generator: &G,
        options: RunOptions,
        mut on_step: F,
    ) -> Result<(), WorkflowError>
    where
        G: Generator + ?Sized,
        F: FnMut(&StepRecord),
    {
        let span = info_span!(
            "workflow",
            max_retries = self.max_retries,
            max_iterations = self.max_iterations
        );
        let _guard = span.enter();

        let ctx = StageContext {
            prompts: &self.prompts,
            deadline: Instant::now() + self.run_timeout,
            per_call_timeout: self.call_timeout,
            debug: options.debug,
        };

        let mut steps = 0u32;
        let mut route = Route::Planner;
        while let Some(stage) = route.stage() {
            if steps >= self.max_iterations {
                warn!(steps, max_iterations = self.max_iterations, "iteration ceiling hit");
                return Err(WorkflowError::IterationCeilingExceeded {
                    steps,
                    max_iterations: self.max_iterations,
                });
            }
            steps += 1;
            let started = Instant::now();

            self.merge(state, StateUpdate::new().status(stage.running_status()))?;
            let update = self
                .run_stage(stage, state, generator, &ctx)
                .map_err(WorkflowError::Generation)?;
            self.merge(state, update)?;

            route = next_route(stage, state, self.max_retries);
            let record = StepRecord {
                step: steps,
                stage,
                status: state.status,
                retry_count: state.retry_count,
                route,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            info!(
                step = record.step,
                %stage,
                status = %record.status,
                retry_count = record.retry_count,
                route = ?record.route,
                "stage finished"
            );
            on_step(&record);
        }
        debug!(steps, "routed to finalizer");
        Ok(())
    }

    fn run_stage<G: Generator + ?Sized>(
        &self,
        stage: Stage,
        state: &WorkflowState,
        generator: &G,
        ctx: &StageContext<'_>,
    ) -> anyhow::Result<StateUpdate> {
        match stage {
            Stage::Planner => self.planner.run(state, generator, ctx),
            Stage::Executor => self.executor.run(state, generator, ctx),
            Stage::Verifier => self.verifier.run(state, generator, ctx),
        }
    }

    fn merge(&self, state: &mut WorkflowState, update: StateUpdate) -> Result<(), WorkflowError> {
        apply_update(state, update).map_err(|err| WorkflowError::InvalidUpdate(err.to_string()))?;
        let errors = validate_invariants(state, false);
        if !errors.is_empty() {
            return Err(WorkflowError::InvalidUpdate(errors.join("; ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::IsolationMode;
    use crate::test_support::{
        ScriptedGenerator, ScriptedReply, executor_response, planner_response, verifier_response,
    };
    use std::path::Path;

    fn workflow(max_retries: u32, max_iterations: u32) -> Workflow {
        let mut config = SolverConfig {
            max_retries,
            max_iterations,
            ..SolverConfig::default()
        };
        config.sandbox.isolation = IsolationMode::InProcess;
        let sandbox = config.sandbox(Path::new("/unused"));
        Workflow::new(&config, sandbox)
    }

    type Run = (WorkflowState, Vec<StepRecord>, Result<(), WorkflowError>);

    fn run(workflow: &Workflow, generator: &ScriptedGenerator) -> Run {
        let mut state = WorkflowState::new("How many apples?");
        let mut records = Vec::new();
        let result = workflow.run(&mut state, generator, RunOptions::default(), |record| {
            records.push(record.clone());
        });
        (state, records, result)
    }

    #[test]
    fn happy_path_takes_three_steps() {
        let generator = ScriptedGenerator::new(vec![
            planner_response(&["red = 3", "green = 2 * red", "sum"]),
            executor_response("red = 3\ngreen = 2 * red\nresult = red + green"),
            verifier_response("pass", None),
        ]);
        let (state, records, result) = run(&workflow(3, 20), &generator);
        result.expect("completed");
        assert_eq!(state.status, Status::Verified);
        assert!(state.verification.passed);
        let stages: Vec<Stage> = records.iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![Stage::Planner, Stage::Executor, Stage::Verifier]);
        assert_eq!(records.last().map(|r| r.route), Some(Route::Finalizer));
        assert_eq!(records[0].step, 1);
    }

    #[test]
    fn execution_failure_loops_back_to_planner() {
        let generator = ScriptedGenerator::new(vec![
            planner_response(&["divide"]),
            executor_response("result = 1 / 0"),
            planner_response(&["add instead"]),
            executor_response("result = 4 + 5"),
            verifier_response("pass", None),
        ]);
        let (state, records, result) = run(&workflow(3, 20), &generator);
        result.expect("completed");
        assert_eq!(records.len(), 5);
        assert_eq!(records[1].route, Route::Planner);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.retry_reasons.len(), 1);
        assert!(state.verification.passed);
        // The second planner call saw the failure as feedback.
        assert!(generator.requests()[2].prompt.contains("division by zero"));
    }

    #[test]
    fn exhausted_budget_skips_the_verifier() {
        let generator = ScriptedGenerator::new(vec![
            planner_response(&["divide"]),
            executor_response("result = 1 / 0"),
        ]);
        let (state, records, result) = run(&workflow(1, 20), &generator);
        result.expect("completed");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].route, Route::Finalizer);
        assert_eq!(state.status, Status::ExecutionFailed);
        assert_eq!(generator.remaining(), 0);
    }

    #[test]
    fn iteration_ceiling_aborts_the_run() {
        let replies: Vec<_> = (0..10)
            .flat_map(|_| {
                [
                    planner_response(&["divide"]),
                    executor_response("result = 1 / 0"),
                ]
            })
            .collect();
        let generator = ScriptedGenerator::new(replies);
        let (state, records, result) = run(&workflow(100, 5), &generator);
        match result {
            Err(WorkflowError::IterationCeilingExceeded { steps, max_iterations }) => {
                assert_eq!(steps, 5);
                assert_eq!(max_iterations, 5);
            }
            other => panic!("expected ceiling abort, got {other:?}"),
        }
        assert_eq!(records.len(), 5);
        assert_eq!(state.retry_reasons.len() as u32, state.retry_count);
    }

    #[test]
    fn service_fault_aborts_with_state_intact() {
        let generator = ScriptedGenerator::with_replies(vec![
            ScriptedReply::Response(planner_response(&["count"])),
            ScriptedReply::Fault("connection refused".to_string()),
        ]);
        let (state, records, result) = run(&workflow(3, 20), &generator);
        let err = result.expect_err("service fault");
        assert!(matches!(err, WorkflowError::Generation(_)));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(records.len(), 1);
        assert_eq!(state.status, Status::Executing);
        assert_eq!(state.plan.steps, vec!["count"]);
    }
}
