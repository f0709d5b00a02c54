//! Executor stage: plan in, script and sandbox outcome out.

use anyhow::Result;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::agents::schema::{EXECUTOR_OUTPUT_SCHEMA, Response, validate};
use crate::agents::{StageContext, StageError};
use crate::core::state_update::{FieldValue, StateUpdate};
use crate::core::types::{ExecutionOutcome, Stage, Status, WorkflowState};
use crate::io::generator::Generator;
use crate::io::prompt::ExecutorInputs;
use crate::sandbox::Sandbox;

/// Structured executor response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorResponse {
    pub code: String,
    pub intermediate_summary: Vec<String>,
    pub solution_reasoning: String,
    pub answer_format: String,
}

impl Response for ExecutorResponse {
    const STAGE: Stage = Stage::Executor;
    const SCHEMA: &'static str = EXECUTOR_OUTPUT_SCHEMA;
}

/// Strip a surrounding markdown code fence (with or without a language tag).
pub fn strip_code_fences(code: &str) -> &str {
    let trimmed = code.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Failed execution: the outcome is replaced so no earlier answer survives.
fn failure(code: Option<String>, error: String) -> StateUpdate {
    let mut update = StateUpdate::new();
    if let Some(code) = code {
        update = update.with(FieldValue::Code(code));
    }
    update
        .with(FieldValue::Execution(ExecutionOutcome::failed(error.clone())))
        .extend(StageError::ExecutionFailed(error).into_update())
}

#[derive(Debug, Clone)]
pub struct ExecutorAgent {
    sandbox: Sandbox,
    allowed_imports: Vec<String>,
}

impl ExecutorAgent {
    pub fn new(sandbox: Sandbox, allowed_imports: Vec<String>) -> Self {
        Self {
            sandbox,
            allowed_imports,
        }
    }

    /// Generate a script for the current plan and run it in the sandbox.
    #[instrument(skip_all, fields(retry_count = state.retry_count))]
    pub fn run<G: Generator + ?Sized>(
        &self,
        state: &WorkflowState,
        generator: &G,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate> {
        let prompt = ctx.prompts.executor(&ExecutorInputs {
            question: &state.question,
            plan: &state.plan,
            max_code_length: self.sandbox.max_code_length(),
            allowed_imports: &self.allowed_imports,
        })?;
        let response = ctx.generate(generator, Stage::Executor, prompt, EXECUTOR_OUTPUT_SCHEMA)?;

        let response = match validate::<ExecutorResponse>(&response) {
            Ok(validated) => validated.into_inner(),
            Err(err) => {
                warn!(%err, "executor response rejected");
                return Ok(failure(None, err.to_string()));
            }
        };

        let code = strip_code_fences(&response.code).to_string();
        if code.is_empty() {
            return Ok(failure(Some(String::new()), "No code generated".to_string()));
        }
        ctx.payload(Stage::Executor, "code", &code);

        let outcome = self.sandbox.run(&code);
        if !outcome.success {
            let error = outcome.error.unwrap_or_default();
            warn!(%error, "script failed");
            return Ok(failure(Some(code), error));
        }
        if let Some(answer) = &outcome.result {
            ctx.payload(Stage::Executor, "answer", &answer.to_string());
        }
        let summary: Vec<String> = response
            .intermediate_summary
            .iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        ctx.payload(Stage::Executor, "intermediate_summary", &summary.join("\n"));
        Ok(StateUpdate::new()
            .with(FieldValue::Code(code))
            .with(FieldValue::Execution(outcome))
            .with(FieldValue::SolutionReasoning(
                response.solution_reasoning.trim().to_string(),
            ))
            .with(FieldValue::IntermediateSummary(summary))
            .with(FieldValue::AnswerFormat(response.answer_format.trim().to_string()))
            .status(Status::Executed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_update::apply_update;
    use crate::core::types::{Plan, ResultValue};
    use crate::io::prompt::PromptBuilder;
    use crate::test_support::{ScriptedGenerator, context, executor_response};
    use serde_json::json;

    fn agent(max_code_length: usize) -> ExecutorAgent {
        ExecutorAgent::new(
            Sandbox::in_process(max_code_length),
            vec!["datetime".to_string(), "math".to_string()],
        )
    }

    fn planned_state() -> WorkflowState {
        let mut state = WorkflowState::new("Alice has 3 red apples and twice as many green.");
        state.plan = Plan {
            steps: vec!["red = 3".to_string(), "green = 2 * red".to_string()],
            ..Plan::default()
        };
        state.status = Status::Planned;
        state
    }

    fn run(agent: &ExecutorAgent, response: serde_json::Value) -> WorkflowState {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(vec![response]);
        let mut state = planned_state();
        let update = agent
            .run(&state, &generator, &context(&prompts))
            .expect("no service fault");
        apply_update(&mut state, update).expect("merge");
        state
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_code_fences("```\nx = 1\n```\n"), "x = 1");
        assert_eq!(strip_code_fences("  x = 1  "), "x = 1");
        assert_eq!(strip_code_fences("```python```"), "");
    }

    #[test]
    fn successful_script_records_answer() {
        let state = run(
            &agent(2000),
            executor_response("```python\nred = 3\ngreen = red * 2\nresult = red + green\n```"),
        );
        assert_eq!(state.status, Status::Executed);
        assert_eq!(state.answer(), Some(&ResultValue::Int(9)));
        assert_eq!(state.code, "red = 3\ngreen = red * 2\nresult = red + green");
        assert_eq!(state.solution_reasoning, "added the counts");
        assert_eq!(state.intermediate_summary, vec!["computed the per-colour counts"]);
        assert_eq!(state.answer_format, "integer");
        assert_eq!(state.retry_count, 0);
    }

    #[test]
    fn runtime_fault_is_an_execution_failure() {
        let state = run(&agent(2000), executor_response("result = 1 / 0"));
        assert_eq!(state.status, Status::ExecutionFailed);
        assert_eq!(state.retry_count, 1);
        assert!(state.retry_reasons[0].starts_with("Execution error: division by zero"));
        assert!(!state.execution.success);
        assert_eq!(state.code, "result = 1 / 0");
        assert!(state.error_message.is_empty());
    }

    #[test]
    fn over_length_code_fails_without_running() {
        let state = run(&agent(5), executor_response("result = 9"));
        assert_eq!(state.status, Status::ExecutionFailed);
        assert!(state.retry_reasons[0].contains("length exceeded"));
        assert!(state.answer().is_none());
    }

    #[test]
    fn empty_code_is_reported() {
        let state = run(&agent(2000), executor_response("```\n```"));
        assert_eq!(state.status, Status::ExecutionFailed);
        assert_eq!(state.retry_reasons, vec!["Execution error: No code generated"]);
    }

    #[test]
    fn malformed_response_is_an_execution_failure() {
        let state = run(&agent(2000), json!({"code": "result = 1"}));
        assert_eq!(state.status, Status::ExecutionFailed);
        assert_eq!(state.retry_count, 1);
    }

    #[test]
    fn failure_clears_a_previous_answer() {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(vec![executor_response("result = 1 / 0")]);
        let mut state = planned_state();
        state.execution.result = Some(ResultValue::Int(9));
        let update = agent(2000)
            .run(&state, &generator, &context(&prompts))
            .expect("run");
        apply_update(&mut state, update).expect("merge");
        assert!(state.answer().is_none());
    }
}
