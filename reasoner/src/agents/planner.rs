//! Planner stage: question in, ordered plan out.

use anyhow::Result;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::agents::schema::{PLANNER_OUTPUT_SCHEMA, Response, validate};
use crate::agents::{StageContext, StageError};
use crate::core::state_update::{FieldValue, StateUpdate};
use crate::core::types::{Plan, Stage, Status, WorkflowState};
use crate::io::generator::Generator;
use crate::io::prompt::PlannerInputs;

/// Structured planner response.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerResponse {
    pub problem_type: String,
    pub plan_steps: Vec<String>,
    pub plan_text: String,
    pub expected_final_answer: String,
}

impl Response for PlannerResponse {
    const STAGE: Stage = Stage::Planner;
    const SCHEMA: &'static str = PLANNER_OUTPUT_SCHEMA;

    fn check(&self) -> Result<(), String> {
        if self.plan_steps.iter().all(|step| step.trim().is_empty()) {
            return Err("plan_steps is empty".to_string());
        }
        Ok(())
    }
}

impl PlannerResponse {
    fn into_plan(self) -> Plan {
        Plan {
            steps: self
                .plan_steps
                .into_iter()
                .map(|step| step.trim().to_string())
                .filter(|step| !step.is_empty())
                .collect(),
            summary: self.plan_text.trim().to_string(),
            problem_type: self.problem_type,
            expected_answer: self.expected_final_answer.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlannerAgent;

impl PlannerAgent {
    /// Produce a plan, or a planning failure. Retry feedback from the previous
    /// attempt is fed back into the prompt.
    #[instrument(skip_all, fields(retry_count = state.retry_count))]
    pub fn run<G: Generator + ?Sized>(
        &self,
        state: &WorkflowState,
        generator: &G,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate> {
        let prompt = ctx.prompts.planner(&PlannerInputs {
            question: &state.question,
            feedback: state.retry_reasons.last().map(String::as_str),
            attempt: state.retry_count,
        })?;
        let response = ctx.generate(generator, Stage::Planner, prompt, PLANNER_OUTPUT_SCHEMA)?;

        let plan = match validate::<PlannerResponse>(&response) {
            Ok(validated) => validated.into_inner().into_plan(),
            Err(err) => {
                warn!(%err, "planner response rejected");
                return Ok(StageError::PlanningFailed(err.to_string()).into_update());
            }
        };
        ctx.payload(Stage::Planner, "plan", &plan.numbered());
        Ok(StateUpdate::new()
            .with(FieldValue::Plan(plan))
            .status(Status::Planned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_update::apply_update;
    use crate::io::prompt::PromptBuilder;
    use crate::test_support::{ScriptedGenerator, context, planner_response};
    use serde_json::json;

    #[test]
    fn valid_plan_is_recorded() {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(vec![planner_response(&[" count ", "sum"])]);
        let mut state = WorkflowState::new("How many?");
        let update = PlannerAgent
            .run(&state, &generator, &context(&prompts))
            .expect("no service fault");
        apply_update(&mut state, update).expect("merge");
        assert_eq!(state.status, Status::Planned);
        assert_eq!(state.plan.steps, vec!["count", "sum"]);
        assert_eq!(state.plan.problem_type, "arithmetic");
        assert_eq!(state.retry_count, 0);
    }

    #[test]
    fn blank_plan_is_a_planning_failure() {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(vec![planner_response(&["   "])]);
        let mut state = WorkflowState::new("q");
        let update = PlannerAgent
            .run(&state, &generator, &context(&prompts))
            .expect("no service fault");
        apply_update(&mut state, update).expect("merge");
        assert_eq!(state.status, Status::PlanningFailed);
        assert_eq!(state.retry_count, 1);
        assert!(state.retry_reasons[0].starts_with("Planner error:"));
        assert!(state.error_message.contains("plan_steps is empty"));
    }

    #[test]
    fn malformed_response_is_a_planning_failure() {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(vec![json!({"plan": "just add"})]);
        let update = PlannerAgent
            .run(&WorkflowState::new("q"), &generator, &context(&prompts))
            .expect("no service fault");
        assert_eq!(update.status_value(), Some(Status::PlanningFailed));
    }

    #[test]
    fn retry_reason_is_fed_back() {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(vec![planner_response(&["x"])]);
        let mut state = WorkflowState::new("q");
        state.retry_count = 1;
        state.retry_reasons = vec!["Execution error: division by zero".to_string()];
        PlannerAgent
            .run(&state, &generator, &context(&prompts))
            .expect("run");
        let requests = generator.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].stage, Stage::Planner);
        assert!(requests[0].prompt.contains("division by zero"));
    }

    #[test]
    fn service_fault_propagates() {
        let prompts = PromptBuilder::new(10_000);
        let generator = ScriptedGenerator::new(Vec::new());
        let err = PlannerAgent
            .run(&WorkflowState::new("q"), &generator, &context(&prompts))
            .expect_err("exhausted script");
        assert!(err.to_string().contains("no scripted response"));
    }
}
