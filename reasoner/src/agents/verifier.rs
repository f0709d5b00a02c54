//! Verifier stage and the aggregate verdict.

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::agents::schema::{Response, VERIFIER_OUTPUT_SCHEMA, validate};
use crate::agents::{StageContext, StageError};
use crate::core::sanity::run_sanity_checks;
use crate::core::state_update::{FieldValue, StateUpdate};
use crate::core::types::{CheckName, CheckResult, Stage, Status, Verdict, WorkflowState};
use crate::io::generator::Generator;
use crate::io::prompt::VerifierInputs;

const DEFAULT_FIX: &str = "Please review the solution";

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierCheck {
    pub check_name: CheckName,
    pub passed: bool,
    pub details: String,
}

/// Structured verifier response.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierResponse {
    pub verification: String,
    pub verdict: Verdict,
    pub checks: Vec<VerifierCheck>,
    pub verification_reasoning: String,
    pub suggested_fix: Option<String>,
}

impl Response for VerifierResponse {
    const STAGE: Stage = Stage::Verifier;
    const SCHEMA: &'static str = VERIFIER_OUTPUT_SCHEMA;

    fn check(&self) -> Result<(), String> {
        if self.verification.trim().is_empty() {
            return Err("no verification data".to_string());
        }
        if self.checks.is_empty() {
            return Err("no checks reported".to_string());
        }
        if let Some(check) = self.checks.iter().find(|c| c.details.trim().is_empty()) {
            return Err(format!("check {:?} has no details", check.check_name));
        }
        Ok(())
    }
}

/// Retry reason for a failed aggregate verdict.
pub fn retry_reason(reasoning: &str, suggested_fix: Option<&str>) -> String {
    let fix = suggested_fix
        .map(str::trim)
        .filter(|fix| !fix.is_empty())
        .unwrap_or(DEFAULT_FIX);
    format!("{}. {fix}", reasoning.trim()).trim().to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifierAgent;

impl VerifierAgent {
    /// Ask the generator for a verdict, run the local sanity checks and
    /// combine them: the run passes only if the external verdict is `pass`
    /// and every sanity check passed.
    #[instrument(skip_all, fields(retry_count = state.retry_count))]
    pub fn run<G: Generator + ?Sized>(
        &self,
        state: &WorkflowState,
        generator: &G,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate> {
        let prompt = ctx.prompts.verifier(&VerifierInputs {
            question: &state.question,
            plan: &state.plan,
            code: &state.code,
            answer: state.answer(),
            solution_reasoning: &state.solution_reasoning,
            intermediate_summary: &state.intermediate_summary,
            answer_format: &state.answer_format,
        })?;
        let response = ctx.generate(generator, Stage::Verifier, prompt, VERIFIER_OUTPUT_SCHEMA)?;

        let response = match validate::<VerifierResponse>(&response) {
            Ok(validated) => validated.into_inner(),
            Err(err) => {
                warn!(%err, "verifier response rejected");
                return Ok(StageError::VerificationFailed(err.to_string()).into_update());
            }
        };

        let sanity = run_sanity_checks(state.answer());
        let passed = response.verdict == Verdict::Pass && sanity.passed();
        info!(verdict = ?response.verdict, sanity_passed = sanity.passed(), passed, "verification finished");
        ctx.payload(Stage::Verifier, "reasoning", &response.verification_reasoning);

        let mut checks: Vec<CheckResult> = response
            .checks
            .into_iter()
            .map(|check| CheckResult {
                name: check.check_name,
                passed: check.passed,
                details: check.details.trim().to_string(),
            })
            .collect();
        checks.extend(sanity.into_checks());

        let reasoning = response.verification_reasoning.trim().to_string();
        let suggested_fix = response
            .suggested_fix
            .map(|fix| fix.trim().to_string())
            .filter(|fix| !fix.is_empty());
        let mut update = StateUpdate::new()
            .with(FieldValue::Verdict(Some(response.verdict)))
            .with(FieldValue::VerificationPassed(passed))
            .with(FieldValue::VerificationSummary(response.verification.trim().to_string()))
            .with(FieldValue::Checks(checks))
            .with(FieldValue::VerificationReasoning(reasoning.clone()))
            .with(FieldValue::SuggestedFix(suggested_fix.clone()));
        if passed {
            update = update.status(Status::Verified);
        } else {
            update = update
                .status(Status::VerificationFailed)
                .retry(retry_reason(&reasoning, suggested_fix.as_deref()));
        }
        Ok(update)
    }
}
