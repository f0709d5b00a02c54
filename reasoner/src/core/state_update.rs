//! Partial state updates and the per-field merge table.
//!
//! Stage adapters never mutate [`WorkflowState`] directly. They return a
//! [`StateUpdate`] (a list of field values) and the engine folds it into the
//! state with [`apply_update`], using [`MERGE_TABLE`] to decide whether each
//! field is overwritten, summed or appended.

use thiserror::Error;

use crate::core::types::{
    CheckResult, ExecutionOutcome, Plan, Status, Verdict, WorkflowState,
};

/// Identifies a mergeable [`WorkflowState`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Plan,
    Code,
    Execution,
    SolutionReasoning,
    IntermediateSummary,
    AnswerFormat,
    Verdict,
    VerificationPassed,
    VerificationReasoning,
    SuggestedFix,
    VerificationSummary,
    Checks,
    RetryCount,
    RetryReasons,
    Status,
    ErrorMessage,
}

impl Field {
    pub const ALL: [Field; 16] = [
        Field::Plan,
        Field::Code,
        Field::Execution,
        Field::SolutionReasoning,
        Field::IntermediateSummary,
        Field::AnswerFormat,
        Field::Verdict,
        Field::VerificationPassed,
        Field::VerificationReasoning,
        Field::SuggestedFix,
        Field::VerificationSummary,
        Field::Checks,
        Field::RetryCount,
        Field::RetryReasons,
        Field::Status,
        Field::ErrorMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Plan => "plan",
            Field::Code => "code",
            Field::Execution => "execution",
            Field::SolutionReasoning => "solution_reasoning",
            Field::IntermediateSummary => "intermediate_summary",
            Field::AnswerFormat => "answer_format",
            Field::Verdict => "verdict",
            Field::VerificationPassed => "verification_passed",
            Field::VerificationReasoning => "verification_reasoning",
            Field::SuggestedFix => "suggested_fix",
            Field::VerificationSummary => "verification_summary",
            Field::Checks => "checks",
            Field::RetryCount => "retry_count",
            Field::RetryReasons => "retry_reasons",
            Field::Status => "status",
            Field::ErrorMessage => "error_message",
        }
    }
}

/// How an incoming value combines with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Last writer wins.
    Overwrite,
    /// Incoming value is added to the stored value.
    Sum,
    /// Incoming sequence is appended, preserving order.
    Append,
}

/// Merge discipline for every field. Retry accounting and checks are run-wide
/// running totals; everything else is last-writer-wins.
pub const MERGE_TABLE: [(Field, MergeRule); 16] = [
    (Field::Plan, MergeRule::Overwrite),
    (Field::Code, MergeRule::Overwrite),
    (Field::Execution, MergeRule::Overwrite),
    (Field::SolutionReasoning, MergeRule::Overwrite),
    (Field::IntermediateSummary, MergeRule::Overwrite),
    (Field::AnswerFormat, MergeRule::Overwrite),
    (Field::Verdict, MergeRule::Overwrite),
    (Field::VerificationPassed, MergeRule::Overwrite),
    (Field::VerificationReasoning, MergeRule::Overwrite),
    (Field::SuggestedFix, MergeRule::Overwrite),
    (Field::VerificationSummary, MergeRule::Overwrite),
    (Field::Checks, MergeRule::Append),
    (Field::RetryCount, MergeRule::Sum),
    (Field::RetryReasons, MergeRule::Append),
    (Field::Status, MergeRule::Overwrite),
    (Field::ErrorMessage, MergeRule::Overwrite),
];

/// Look up the merge rule for `field`.
pub fn merge_rule(field: Field) -> Option<MergeRule> {
    MERGE_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == field)
        .map(|(_, rule)| *rule)
}

/// A single field value carried by a partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Plan(Plan),
    Code(String),
    Execution(ExecutionOutcome),
    SolutionReasoning(String),
    IntermediateSummary(Vec<String>),
    AnswerFormat(String),
    Verdict(Option<Verdict>),
    VerificationPassed(bool),
    VerificationReasoning(String),
    SuggestedFix(Option<String>),
    VerificationSummary(String),
    Checks(Vec<CheckResult>),
    RetryCount(u32),
    RetryReasons(Vec<String>),
    Status(Status),
    ErrorMessage(String),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Plan(_) => Field::Plan,
            FieldValue::Code(_) => Field::Code,
            FieldValue::Execution(_) => Field::Execution,
            FieldValue::SolutionReasoning(_) => Field::SolutionReasoning,
            FieldValue::IntermediateSummary(_) => Field::IntermediateSummary,
            FieldValue::AnswerFormat(_) => Field::AnswerFormat,
            FieldValue::Verdict(_) => Field::Verdict,
            FieldValue::VerificationPassed(_) => Field::VerificationPassed,
            FieldValue::VerificationReasoning(_) => Field::VerificationReasoning,
            FieldValue::SuggestedFix(_) => Field::SuggestedFix,
            FieldValue::VerificationSummary(_) => Field::VerificationSummary,
            FieldValue::Checks(_) => Field::Checks,
            FieldValue::RetryCount(_) => Field::RetryCount,
            FieldValue::RetryReasons(_) => Field::RetryReasons,
            FieldValue::Status(_) => Field::Status,
            FieldValue::ErrorMessage(_) => Field::ErrorMessage,
        }
    }
}

/// Partial update returned by a stage: the subset of fields it wants to change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    values: Vec<FieldValue>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: FieldValue) -> Self {
        self.values.push(value);
        self
    }

    pub fn status(self, status: Status) -> Self {
        self.with(FieldValue::Status(status))
    }

    /// Record one stage failure: bump the retry counter by exactly one and log
    /// exactly one reason.
    pub fn retry(self, reason: impl Into<String>) -> Self {
        self.with(FieldValue::RetryCount(1))
            .with(FieldValue::RetryReasons(vec![reason.into()]))
    }

    /// Append every value of `other`, keeping its order.
    pub fn extend(mut self, other: StateUpdate) -> Self {
        self.values.extend(other.values);
        self
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Status carried by this update, if any (last one wins).
    pub fn status_value(&self) -> Option<Status> {
        self.values.iter().rev().find_map(|value| match value {
            FieldValue::Status(status) => Some(*status),
            _ => None,
        })
    }
}

/// Reasons an update cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("no merge rule for field '{}'", .0.as_str())]
    NoRule(Field),
    #[error("merge rule {rule:?} does not apply to field '{}'", .field.as_str())]
    RuleMismatch { field: Field, rule: MergeRule },
    #[error("retry_count overflow")]
    Overflow,
}

/// Fold `update` into `state`, field by field, following [`MERGE_TABLE`].
///
/// Returns the fields that were touched, in application order.
pub fn apply_update(state: &mut WorkflowState, update: StateUpdate) -> Result<Vec<Field>, MergeError> {
    let mut touched = Vec::with_capacity(update.values.len());
    for value in update.values {
        let field = value.field();
        let rule = merge_rule(field).ok_or(MergeError::NoRule(field))?;
        match value {
            FieldValue::Plan(v) => merge_scalar(&mut state.plan, v, field, rule)?,
            FieldValue::Code(v) => merge_scalar(&mut state.code, v, field, rule)?,
            FieldValue::Execution(v) => merge_scalar(&mut state.execution, v, field, rule)?,
            FieldValue::SolutionReasoning(v) => {
                merge_scalar(&mut state.solution_reasoning, v, field, rule)?;
            }
            FieldValue::IntermediateSummary(v) => {
                merge_list(&mut state.intermediate_summary, v, field, rule)?;
            }
            FieldValue::AnswerFormat(v) => {
                merge_scalar(&mut state.answer_format, v, field, rule)?;
            }
            FieldValue::Verdict(v) => {
                merge_scalar(&mut state.verification.verdict, v, field, rule)?;
            }
            FieldValue::VerificationPassed(v) => {
                merge_scalar(&mut state.verification.passed, v, field, rule)?;
            }
            FieldValue::VerificationReasoning(v) => {
                merge_scalar(&mut state.verification.reasoning, v, field, rule)?;
            }
            FieldValue::SuggestedFix(v) => {
                merge_scalar(&mut state.verification.suggested_fix, v, field, rule)?;
            }
            FieldValue::VerificationSummary(v) => {
                merge_scalar(&mut state.verification.summary, v, field, rule)?;
            }
            FieldValue::Checks(v) => merge_list(&mut state.verification.checks, v, field, rule)?,
            FieldValue::RetryCount(v) => merge_count(&mut state.retry_count, v, field, rule)?,
            FieldValue::RetryReasons(v) => merge_list(&mut state.retry_reasons, v, field, rule)?,
            FieldValue::Status(v) => merge_scalar(&mut state.status, v, field, rule)?,
            FieldValue::ErrorMessage(v) => merge_scalar(&mut state.error_message, v, field, rule)?,
        }
        touched.push(field);
    }
    Ok(touched)
}

fn merge_scalar<T>(slot: &mut T, value: T, field: Field, rule: MergeRule) -> Result<(), MergeError> {
    match rule {
        MergeRule::Overwrite => {
            *slot = value;
            Ok(())
        }
        MergeRule::Sum | MergeRule::Append => Err(MergeError::RuleMismatch { field, rule }),
    }
}

fn merge_count(slot: &mut u32, value: u32, field: Field, rule: MergeRule) -> Result<(), MergeError> {
    match rule {
        MergeRule::Overwrite => *slot = value,
        MergeRule::Sum => *slot = slot.checked_add(value).ok_or(MergeError::Overflow)?,
        MergeRule::Append => return Err(MergeError::RuleMismatch { field, rule }),
    }
    Ok(())
}

fn merge_list<T>(slot: &mut Vec<T>, value: Vec<T>, field: Field, rule: MergeRule) -> Result<(), MergeError> {
    match rule {
        MergeRule::Overwrite => *slot = value,
        MergeRule::Append => slot.extend(value),
        MergeRule::Sum => return Err(MergeError::RuleMismatch { field, rule }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CheckName;

    fn check(details: &str) -> CheckResult {
        CheckResult {
            name: CheckName::Sanity,
            passed: true,
            details: details.to_string(),
        }
    }

    #[test]
    fn merge_table_covers_every_field_once() {
        for field in Field::ALL {
            let hits = MERGE_TABLE.iter().filter(|(f, _)| *f == field).count();
            assert_eq!(hits, 1, "field {} must have exactly one rule", field.as_str());
        }
    }

    /// Retry counters accumulate across repeated stage failures instead of being reassigned.
    #[test]
    fn retry_count_is_summed_and_reasons_appended() {
        let mut state = WorkflowState::new("q");
        apply_update(&mut state, StateUpdate::new().retry("first")).expect("apply");
        apply_update(&mut state, StateUpdate::new().retry("second")).expect("apply");

        assert_eq!(state.retry_count, 2);
        assert_eq!(state.retry_reasons, vec!["first", "second"]);
    }

    #[test]
    fn scalars_are_last_writer_wins() {
        let mut state = WorkflowState::new("q");
        let update = StateUpdate::new()
            .with(FieldValue::Code("a = 1".to_string()))
            .status(Status::Executed)
            .with(FieldValue::ErrorMessage("old".to_string()));
        apply_update(&mut state, update).expect("apply");

        let update = StateUpdate::new()
            .with(FieldValue::Code("b = 2".to_string()))
            .status(Status::ExecutionFailed)
            .with(FieldValue::ErrorMessage("new".to_string()));
        let touched = apply_update(&mut state, update).expect("apply");

        assert_eq!(state.code, "b = 2");
        assert_eq!(state.status, Status::ExecutionFailed);
        assert_eq!(state.error_message, "new");
        assert_eq!(touched, vec![Field::Code, Field::Status, Field::ErrorMessage]);
    }

    #[test]
    fn a_new_script_replaces_the_step_summary() {
        let mut state = WorkflowState::new("q");
        let summary = |lines: &[&str]| {
            FieldValue::IntermediateSummary(lines.iter().map(ToString::to_string).collect())
        };
        apply_update(&mut state, StateUpdate::new().with(summary(&["a", "b"]))).expect("apply");
        apply_update(
            &mut state,
            StateUpdate::new()
                .with(summary(&["c"]))
                .with(FieldValue::AnswerFormat("integer".to_string())),
        )
        .expect("apply");
        assert_eq!(state.intermediate_summary, vec!["c"]);
        assert_eq!(state.answer_format, "integer");
    }

    #[test]
    fn checks_append_in_order() {
        let mut state = WorkflowState::new("q");
        apply_update(
            &mut state,
            StateUpdate::new().with(FieldValue::Checks(vec![check("one"), check("two")])),
        )
        .expect("apply");
        apply_update(
            &mut state,
            StateUpdate::new().with(FieldValue::Checks(vec![check("three")])),
        )
        .expect("apply");

        let details: Vec<_> = state
            .verification
            .checks
            .iter()
            .map(|c| c.details.as_str())
            .collect();
        assert_eq!(details, vec!["one", "two", "three"]);
    }

    #[test]
    fn mismatched_rule_is_rejected() {
        let mut slot = String::new();
        let err = merge_scalar(&mut slot, "x".to_string(), Field::Code, MergeRule::Sum)
            .expect_err("sum on a string field");
        assert_eq!(
            err,
            MergeError::RuleMismatch {
                field: Field::Code,
                rule: MergeRule::Sum
            }
        );
    }

    #[test]
    fn status_value_reports_last_status() {
        let update = StateUpdate::new()
            .status(Status::Planning)
            .status(Status::Planned);
        assert_eq!(update.status_value(), Some(Status::Planned));
        assert_eq!(StateUpdate::new().status_value(), None);
    }
}
