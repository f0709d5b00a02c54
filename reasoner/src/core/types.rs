//! Shared deterministic types for the solver core.
//!
//! These types define stable contracts between the workflow engine, the stage
//! adapters and the finalizer. They do not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Workflow status, updated after every stage attempt.
///
/// `Success` and `Failed` are only ever set by the finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Started,
    Planning,
    Planned,
    PlanningFailed,
    Executing,
    Executed,
    ExecutionFailed,
    Verifying,
    Verified,
    VerificationFailed,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Started => "started",
            Status::Planning => "planning",
            Status::Planned => "planned",
            Status::PlanningFailed => "planning_failed",
            Status::Executing => "executing",
            Status::Executed => "executed",
            Status::ExecutionFailed => "execution_failed",
            Status::Verifying => "verifying",
            Status::Verified => "verified",
            Status::VerificationFailed => "verification_failed",
            Status::Success => "success",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three generation-backed stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planner,
    Executor,
    Verifier,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Executor => "executor",
            Stage::Verifier => "verifier",
        }
    }

    /// Status recorded while the stage is in flight.
    pub fn running_status(self) -> Status {
        match self {
            Stage::Planner => Status::Planning,
            Stage::Executor => Status::Executing,
            Stage::Verifier => Status::Verifying,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered solution plan produced by the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
    pub summary: String,
    /// Coarse problem classification reported by the planner.
    #[serde(default)]
    pub problem_type: String,
    /// Description of the expected answer shape (not the value).
    #[serde(default)]
    pub expected_answer: String,
}

impl Plan {
    /// Render steps as a numbered list for prompts.
    pub fn numbered(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Kind of a verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckName {
    Correctness,
    Consistency,
    Sanity,
    Format,
}

/// Result of a single verification check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: CheckName,
    pub passed: bool,
    pub details: String,
}

/// Verdict returned by the external verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Verification record accumulated over the run.
///
/// `checks` is append-only across loop iterations; every other field is
/// overwritten by the most recent verifier pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub verdict: Option<Verdict>,
    /// Aggregate verdict: external pass AND every local sanity check passed.
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub reasoning: String,
    pub suggested_fix: Option<String>,
    /// Free-form description of what the verifier looked at.
    pub summary: String,
}

/// Value extracted from an executed script.
///
/// `DateTime` and `TimeDelta` carry their display form; they never flow back
/// into a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ResultValue>),
    Tuple(Vec<ResultValue>),
    Dict(Vec<(ResultValue, ResultValue)>),
    DateTime(String),
    TimeDelta(String),
    /// A script value with no data representation (e.g. a capability).
    Opaque(String),
}

impl ResultValue {
    /// Numeric view used by magnitude checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Int(v) => Some(*v as f64),
            ResultValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn fmt_repr(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Str(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Bool(true) => f.write_str("True"),
            ResultValue::Bool(false) => f.write_str("False"),
            ResultValue::Int(v) => write!(f, "{v}"),
            ResultValue::Float(v) => f.write_str(&format_float(*v)),
            ResultValue::Str(s) => f.write_str(s),
            ResultValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt_repr(f)?;
                }
                f.write_str("]")
            }
            ResultValue::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt_repr(f)?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            ResultValue::Dict(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    key.fmt_repr(f)?;
                    f.write_str(": ")?;
                    value.fmt_repr(f)?;
                }
                f.write_str("}")
            }
            ResultValue::DateTime(s) | ResultValue::TimeDelta(s) | ResultValue::Opaque(s) => {
                f.write_str(s)
            }
        }
    }
}

/// Format a float the way the script dialect prints it (`3.0`, `0.5`, `inf`).
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v == v.trunc() && v.abs() < 1e16 {
        return format!("{v:.1}");
    }
    format!("{v}")
}

/// Outcome of one sandbox execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<ResultValue>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn ok(result: Option<ResultValue>) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The single mutable record threaded through a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowState {
    pub question: String,
    pub plan: Plan,
    pub code: String,
    pub execution: ExecutionOutcome,
    /// Short approach explanation supplied alongside the generated code.
    pub solution_reasoning: String,
    /// One line per plan step, reported with the generated code.
    pub intermediate_summary: Vec<String>,
    /// Shape the executor expects the answer to take, e.g. "integer".
    pub answer_format: String,
    pub verification: Verification,
    pub retry_count: u32,
    pub retry_reasons: Vec<String>,
    pub status: Status,
    pub error_message: String,
}

impl WorkflowState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            plan: Plan::default(),
            code: String::new(),
            execution: ExecutionOutcome::default(),
            solution_reasoning: String::new(),
            intermediate_summary: Vec::new(),
            answer_format: String::new(),
            verification: Verification::default(),
            retry_count: 0,
            retry_reasons: Vec::new(),
            status: Status::Started,
            error_message: String::new(),
        }
    }

    /// Candidate answer from the last execution, if any.
    pub fn answer(&self) -> Option<&ResultValue> {
        self.execution.result.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_value_display_matches_script_str() {
        assert_eq!(ResultValue::Int(9).to_string(), "9");
        assert_eq!(ResultValue::Float(3.0).to_string(), "3.0");
        assert_eq!(ResultValue::Float(2.5).to_string(), "2.5");
        assert_eq!(ResultValue::Bool(true).to_string(), "True");
        assert_eq!(
            ResultValue::List(vec![ResultValue::Int(1), ResultValue::Str("a".to_string())])
                .to_string(),
            "[1, 'a']"
        );
        assert_eq!(
            ResultValue::Tuple(vec![ResultValue::Int(1)]).to_string(),
            "(1,)"
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::VerificationFailed).expect("serialize");
        assert_eq!(json, "\"verification_failed\"");
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Verified.is_terminal());
    }

    #[test]
    fn plan_numbered_lists_steps() {
        let plan = Plan {
            steps: vec!["count red".to_string(), "add".to_string()],
            ..Plan::default()
        };
        assert_eq!(plan.numbered(), "1. count red\n2. add");
    }
}
