//! Deterministic sanity checks over a candidate answer.
//!
//! These run on every verifier pass regardless of the external verdict and
//! individually gate the aggregate verdict.

use crate::core::types::{CheckName, CheckResult, ResultValue};

/// Largest absolute value accepted for a numeric answer.
pub const MAX_MAGNITUDE: f64 = 1_000_000.0;

const ERROR_MARKERS: [&str; 3] = ["error", "exception", "traceback"];

/// Identifies one of the local checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityCheck {
    NotEmpty,
    Magnitude,
    NoErrorText,
}

impl SanityCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            SanityCheck::NotEmpty => "not_empty",
            SanityCheck::Magnitude => "magnitude",
            SanityCheck::NoErrorText => "no_error_text",
        }
    }
}

/// Outcome of all applicable checks, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityReport {
    pub results: Vec<(SanityCheck, CheckResult)>,
}

impl SanityReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|(_, result)| result.passed)
    }

    pub fn get(&self, check: SanityCheck) -> Option<&CheckResult> {
        self.results
            .iter()
            .find(|(kind, _)| *kind == check)
            .map(|(_, result)| result)
    }

    pub fn into_checks(self) -> Vec<CheckResult> {
        self.results.into_iter().map(|(_, result)| result).collect()
    }
}

/// Run the local checks. `not_empty` always runs; `magnitude` only applies to
/// numbers and `no_error_text` only to strings.
pub fn run_sanity_checks(answer: Option<&ResultValue>) -> SanityReport {
    let mut results = vec![(SanityCheck::NotEmpty, not_empty(answer))];

    if let Some(value) = answer.and_then(ResultValue::as_f64) {
        results.push((SanityCheck::Magnitude, magnitude(value)));
    }

    if let Some(ResultValue::Str(text)) = answer {
        results.push((SanityCheck::NoErrorText, no_error_text(text)));
    }

    SanityReport { results }
}

fn not_empty(answer: Option<&ResultValue>) -> CheckResult {
    let empty = match answer {
        None => true,
        Some(ResultValue::Str(text)) => text.trim().is_empty(),
        Some(_) => false,
    };
    if empty {
        sanity(false, "not_empty: answer is empty or missing")
    } else {
        sanity(true, "not_empty: answer is present")
    }
}

fn magnitude(value: f64) -> CheckResult {
    if value.abs() > MAX_MAGNITUDE {
        sanity(
            false,
            &format!("magnitude: {value} is outside the plausible range of +/-1,000,000"),
        )
    } else {
        sanity(true, "magnitude: number is within a plausible range")
    }
}

fn no_error_text(text: &str) -> CheckResult {
    let lower = text.to_lowercase();
    match ERROR_MARKERS.iter().find(|marker| lower.contains(*marker)) {
        Some(marker) => sanity(
            false,
            &format!("no_error_text: answer contains error-like text ('{marker}')"),
        ),
        None => sanity(true, "no_error_text: answer contains no error text"),
    }
}

fn sanity(passed: bool, details: &str) -> CheckResult {
    CheckResult {
        name: CheckName::Sanity,
        passed,
        details: details.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_answer_fails_not_empty_only() {
        let report = run_sanity_checks(None);
        assert!(!report.passed());
        assert_eq!(report.results.len(), 1);
        assert!(!report.get(SanityCheck::NotEmpty).expect("not_empty").passed);
    }

    #[test]
    fn whitespace_string_is_empty() {
        let answer = ResultValue::Str("   ".to_string());
        let report = run_sanity_checks(Some(&answer));
        assert!(!report.get(SanityCheck::NotEmpty).expect("not_empty").passed);
        assert!(report.get(SanityCheck::NoErrorText).expect("no_error").passed);
    }

    #[test]
    fn large_number_fails_magnitude() {
        let answer = ResultValue::Int(2_000_000);
        let report = run_sanity_checks(Some(&answer));
        assert!(!report.passed());
        assert!(!report.get(SanityCheck::Magnitude).expect("magnitude").passed);
        assert!(report.get(SanityCheck::NotEmpty).expect("not_empty").passed);
    }

    #[test]
    fn negative_boundary_is_inclusive() {
        let answer = ResultValue::Float(-1_000_000.0);
        assert!(run_sanity_checks(Some(&answer)).passed());
    }

    #[test]
    fn error_text_fails_case_insensitively() {
        let answer = ResultValue::Str("Error: divide by zero".to_string());
        let report = run_sanity_checks(Some(&answer));
        assert!(!report.passed());
        let check = report.get(SanityCheck::NoErrorText).expect("no_error");
        assert!(!check.passed);
        assert!(check.details.contains("error"));
        assert!(report.get(SanityCheck::Magnitude).is_none());
    }

    #[test]
    fn plain_integer_passes_everything() {
        let answer = ResultValue::Int(9);
        let report = run_sanity_checks(Some(&answer));
        assert!(report.passed());
        assert_eq!(report.results.len(), 2);
        assert!(
            report
                .clone()
                .into_checks()
                .iter()
                .all(|c| c.name == CheckName::Sanity && !c.details.is_empty())
        );
    }
}
