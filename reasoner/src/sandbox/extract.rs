//! Picks the answer out of a finished script's namespace.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ResultValue;
use crate::sandbox::interp::Namespace;

/// Name a script binds to report its answer explicitly.
pub const RESULT_NAME: &str = "result";

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*(?::[^=]*)?(?:\*\*|//|[-+*/%])?=(?:[^=]|$)")
        .expect("assignment pattern is valid")
});

/// Result of a successful run.
///
/// A `result` binding wins. Otherwise the source is scanned from the last line
/// upwards, skipping blanks and comments, and the first assignment whose
/// target is bound supplies the value. No match is still a success with no
/// result.
pub fn extract_result(code: &str, namespace: &Namespace) -> Option<ResultValue> {
    if let Some(value) = namespace.get(RESULT_NAME) {
        return value.to_result();
    }
    code.lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| ASSIGNMENT.captures(line))
        .find_map(|caps| namespace.get(&caps[1]))
        .and_then(|value| value.to_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::value::Value;

    fn namespace(pairs: &[(&str, Value)]) -> Namespace {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn explicit_result_wins() {
        let ns = namespace(&[("result", Value::Int(5)), ("x", Value::Int(7))]);
        assert_eq!(extract_result("x = 7\nresult = 5", &ns), Some(ResultValue::Int(5)));
    }

    #[test]
    fn falls_back_to_last_assignment() {
        let ns = namespace(&[("a", Value::Int(1)), ("x", Value::Int(7))]);
        assert_eq!(extract_result("a = 1\nx = 7\n", &ns), Some(ResultValue::Int(7)));
    }

    #[test]
    fn trailing_comment_is_skipped() {
        let ns = namespace(&[("x", Value::Int(7))]);
        let code = "x = 7\n# total = x * 2\n\n";
        assert_eq!(extract_result(code, &ns), Some(ResultValue::Int(7)));
    }

    #[test]
    fn comparisons_are_not_assignments() {
        let ns = namespace(&[("x", Value::Int(7)), ("y", Value::Int(1))]);
        let code = "y = 1\nx = 7\nx == 7";
        assert_eq!(extract_result(code, &ns), Some(ResultValue::Int(7)));
        let code = "x = 7\ny = 1\nif x >= 3:\n    pass";
        assert_eq!(extract_result(code, &ns), Some(ResultValue::Int(1)));
    }

    #[test]
    fn augmented_and_annotated_targets_count() {
        let ns = namespace(&[("total", Value::Int(12))]);
        assert_eq!(
            extract_result("total: int = 2\ntotal += 10", &ns),
            Some(ResultValue::Int(12))
        );
    }

    #[test]
    fn unbound_targets_keep_scanning() {
        let ns = namespace(&[("x", Value::Int(3))]);
        let code = "x = 3\nd['k'] = 1\na, b = 1, 2";
        assert_eq!(extract_result(code, &ns), Some(ResultValue::Int(3)));
    }

    #[test]
    fn nothing_found_is_none() {
        assert_eq!(extract_result("1 + 1", &Namespace::new()), None);
    }
}
