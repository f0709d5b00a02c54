//! Validation of structured generation responses.
//!
//! A raw response is checked against the role's JSON Schema, decoded into a
//! typed struct and then checked for semantic problems the schema cannot
//! express. Only a [`Validated`] value may be turned into a state update.

use std::ops::Deref;

use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::Stage;

pub const PLANNER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");
pub const EXECUTOR_OUTPUT_SCHEMA: &str = include_str!("../../schemas/executor_output.schema.json");
pub const VERIFIER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/verifier_output.schema.json");

/// Why a response was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{stage} response failed schema validation: {}", .messages.join("; "))]
    Invalid {
        stage: Stage,
        messages: Vec<String>,
    },
    #[error("{stage} response could not be decoded: {message}")]
    Decode { stage: Stage, message: String },
    #[error("{stage} response rejected: {reason}")]
    Semantic { stage: Stage, reason: String },
}

/// A structured response type with an embedded schema.
pub trait Response: DeserializeOwned {
    const STAGE: Stage;
    const SCHEMA: &'static str;

    /// Checks beyond the schema (blank strings, cross-field rules).
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// A response that passed schema, decoding and semantic checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T>(T);

impl<T> Validated<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Validated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Validate a raw response for `T`'s role.
pub fn validate<T: Response>(response: &Value) -> Result<Validated<T>, SchemaError> {
    let schema: Value =
        serde_json::from_str(T::SCHEMA).expect("embedded output schema should be valid JSON");
    let validator = validator_for(&schema).expect("embedded output schema should compile");
    let messages: Vec<String> = validator
        .iter_errors(response)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(SchemaError::Invalid {
            stage: T::STAGE,
            messages,
        });
    }
    let decoded: T = serde_json::from_value(response.clone()).map_err(|err| SchemaError::Decode {
        stage: T::STAGE,
        message: err.to_string(),
    })?;
    decoded.check().map_err(|reason| SchemaError::Semantic {
        stage: T::STAGE,
        reason,
    })?;
    Ok(Validated(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Plan {
        plan_steps: Vec<String>,
    }

    impl Response for Plan {
        const STAGE: Stage = Stage::Planner;
        const SCHEMA: &'static str = PLANNER_OUTPUT_SCHEMA;

        fn check(&self) -> Result<(), String> {
            if self.plan_steps.iter().any(|s| s.trim().is_empty()) {
                return Err("blank step".to_string());
            }
            Ok(())
        }
    }

    fn planner(steps: Value) -> Value {
        json!({
            "problem_type": "arithmetic",
            "plan_steps": steps,
            "plan_text": "add them",
            "expected_final_answer": "a number"
        })
    }

    #[test]
    fn embedded_schemas_compile() {
        for schema in [
            PLANNER_OUTPUT_SCHEMA,
            EXECUTOR_OUTPUT_SCHEMA,
            VERIFIER_OUTPUT_SCHEMA,
        ] {
            let value: Value = serde_json::from_str(schema).expect("json");
            validator_for(&value).expect("compile");
        }
    }

    #[test]
    fn valid_response_passes() {
        let validated = validate::<Plan>(&planner(json!(["count", "sum"]))).expect("valid");
        assert_eq!(validated.plan_steps.len(), 2);
    }

    #[test]
    fn empty_steps_fail_schema() {
        let err = validate::<Plan>(&planner(json!([]))).expect_err("min items");
        assert!(matches!(err, SchemaError::Invalid { .. }));
        assert!(err.to_string().starts_with("planner response failed schema validation"));
    }

    #[test]
    fn semantic_check_runs_after_schema() {
        let err = validate::<Plan>(&planner(json!(["  "]))).expect_err("blank step");
        assert_eq!(
            err,
            SchemaError::Semantic {
                stage: Stage::Planner,
                reason: "blank step".to_string()
            }
        );
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = validate::<Plan>(&json!({"plan_steps": ["x"]})).expect_err("missing");
        assert!(err.to_string().contains("problem_type"));
    }
}
