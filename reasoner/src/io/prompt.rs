//! Prompt builder for the three generation roles.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{Plan, ResultValue};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const EXECUTOR_TEMPLATE: &str = include_str!("prompts/executor.md");
const VERIFIER_TEMPLATE: &str = include_str!("prompts/verifier.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 5] = ["steps", "reasoning", "expected", "plan", "feedback"];

static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern is valid")
});

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("executor", EXECUTOR_TEMPLATE)
            .expect("executor template should be valid");
        env.add_template("verifier", VERIFIER_TEMPLATE)
            .expect("verifier template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        Ok(self.env.get_template(name)?.render(ctx)?)
    }
}

/// Inputs for the planner prompt.
#[derive(Debug, Clone)]
pub struct PlannerInputs<'a> {
    pub question: &'a str,
    /// Most recent retry reason, so a loop-back is not blind.
    pub feedback: Option<&'a str>,
    /// 1-based attempt that produced `feedback`.
    pub attempt: u32,
}

/// Inputs for the executor prompt.
#[derive(Debug, Clone)]
pub struct ExecutorInputs<'a> {
    pub question: &'a str,
    pub plan: &'a Plan,
    pub max_code_length: usize,
    pub allowed_imports: &'a [String],
}

/// Inputs for the verifier prompt.
#[derive(Debug, Clone)]
pub struct VerifierInputs<'a> {
    pub question: &'a str,
    pub plan: &'a Plan,
    pub code: &'a str,
    pub answer: Option<&'a ResultValue>,
    pub solution_reasoning: &'a str,
    pub intermediate_summary: &'a [String],
    pub answer_format: &'a str,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
/// Empty droppable sections are omitted.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(matches.len());
    for (i, caps) in matches.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[marker.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in [`DROP_ORDER`] until the prompt fits, then
/// truncate the last section if it still does not.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let marker = "\n[truncated]";
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
        last.content.truncate(keep);
        last.content.push_str(marker);
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn join_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds role prompts within a byte budget, dropping less critical sections
/// first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        join_sections(&sections)
    }

    pub fn planner(&self, input: &PlannerInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new().render(
            "planner",
            context! {
                question => input.question.trim(),
                feedback => input.feedback.map(str::trim).filter(|s| !s.is_empty()),
                attempt => input.attempt,
            },
        )?;
        Ok(self.finish(&rendered))
    }

    pub fn executor(&self, input: &ExecutorInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new().render(
            "executor",
            context! {
                question => input.question.trim(),
                plan => input.plan.numbered(),
                expected_answer => (!input.plan.expected_answer.trim().is_empty())
                    .then(|| input.plan.expected_answer.trim()),
                max_code_length => input.max_code_length,
                allowed_imports => if input.allowed_imports.is_empty() {
                    "none".to_string()
                } else {
                    input.allowed_imports.join(", ")
                },
                allows_math => input.allowed_imports.iter().any(|m| m == "math"),
            },
        )?;
        Ok(self.finish(&rendered))
    }

    pub fn verifier(&self, input: &VerifierInputs<'_>) -> Result<String> {
        let answer = input
            .answer
            .map_or_else(|| "None".to_string(), ToString::to_string);
        let rendered = PromptEngine::new().render(
            "verifier",
            context! {
                question => input.question.trim(),
                answer => answer,
                code => input.code,
                plan => input.plan.numbered(),
                reasoning => (!input.solution_reasoning.trim().is_empty())
                    .then(|| input.solution_reasoning.trim()),
                steps => input.intermediate_summary.join("\n"),
                answer_format => input.answer_format.trim(),
            },
        )?;
        Ok(self.finish(&rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan {
            steps: vec!["count red apples".to_string(), "double for green".to_string()],
            summary: "sum both colours".to_string(),
            problem_type: "arithmetic".to_string(),
            expected_answer: "an integer".to_string(),
        }
    }

    #[test]
    fn planner_feedback_is_optional() {
        let builder = PromptBuilder::new(10_000);
        let first = builder
            .planner(&PlannerInputs {
                question: "How many apples?",
                feedback: None,
                attempt: 0,
            })
            .expect("render");
        assert!(first.contains("### Planner Contract"));
        assert!(first.contains("How many apples?"));
        assert!(!first.contains("### Feedback"));

        let retry = builder
            .planner(&PlannerInputs {
                question: "How many apples?",
                feedback: Some("Execution error: division by zero"),
                attempt: 1,
            })
            .expect("render");
        assert!(retry.contains("### Feedback From Attempt 1"));
        assert!(retry.contains("division by zero"));
    }

    #[test]
    fn executor_prompt_lists_plan_and_limits() {
        let imports = vec!["datetime".to_string()];
        let prompt = PromptBuilder::new(10_000)
            .executor(&ExecutorInputs {
                question: "q",
                plan: &plan(),
                max_code_length: 2000,
                allowed_imports: &imports,
            })
            .expect("render");
        assert!(prompt.contains("1. count red apples\n2. double for green"));
        assert!(prompt.contains("under 2000 characters"));
        assert!(prompt.contains("Imports are limited to: datetime."));
        assert!(!prompt.contains("`math`"));
    }

    #[test]
    fn verifier_prompt_orders_sections() {
        let prompt = PromptBuilder::new(10_000)
            .verifier(&VerifierInputs {
                question: "q",
                plan: &plan(),
                code: "result = 9",
                answer: Some(&ResultValue::Int(9)),
                solution_reasoning: "3 + 6",
                intermediate_summary: &["red = 3".to_string(), "green = 6".to_string()],
                answer_format: "integer",
            })
            .expect("render");
        let contract = prompt.find("### Verifier Contract").expect("contract");
        let answer = prompt.find("### Computed Answer\n9").expect("answer");
        let format = prompt.find("Expected format: integer").expect("format");
        let code = prompt.find("result = 9").expect("code");
        let steps = prompt.find("### Solver Steps\nred = 3\ngreen = 6").expect("steps");
        let reasoning = prompt.find("### Solver Reasoning").expect("reasoning");
        assert!(contract < answer && answer < format && format < code);
        assert!(code < steps && steps < reasoning);
    }

    #[test]
    fn missing_answer_renders_as_none() {
        let prompt = PromptBuilder::new(10_000)
            .verifier(&VerifierInputs {
                question: "q",
                plan: &Plan::default(),
                code: "x = 1",
                answer: None,
                solution_reasoning: "",
                intermediate_summary: &[],
                answer_format: "",
            })
            .expect("render");
        assert!(prompt.contains("### Computed Answer\nNone"));
        assert!(!prompt.contains("### Plan"));
        assert!(!prompt.contains("### Solver Steps"));
        assert!(!prompt.contains("Expected format"));
    }

    #[test]
    fn budget_drops_optional_sections_first() {
        let long_reasoning = "because ".repeat(200);
        let prompt = PromptBuilder::new(900)
            .verifier(&VerifierInputs {
                question: "q",
                plan: &plan(),
                code: "result = 9",
                answer: Some(&ResultValue::Int(9)),
                solution_reasoning: &long_reasoning,
                intermediate_summary: &[],
                answer_format: "integer",
            })
            .expect("render");
        assert!(!prompt.contains("### Solver Reasoning"));
        assert!(prompt.contains("### Verifier Contract"));
        assert!(prompt.contains("### Script"));
    }

    #[test]
    fn oversized_required_section_is_truncated() {
        let question = "é".repeat(2_000);
        let prompt = PromptBuilder::new(1_000)
            .planner(&PlannerInputs {
                question: &question,
                feedback: None,
                attempt: 0,
            })
            .expect("render");
        assert!(prompt.ends_with("[truncated]"));
    }
}
