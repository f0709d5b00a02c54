//! Test-only helpers: a scripted generator and canned stage responses.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::agents::StageContext;
use crate::io::generator::{GenerationRequest, Generator};
use crate::io::prompt::PromptBuilder;

/// One scripted generator reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Response(Value),
    /// Service fault with the given message.
    Fault(String),
}

/// Generator that replays canned replies in order and records every request.
///
/// Running out of replies is a service fault.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: RefCell<VecDeque<ScriptedReply>>,
    requests: RefCell<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Value>) -> Self {
        Self::with_replies(responses.into_iter().map(ScriptedReply::Response).collect())
    }

    pub fn with_replies(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        self.requests.borrow_mut().push(request.clone());
        match self.replies.borrow_mut().pop_front() {
            Some(ScriptedReply::Response(value)) => Ok(value),
            Some(ScriptedReply::Fault(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response for {}", request.stage)),
        }
    }
}

/// Stage context with a generous deadline and payload logging at `debug`.
pub fn context(prompts: &PromptBuilder) -> StageContext<'_> {
    StageContext {
        prompts,
        deadline: Instant::now() + Duration::from_secs(60),
        per_call_timeout: Duration::from_secs(30),
        debug: false,
    }
}

pub fn planner_response(steps: &[&str]) -> Value {
    json!({
        "problem_type": "arithmetic",
        "plan_steps": steps,
        "plan_text": "Count each kind of item and add them up.",
        "expected_final_answer": "an integer count",
    })
}

pub fn executor_response(code: &str) -> Value {
    json!({
        "code": code,
        "intermediate_summary": ["computed the per-colour counts"],
        "solution_reasoning": "added the counts",
        "answer_format": "integer",
    })
}

/// Verifier response with one correctness check. `verdict` is `pass` or
/// `fail`.
pub fn verifier_response(verdict: &str, suggested_fix: Option<&str>) -> Value {
    let passed = verdict == "pass";
    let reasoning = if passed {
        "The total matches the question"
    } else {
        "The total does not match the question"
    };
    json!({
        "verification": "Recomputed the total from the question.",
        "verdict": verdict,
        "checks": [{
            "check_name": "correctness",
            "passed": passed,
            "details": "recomputed total by hand",
        }],
        "verification_reasoning": reasoning,
        "suggested_fix": suggested_fix,
    })
}
