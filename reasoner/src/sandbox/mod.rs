//! Restricted execution of generated scripts.
//!
//! Scripts are written in a small Python-flavoured dialect and run by an
//! in-crate interpreter that only knows the allow-listed builtins and the
//! pre-injected `datetime`, `timedelta` and `math` capabilities. Nothing in
//! the dialect can reach files, the network, the environment or the process.
//!
//! With [`Isolation::ChildProcess`] the interpreter additionally runs in a
//! re-executed copy of the binary, so the parent can enforce a wall-clock
//! timeout and survive a crash. The child caps its own address space and CPU
//! time before it reads the script.

pub mod ast;
pub mod builtins;
pub mod error;
pub mod extract;
pub mod format;
pub mod interp;
pub mod lexer;
pub mod ops;
pub mod parser;
pub mod time;
pub mod value;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::{ExecutionOutcome, ResultValue};
use crate::io::process::run_command_with_timeout;

pub use error::{Fault, ScriptError};
pub use extract::{RESULT_NAME, extract_result};
pub use interp::ScriptLimits;

/// Name of the hidden CLI subcommand that serves one child request.
pub const CHILD_SUBCOMMAND: &str = "sandbox-child";

/// Where the interpreter runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Directly on the calling thread. Bounded by fuel only.
    InProcess,
    /// In a child process started as `program args...`, fed a
    /// [`ChildRequest`] on stdin.
    ChildProcess {
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
        output_limit_bytes: usize,
        resources: ResourceLimits,
    },
}

/// OS limits a sandbox child sets on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address-space cap (`RLIMIT_AS`).
    pub memory_limit_bytes: u64,
    /// CPU-time cap (`RLIMIT_CPU`); the kernel kills the child past it.
    pub cpu_limit_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_limit_secs: 10,
        }
    }
}

impl ResourceLimits {
    /// Apply to the current process. Irreversible: only call in a child.
    #[cfg(unix)]
    pub fn apply(&self) -> std::io::Result<()> {
        use rlimit::Resource;
        rlimit::setrlimit(Resource::AS, self.memory_limit_bytes, self.memory_limit_bytes)?;
        rlimit::setrlimit(Resource::CPU, self.cpu_limit_secs, self.cpu_limit_secs)?;
        debug!(
            memory_limit_bytes = self.memory_limit_bytes,
            cpu_limit_secs = self.cpu_limit_secs,
            "sandbox child limits applied"
        );
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply(&self) -> std::io::Result<()> {
        warn!("resource limits are not supported on this platform");
        Ok(())
    }
}

/// Sandbox executor: length pre-check, then a contained run.
#[derive(Debug, Clone)]
pub struct Sandbox {
    max_code_length: usize,
    limits: ScriptLimits,
    isolation: Isolation,
}

impl Sandbox {
    pub fn new(max_code_length: usize, limits: ScriptLimits, isolation: Isolation) -> Self {
        Self {
            max_code_length,
            limits,
            isolation,
        }
    }

    /// In-process sandbox with default limits.
    pub fn in_process(max_code_length: usize) -> Self {
        Self::new(max_code_length, ScriptLimits::default(), Isolation::InProcess)
    }

    pub fn max_code_length(&self) -> usize {
        self.max_code_length
    }

    /// Run `code` and report `{success, result, error}`. Never panics on
    /// script input and never returns an `Err`: every fault is folded into the
    /// outcome.
    #[instrument(skip_all, fields(code_chars = code.chars().count()))]
    pub fn run(&self, code: &str) -> ExecutionOutcome {
        let length = code.chars().count();
        if length > self.max_code_length {
            let err = ScriptError::LengthExceeded {
                length,
                limit: self.max_code_length,
            };
            debug!(%err, "rejected before execution");
            return ExecutionOutcome::failed(err.to_string());
        }
        match &self.isolation {
            Isolation::InProcess => run_script(code, &self.limits),
            Isolation::ChildProcess {
                program,
                args,
                timeout,
                output_limit_bytes,
                resources,
            } => {
                let request = ChildRequest {
                    code: code.to_string(),
                    limits: self.limits.clone(),
                    resources: Some(*resources),
                };
                match run_in_child(program, args, *timeout, *output_limit_bytes, &request) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(err = %format!("{err:#}"), "sandbox child failed");
                        ExecutionOutcome::failed(format!("sandbox process failed: {err:#}"))
                    }
                }
            }
        }
    }
}

/// Parse, run and extract in the current process.
pub fn run_script(code: &str, limits: &ScriptLimits) -> ExecutionOutcome {
    match execute(code, limits) {
        Ok(result) => ExecutionOutcome::ok(result),
        Err(err) => {
            debug!(%err, "script failed");
            ExecutionOutcome::failed(err.to_string())
        }
    }
}

fn execute(code: &str, limits: &ScriptLimits) -> Result<Option<ResultValue>, ScriptError> {
    let program = parser::parse(code, limits.max_collection_len)?;
    let namespace = interp::run(&program, limits)?;
    Ok(extract_result(code, &namespace))
}

/// Request sent to a sandbox child on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub code: String,
    pub limits: ScriptLimits,
    /// Applied to the serving process before the script is parsed.
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
}

/// Child side of the protocol: read one request, write one outcome.
pub fn serve_child(input: impl Read, mut output: impl Write) -> Result<()> {
    let request: ChildRequest =
        serde_json::from_reader(input).context("parse sandbox request")?;
    if let Some(resources) = &request.resources {
        resources
            .apply()
            .context("apply sandbox resource limits")?;
    }
    let outcome = run_script(&request.code, &request.limits);
    serde_json::to_writer(&mut output, &outcome).context("write sandbox outcome")?;
    output.flush().context("flush sandbox outcome")?;
    Ok(())
}

#[instrument(skip_all, fields(program = %program.display(), timeout_secs = timeout.as_secs()))]
fn run_in_child(
    program: &Path,
    args: &[String],
    timeout: Duration,
    output_limit_bytes: usize,
    request: &ChildRequest,
) -> Result<ExecutionOutcome> {
    let payload = serde_json::to_vec(request).context("serialize sandbox request")?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .current_dir(std::env::temp_dir());
    let output = run_command_with_timeout(cmd, Some(&payload), timeout, output_limit_bytes)?;

    if output.timed_out {
        return Ok(ExecutionOutcome::failed(format!(
            "execution timed out after {}s",
            timeout.as_secs()
        )));
    }
    if !output.status.success() {
        return Ok(ExecutionOutcome::failed(format!(
            "sandbox process exited with {}: {}",
            output.status,
            output.stderr.lossy().trim()
        )));
    }
    if output.stdout.truncated > 0 {
        return Ok(ExecutionOutcome::failed(format!(
            "sandbox output exceeded {output_limit_bytes} bytes"
        )));
    }
    serde_json::from_slice(&output.stdout.bytes).context("parse sandbox outcome")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::in_process(2_000)
    }

    #[test]
    fn explicit_result_is_returned() {
        let outcome = sandbox().run("x = 2\nresult = x + 3");
        assert_eq!(outcome, ExecutionOutcome::ok(Some(ResultValue::Int(5))));
    }

    #[test]
    fn last_assignment_is_the_fallback() {
        let outcome = sandbox().run("a = 1\nx = 7\n# done\n");
        assert_eq!(outcome, ExecutionOutcome::ok(Some(ResultValue::Int(7))));
    }

    #[test]
    fn no_binding_is_a_soft_success() {
        let outcome = sandbox().run("1 + 1\n");
        assert_eq!(outcome, ExecutionOutcome::ok(None));
    }

    #[test]
    fn runtime_fault_is_contained() {
        let outcome = sandbox().run("result = 1 / 0");
        assert!(!outcome.success);
        assert!(outcome.result.is_none());
        assert!(
            outcome
                .error
                .as_deref()
                .expect("error message")
                .contains("division by zero")
        );
    }

    #[test]
    fn host_access_is_contained() {
        for code in [
            "result = open('/etc/passwd').read()",
            "print('hi')",
            "import os\nresult = os.getcwd()",
            "result = __import__('os')",
            "result = eval('1 + 1')",
            "def f():\n    return 1\n",
        ] {
            let outcome = sandbox().run(code);
            assert!(!outcome.success, "{code} should fail");
            assert!(outcome.error.is_some(), "{code} should report an error");
        }
    }

    #[test]
    fn over_length_code_never_runs() {
        let sandbox = Sandbox::in_process(10);
        // Would otherwise fail with a division fault.
        let outcome = sandbox.run("result = 1 / 0");
        assert!(!outcome.success);
        let error = outcome.error.expect("error message");
        assert!(error.contains("length exceeded"), "{error}");
    }

    #[test]
    fn length_is_measured_in_characters() {
        let code = "s = 'ééé'";
        assert_eq!(code.chars().count(), 9);
        let outcome = Sandbox::in_process(9).run(code);
        assert!(outcome.success, "{outcome:?}");
    }

    #[test]
    fn oversized_results_fail_instead_of_expanding() {
        for code in [
            "result = [[0] * 99999] * 99999",
            "a = [1]\nfor i in range(50):\n    a = [a, a]\nresult = a",
            "a = [1]\nfor i in range(50):\n    a = [a, a]\nresult = str(a)",
        ] {
            let outcome = sandbox().run(code);
            assert!(!outcome.success, "{code:?}");
            let error = outcome.error.expect("error message");
            assert!(error.contains("exceeds the sandbox size limit"), "{error}");
        }
    }

    #[test]
    fn aliased_mutation_fails_loudly() {
        let outcome = sandbox().run("a = [1]\nb = a\nb.append(2)\nresult = a");
        assert!(!outcome.success);
        assert!(
            outcome
                .error
                .as_deref()
                .expect("error message")
                .contains("copy it first")
        );
        let outcome = sandbox().run("d = {'x': []}\nd['x'].append(3)\nresult = d['x'][0]");
        assert_eq!(outcome, ExecutionOutcome::ok(Some(ResultValue::Int(3))));
    }

    #[test]
    fn time_arithmetic_works() {
        let code = "start = datetime.strptime('09:30', '%H:%M')\nend = start + timedelta(hours=2, minutes=45)\nresult = end.strftime('%H:%M')";
        let outcome = sandbox().run(code);
        assert_eq!(
            outcome,
            ExecutionOutcome::ok(Some(ResultValue::Str("12:15".to_string())))
        );
    }

    #[test]
    fn serve_child_round_trips_one_request() {
        let request = ChildRequest {
            code: "result = sum(range(5))".to_string(),
            limits: ScriptLimits::default(),
            resources: None,
        };
        let input = serde_json::to_vec(&request).expect("serialize");
        let mut output = Vec::new();
        serve_child(input.as_slice(), &mut output).expect("serve");
        let outcome: ExecutionOutcome = serde_json::from_slice(&output).expect("parse");
        assert_eq!(outcome, ExecutionOutcome::ok(Some(ResultValue::Int(10))));
    }
}
