//! Generation service abstraction.
//!
//! The [`Generator`] trait decouples the stage adapters from the backend that
//! turns a prompt into structured JSON (currently a `codex exec`-style
//! command). Tests use scripted generators that replay canned responses
//! without spawning processes.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Stage;
use crate::io::config::GeneratorConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// One structured generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub stage: Stage,
    pub prompt: String,
    /// JSON Schema (as text) the response must satisfy.
    pub output_schema: &'static str,
    pub timeout: Duration,
}

/// Abstraction over generation backends.
///
/// An `Err` means the service itself failed (unreachable, timed out, crashed)
/// and aborts the run. A response that arrives but is malformed is returned as
/// `Ok` and rejected later by schema validation.
pub trait Generator {
    fn generate(&self, request: &GenerationRequest) -> Result<Value>;
}

/// Generator that spawns a codex-style command per call.
///
/// The command receives `--output-schema <file> --output-last-message <file> -`
/// and the prompt on stdin. Each call gets its own directory under the scratch
/// dir holding the schema, the response and a bounded log.
#[derive(Debug)]
pub struct CommandGenerator {
    command: Vec<String>,
    run_dir: PathBuf,
    output_limit_bytes: usize,
    calls: Cell<u32>,
}

impl CommandGenerator {
    /// Create a generator whose per-call files live under `run_dir`.
    pub fn new(config: &GeneratorConfig, run_dir: PathBuf) -> Self {
        Self {
            command: config.command.clone(),
            run_dir,
            output_limit_bytes: config.output_limit_bytes,
            calls: Cell::new(0),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn next_call_dir(&self, stage: Stage) -> PathBuf {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        self.run_dir.join(format!("{call:03}-{stage}"))
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(stage = %request.stage, timeout_secs = request.timeout.as_secs()))]
    fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        let call_dir = self.next_call_dir(request.stage);
        fs::create_dir_all(&call_dir)
            .with_context(|| format!("create call dir {}", call_dir.display()))?;
        let schema_path = call_dir.join("output.schema.json");
        fs::write(&schema_path, request.output_schema)
            .with_context(|| format!("write schema {}", schema_path.display()))?;
        let output_path = call_dir.join("output.json");
        info!(program = %program, call_dir = %call_dir.display(), "starting generation");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-");

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .context("run generator command")?;

        write_generator_log(
            &call_dir.join("generator.log"),
            &output,
            self.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "generator timed out");
            return Err(anyhow!("generator timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}",
                output.status.code()
            ));
        }

        debug!("generator completed successfully");
        read_output_json(&output_path)
    }
}

fn read_output_json(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(anyhow!("missing generator output {}", path.display()));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read generator output {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_generator_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout.lossy());
    buf.push_str(&output.stdout.notice("generator stdout"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr.lossy());
    buf.push_str(&output.stderr.notice("generator stderr"));
    if output.timed_out {
        buf.push_str("\n[generator timed out]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }

    fs::write(path, buf).with_context(|| format!("write generator log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::Captured;

    fn config(command: &[&str]) -> GeneratorConfig {
        GeneratorConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..GeneratorConfig::default()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            stage: Stage::Planner,
            prompt: "prompt".to_string(),
            output_schema: "{}",
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn empty_command_is_a_service_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = CommandGenerator::new(&config(&[]), temp.path().to_path_buf());
        let err = generator.generate(&request()).expect_err("empty command");
        assert!(err.to_string().contains("generator command is empty"));
    }

    #[test]
    fn missing_program_is_a_service_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = CommandGenerator::new(
            &config(&["definitely-not-a-real-generator-binary"]),
            temp.path().to_path_buf(),
        );
        let err = generator.generate(&request()).expect_err("spawn failure");
        assert!(format!("{err:#}").contains("spawn command"));
    }

    #[cfg(unix)]
    #[test]
    fn command_that_writes_nothing_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = CommandGenerator::new(
            &config(&["sh", "-c", "cat > /dev/null"]),
            temp.path().to_path_buf(),
        );
        let err = generator.generate(&request()).expect_err("no output");
        assert!(err.to_string().contains("missing generator output"));
        let call_dir = temp.path().join("001-planner");
        assert!(call_dir.join("output.schema.json").exists());
        assert!(call_dir.join("generator.log").exists());
    }

    #[test]
    fn log_is_truncated_to_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("generator.log");
        let output = CommandOutput {
            status: std::process::ExitStatus::default(),
            stdout: Captured {
                bytes: vec![b'x'; 500],
                truncated: 0,
            },
            stderr: Captured::default(),
            timed_out: false,
        };
        write_generator_log(&path, &output, 100).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("[truncated"));
        assert!(contents.len() < 200);
    }
}
