//! Solver configuration stored under `.reasoner/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::sandbox::{Isolation, ResourceLimits, Sandbox, ScriptLimits};

/// Stage invocations in one full plan, execute, verify pass.
const FULL_PASS_STEPS: u32 = 3;

/// Below this the child cannot even load its own binary.
const MIN_MEMORY_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Solver configuration (TOML).
///
/// Read-only for the duration of a run. Missing fields fall back to the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SolverConfig {
    /// Stage failures tolerated before escalating to the finalizer.
    pub max_retries: u32,

    /// Hard ceiling on stage invocations per run, independent of retries.
    pub max_iterations: u32,

    /// Longest accepted script, in characters.
    pub max_code_length: usize,

    /// Whole-run wall-clock budget in seconds.
    pub run_timeout_secs: u64,

    pub sandbox: SandboxConfig,

    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Re-execute this binary per script.
    Process,
    /// Run the interpreter on the calling thread.
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolation: IsolationMode,

    /// Wall-clock limit for one script in process isolation.
    pub timeout_secs: u64,

    /// Cap on the child's captured stdout/stderr.
    pub output_limit_bytes: usize,

    /// Evaluation steps per script.
    pub fuel: u64,

    /// Longest string or collection a script may build.
    pub max_collection_len: usize,

    /// Modules scripts may import.
    pub allowed_imports: Vec<String>,

    /// Address-space cap for the sandbox child, in bytes.
    pub memory_limit_bytes: u64,

    /// CPU-time cap for the sandbox child, in seconds.
    pub cpu_limit_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ScriptLimits::default();
        Self {
            isolation: IsolationMode::Process,
            timeout_secs: 10,
            output_limit_bytes: 64 * 1024,
            fuel: limits.fuel,
            max_collection_len: limits.max_collection_len,
            allowed_imports: limits.allowed_imports,
            memory_limit_bytes: ResourceLimits::default().memory_limit_bytes,
            cpu_limit_secs: ResourceLimits::default().cpu_limit_secs,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> ScriptLimits {
        ScriptLimits {
            fuel: self.fuel,
            max_collection_len: self.max_collection_len,
            allowed_imports: self.allowed_imports.clone(),
        }
    }

    pub fn resources(&self) -> ResourceLimits {
        ResourceLimits {
            memory_limit_bytes: self.memory_limit_bytes,
            cpu_limit_secs: self.cpu_limit_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command prefix; the generator appends the schema/output flags and `-`.
    pub command: Vec<String>,

    /// Per-call timeout in seconds, capped by the remaining run budget.
    pub timeout_secs: u64,

    /// Truncate generator stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Prompt size budget in bytes.
    pub prompt_budget_bytes: usize,

    /// Where per-call schemas, responses and logs are written, relative to
    /// the working directory.
    pub scratch_dir: PathBuf,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            timeout_secs: 120,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 24_000,
            scratch_dir: PathBuf::from(".reasoner/scratch"),
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_iterations: 20,
            max_code_length: 2000,
            run_timeout_secs: 10 * 60,
            sandbox: SandboxConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations <= FULL_PASS_STEPS {
            return Err(anyhow!(
                "max_iterations must be > {FULL_PASS_STEPS} (one full plan/execute/verify pass)"
            ));
        }
        if self.max_code_length == 0 {
            return Err(anyhow!("max_code_length must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.fuel == 0 {
            return Err(anyhow!("sandbox.fuel must be > 0"));
        }
        if self.sandbox.max_collection_len == 0 {
            return Err(anyhow!("sandbox.max_collection_len must be > 0"));
        }
        if self.sandbox.memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES {
            return Err(anyhow!(
                "sandbox.memory_limit_bytes must be >= {MIN_MEMORY_LIMIT_BYTES}"
            ));
        }
        if self.sandbox.cpu_limit_secs == 0 {
            return Err(anyhow!("sandbox.cpu_limit_secs must be > 0"));
        }
        if let Some(module) = self
            .sandbox
            .allowed_imports
            .iter()
            .find(|m| !matches!(m.as_str(), "datetime" | "math"))
        {
            return Err(anyhow!(
                "sandbox.allowed_imports: unknown module '{module}' (known: datetime, math)"
            ));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if self.generator.prompt_budget_bytes == 0 {
            return Err(anyhow!("generator.prompt_budget_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator.timeout_secs)
    }

    /// Build the sandbox described by this config. `child_program` is the
    /// binary re-executed for process isolation.
    pub fn sandbox(&self, child_program: &Path) -> Sandbox {
        let isolation = match self.sandbox.isolation {
            IsolationMode::InProcess => Isolation::InProcess,
            IsolationMode::Process => Isolation::ChildProcess {
                program: child_program.to_path_buf(),
                args: vec![crate::sandbox::CHILD_SUBCOMMAND.to_string()],
                timeout: Duration::from_secs(self.sandbox.timeout_secs),
                output_limit_bytes: self.sandbox.output_limit_bytes,
                resources: self.sandbox.resources(),
            },
        };
        Sandbox::new(self.max_code_length, self.sandbox.limits(), isolation)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SolverConfig::default()`.
pub fn load_config(path: &Path) -> Result<SolverConfig> {
    if !path.exists() {
        let cfg = SolverConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SolverConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SolverConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SolverConfig::default());
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_iterations, 20);
        assert_eq!(cfg.max_code_length, 2000);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = SolverConfig {
            max_retries: 5,
            sandbox: SandboxConfig {
                isolation: IsolationMode::InProcess,
                ..SandboxConfig::default()
            },
            ..SolverConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_retries = 1\n[sandbox]\nisolation = \"in_process\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.sandbox.isolation, IsolationMode::InProcess);
        assert_eq!(cfg.sandbox.timeout_secs, 10);
        assert_eq!(cfg.generator, GeneratorConfig::default());
    }

    #[test]
    fn iteration_ceiling_must_cover_a_full_pass() {
        let cfg = SolverConfig {
            max_iterations: 3,
            ..SolverConfig::default()
        };
        let err = cfg.validate().expect_err("too small");
        assert!(err.to_string().contains("max_iterations must be > 3"));
    }

    #[test]
    fn child_resource_limits_are_configurable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[sandbox]\nmemory_limit_bytes = 268435456\ncpu_limit_secs = 3\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(
            cfg.sandbox.resources(),
            ResourceLimits {
                memory_limit_bytes: 256 * 1024 * 1024,
                cpu_limit_secs: 3,
            }
        );

        let mut cfg = SolverConfig::default();
        cfg.sandbox.memory_limit_bytes = 1024;
        let err = cfg.validate().expect_err("too little memory");
        assert!(err.to_string().contains("sandbox.memory_limit_bytes must be >="));
        cfg.sandbox.memory_limit_bytes = MIN_MEMORY_LIMIT_BYTES;
        cfg.sandbox.cpu_limit_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_import_is_rejected() {
        let mut cfg = SolverConfig::default();
        cfg.sandbox.allowed_imports.push("os".to_string());
        let err = cfg.validate().expect_err("os not allowed");
        assert!(err.to_string().contains("unknown module 'os'"));
    }

    #[test]
    fn sandbox_follows_isolation_mode() {
        let mut cfg = SolverConfig::default();
        let sandbox = cfg.sandbox(Path::new("/bin/reasoner"));
        assert_eq!(sandbox.max_code_length(), 2000);
        cfg.sandbox.isolation = IsolationMode::InProcess;
        let outcome = cfg.sandbox(Path::new("/unused")).run("result = 2 ** 10");
        assert!(outcome.success);
    }
}
