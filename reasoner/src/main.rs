//! Verified word-problem solver CLI.
//!
//! `solve` runs one question through the plan → execute → verify loop and
//! prints the output JSON; `exec` runs a single script through the sandbox;
//! `init` writes the default config.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use reasoner::exit_codes;
use reasoner::io::config::{IsolationMode, SolverConfig, load_config, write_config};
use reasoner::io::generator::CommandGenerator;
use reasoner::io::transcript::Transcript;
use reasoner::logging;
use reasoner::sandbox::{CHILD_SUBCOMMAND, serve_child};
use reasoner::solve::solve;
use reasoner::workflow::{RunOptions, Workflow};

const DEFAULT_CONFIG: &str = ".reasoner/config.toml";

#[derive(Parser)]
#[command(
    name = "reasoner",
    version,
    about = "Plan, execute and verify answers to word problems"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Solve one question and print the output JSON.
    Solve {
        question: String,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Override `max_retries`.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Override `max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Run scripts on the calling thread instead of a child process.
        #[arg(long)]
        in_process: bool,
        /// Log stage payloads (plan, code, verdict) for this run.
        #[arg(long)]
        debug: bool,
        /// Append per-step records and the output to this JSONL file.
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
    /// Run a script file (or `-` for stdin) through the sandbox.
    Exec {
        file: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        in_process: bool,
    },
    /// Write the default config if missing.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Serve one sandbox request on stdin/stdout.
    #[command(name = CHILD_SUBCOMMAND, hide = true)]
    SandboxChild,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Solve {
            question,
            config,
            max_retries,
            max_iterations,
            in_process,
            debug,
            transcript,
        } => {
            logging::init(debug);
            let mut cfg = load_config(&config)?;
            if let Some(max_retries) = max_retries {
                cfg.max_retries = max_retries;
            }
            if let Some(max_iterations) = max_iterations {
                cfg.max_iterations = max_iterations;
            }
            if in_process {
                cfg.sandbox.isolation = IsolationMode::InProcess;
            }
            cfg.validate().context("invalid command-line overrides")?;
            cmd_solve(&question, &cfg, debug, transcript.as_deref())
        }
        Command::Exec {
            file,
            config,
            in_process,
        } => {
            logging::init(false);
            let mut cfg = load_config(&config)?;
            if in_process {
                cfg.sandbox.isolation = IsolationMode::InProcess;
            }
            cmd_exec(&file, &cfg)
        }
        Command::Init { config, force } => cmd_init(&config, force),
        Command::SandboxChild => {
            serve_child(std::io::stdin().lock(), std::io::stdout().lock())?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_solve(
    question: &str,
    cfg: &SolverConfig,
    debug: bool,
    transcript_path: Option<&Path>,
) -> Result<i32> {
    if question.trim().is_empty() {
        anyhow::bail!("question must not be empty");
    }
    let exe = std::env::current_exe().context("locate reasoner binary")?;
    let workflow = Workflow::new(cfg, cfg.sandbox(&exe));
    let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let generator = CommandGenerator::new(&cfg.generator, cfg.generator.scratch_dir.join(&run_id));

    let mut transcript = transcript_path.map(Transcript::open).transpose()?;
    if let Some(transcript) = transcript.as_mut() {
        transcript.append("question", &QuestionRecord { run_id: &run_id, question })?;
    }

    let output = solve(question, &workflow, &generator, RunOptions { debug }, |record| {
        if let Some(transcript) = transcript.as_mut()
            && let Err(err) = transcript.append("step", record)
        {
            warn!(error = %format!("{err:#}"), "transcript write failed");
        }
    });

    if let Some(transcript) = transcript.as_mut() {
        transcript.append("output", &output)?;
    }
    print_json(&output)?;
    Ok(exit_codes::for_output(&output))
}

#[derive(Serialize)]
struct QuestionRecord<'a> {
    run_id: &'a str,
    question: &'a str,
}

fn cmd_exec(file: &Path, cfg: &SolverConfig) -> Result<i32> {
    let code = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read script from stdin")?;
        buf
    } else {
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?
    };
    let exe = std::env::current_exe().context("locate reasoner binary")?;
    let outcome = cfg.sandbox(&exe).run(&code);
    print_json(&outcome)?;
    Ok(if outcome.success {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &SolverConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    std::io::stdout()
        .lock()
        .write_all(payload.as_bytes())
        .context("write stdout")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_solve_with_overrides() {
        let cli = Cli::parse_from([
            "reasoner",
            "solve",
            "How many apples?",
            "--max-retries",
            "1",
            "--in-process",
            "--debug",
        ]);
        match cli.command {
            Command::Solve {
                question,
                max_retries,
                max_iterations,
                in_process,
                debug,
                transcript,
                config,
            } => {
                assert_eq!(question, "How many apples?");
                assert_eq!(max_retries, Some(1));
                assert_eq!(max_iterations, None);
                assert!(in_process);
                assert!(debug);
                assert!(transcript.is_none());
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
            }
            _ => panic!("expected solve"),
        }
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["reasoner", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_hidden_child_subcommand() {
        let cli = Cli::parse_from(["reasoner", CHILD_SUBCOMMAND]);
        assert!(matches!(cli.command, Command::SandboxChild));
    }
}
