//! Verified word-problem solver.
//!
//! A question goes through a plan → execute → verify loop with a bounded,
//! shared retry budget. Plans, scripts and verdicts come from a structured
//! generation service; scripts run in a restricted sandbox; answers are
//! gated by deterministic sanity checks. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state merge, routing policy,
//!   sanity checks, finalizer). No I/O, fully testable in isolation.
//! - **[`sandbox`]**: The script interpreter and its isolation modes.
//! - **[`agents`]**: Stage adapters that turn generation responses into
//!   validated state updates.
//! - **[`io`]**: Side-effecting operations (config, generation service,
//!   child processes, prompts, transcript).
//!
//! [`workflow`] drives the stages over one state and [`solve`] wraps a run
//! into the user-facing output.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod sandbox;
pub mod solve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
