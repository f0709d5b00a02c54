//! Stable exit codes for reasoner CLI commands.

use crate::core::finalize::{FinalStatus, SolveOutput, Termination};

/// Solved and verified, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid config, arguments or other setup errors.
pub const INVALID: i32 = 1;
/// The run completed but the answer could not be verified (or, for `exec`,
/// the script failed).
pub const FAILED: i32 = 2;
/// The run was aborted: iteration ceiling or generation service fault.
pub const ABORTED: i32 = 3;

/// Exit code for a finished solve.
pub fn for_output(output: &SolveOutput) -> i32 {
    match (output.status, output.termination) {
        (FinalStatus::Success, _) => OK,
        (FinalStatus::Failed, Termination::Completed) => FAILED,
        (FinalStatus::Failed, _) => ABORTED,
    }
}
