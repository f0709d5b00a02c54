//! Development-time tracing for debugging the solver.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the solve output.
//!
//! - **Run transcript (`io/transcript`)**: Product artifact written only when
//!   `--transcript` is given. Unaffected by `RUST_LOG`.
//!
//! Per-run payload logging (`solve --debug`) is not a global switch: it is
//! carried by `RunOptions` and raises stage payloads to `info`, so it shows up
//! with `RUST_LOG=reasoner=info`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset, or to
/// `reasoner=info` when `debug` is set so stage payloads are visible.
///
/// # Example
/// ```bash
/// RUST_LOG=reasoner=debug cargo run -- solve "How many apples?"
/// ```
pub fn init(debug: bool) {
    let fallback = if debug { "warn,reasoner=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
