//! Stderr tracing for watching a run without the web UI.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: run progress and diagnostics on stderr,
//!   tuned via `RUST_LOG`. Not persisted, not part of orchestrator product
//!   output.
//!
//! - **Run artifacts (`io/state`)**: `state.json`, `history.log`, and
//!   per-agent logs under the run directory. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter: orchestrator progress at info, dependencies at warn.
///
/// A run spends most of its wall-clock inside child agents whose output goes
/// to the per-agent log files, so stderr stays quiet unless luigi itself has
/// something to say (phase transitions, escalations, retries).
const DEFAULT_DIRECTIVES: &str = "warn,luigi=info";

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides [`DEFAULT_DIRECTIVES`]. Output: stderr, compact,
/// without targets — run ids, candidate ids, and agent ids already travel
/// in the event fields, so module paths are noise here.
///
/// # Example
/// ```bash
/// RUST_LOG=luigi=debug cargo run -- "fix the divide bug"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
