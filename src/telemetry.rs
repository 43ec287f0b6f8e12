//! Logging setup for the binary.
//!
//! Events go to stderr so stdout stays reserved for answers and JSON output.
//! The filter comes from `RUST_LOG`, defaulting to this crate at `info`.

use std::io::{self, IsTerminal};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Crate target prefix used for the default filter directive.
pub const TARGET_PREFIX: &str = "survey_qa";

/// Filter used when `RUST_LOG` is unset or unparsable.
pub fn default_filter() -> EnvFilter {
    EnvFilter::new(format!("{TARGET_PREFIX}=info"))
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .compact()
        .try_init();
}
