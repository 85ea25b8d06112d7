//! Tracing subscriber setup for the demo.
//!
//! Log levels used by the library:
//! - ERROR: Session torn down by a fatal protocol error
//! - WARN: Retransmissions, dropped links, declined resumes
//! - INFO: Session established, resumed or lost
//! - DEBUG: Per-exchange decisions
//! - TRACE: Raw frame bytes

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Log level can be controlled via the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
