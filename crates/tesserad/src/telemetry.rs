//! Logging setup for `tesserad`.
//!
//! Human-readable logs go to stderr so that `put` and `get` can write
//! manifest ids and payload bytes to stdout. The filter comes from
//! `RUST_LOG` when set, otherwise from the `[log]` section.

use tracing_subscriber::EnvFilter;

use crate::config::LogSection;

/// Initialize the tracing subscriber.
///
/// Call this once at startup, before any `tracing` events are emitted.
pub fn init(config: &LogSection) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr)
        .init();
}
