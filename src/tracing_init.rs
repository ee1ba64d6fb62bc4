//! Tracing initialization for the server and maintenance commands.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber: compact stdout output, `RUST_LOG`
/// respected, `info` otherwise.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}
