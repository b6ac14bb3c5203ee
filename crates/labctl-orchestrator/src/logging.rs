//! Tracing subscriber setup.

use labctl_core::config::env_vars;
use tracing_subscriber::EnvFilter;

/// Whether `LABCTL_LOG_JSON` asks for JSON output.
pub fn json_requested() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

/// Filter from `RUST_LOG`, falling back to `labctl=info` (or debug when verbose).
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("labctl={level}"))
            .add_directive(tracing::Level::WARN.into())
    })
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(json: bool, verbose: bool) {
    let filter = env_filter(verbose);
    let result = if json {
        // Production/container format
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
