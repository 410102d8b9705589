//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the default directive. Both
//! initializers are safe to call more than once; later calls are no-ops.

use tracing_subscriber::EnvFilter;

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a human readable subscriber, e.g. `init("seacomm_core=info")`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber for log shipping
pub fn init_json(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(default_directive))
        .with_current_span(false)
        .try_init()
        .is_ok()
}
