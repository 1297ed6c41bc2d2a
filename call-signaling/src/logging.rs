//! Logging setup
//!
//! The library itself only emits `tracing` events. Applications embedding
//! it can call [`init_tracing`] to get the same output format the rest of
//! the services use.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `call_signaling=<default_level>,info`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("call_signaling={},info", default_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
