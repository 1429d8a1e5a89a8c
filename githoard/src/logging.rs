//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive, overridable through `RUST_LOG`.
pub const DEFAULT_LOG_FILTER: &str = "githoard=info,githoard_core=info,sqlx=warn";

/// Install the global subscriber. Safe to call once per process.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
