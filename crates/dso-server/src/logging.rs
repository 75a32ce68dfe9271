//! Tracing setup for the server binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber.
///
/// `RUST_LOG` controls filtering; audit events live under the
/// `dso_api::audit` target, so `RUST_LOG=dso_api::audit=info` isolates them.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
