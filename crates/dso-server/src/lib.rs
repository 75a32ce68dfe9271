//! HTTP server for the DSO-API gateway.
//!
//! Wires the core engine behind an Axum router: URL dispatch per the DSO
//! grammar, request extraction (verified scopes, Accept-Crs, format), the
//! problem+json error boundary, and startup/reload of the schema registry.

#![forbid(unsafe_code)]
// Missing docs allowed for internal items - public API is fully documented
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use state::AppState;

/// Build the full application router.
#[must_use]
pub fn build_router(state: AppState) -> axum::Router {
    routes::router(state)
}
