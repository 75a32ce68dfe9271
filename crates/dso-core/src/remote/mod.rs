//! Proxying for datasets served by an upstream API.
//!
//! The incoming request is rewritten (path substitution, parameter
//! translation, strict filter pass-through), forwarded with correlation
//! headers, and the response is validated against the table schema before it
//! reaches the caller. Upstream failures map onto local problem+json errors.

mod client;
mod params;
mod validate;

pub use client::{correlation_id, RemoteClient, RemoteRequestContext, RemoteResponse};
pub use params::translate_params;
pub use validate::validate_remote_response;
