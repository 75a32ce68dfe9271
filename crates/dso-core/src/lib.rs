//! # DSO-API Core
//!
//! Core engine for a schema-driven REST/geospatial API gateway.
//!
//! ## Architecture
//!
//! The gateway exposes tabular datasets described by external "Amsterdam
//! Schema" documents as HTTP endpoints conforming to the DSO profile of
//! HAL-JSON. Nothing is generated per dataset: a single schema-interpreting
//! engine carries the schema descriptor alongside each value and switches on
//! it in the planner, serializer and renderers.
//!
//! ### Key components
//!
//! - **Schema**: immutable snapshot of datasets/tables/fields/profiles,
//!   atomically swappable for hot reload
//! - **Auth**: scope evaluation plus profile-based conditional access
//! - **Filters**: query-string lexing and strict value parsing
//! - **Plan**: lowering filters/sort/projection/expansion to a relational
//!   query plan, including temporal slicing
//! - **Db**: parameterized SQL generation and chunked row streaming over a
//!   PostgreSQL pool
//! - **Serialize**: per-table HAL serializer tree with lazy embedding
//! - **Render**: streaming HAL-JSON / CSV / GeoJSON / MVT output
//! - **Remote**: proxying for datasets served by an upstream API
//!
//! ## Request flow
//!
//! ```text
//! HTTP request (+ verified scope set)
//!         ↓
//!   Schema snapshot capture
//!         ↓
//!   Authorization gate ── audit event
//!         ↓
//!   Filter parse → Query plan → Temporal slice
//!         ↓
//!   SQL generation → chunked row stream → prefetch
//!         ↓
//!   Serializer tree → streaming renderer
//! ```

#![forbid(unsafe_code)]
// Missing docs allowed for internal items - public API is fully documented
#![allow(missing_docs)]
#![allow(clippy::cast_possible_truncation)] // Intentional u64->usize casts for page sizes
#![allow(clippy::cast_precision_loss)] // Intentional f64 conversions in tile math
#![allow(clippy::cast_sign_loss)] // COUNT(*) results are never negative

pub mod auth;
pub mod crs;
pub mod db;
pub mod filters;
pub mod plan;
pub mod remote;
pub mod render;
pub mod schema;
pub mod serialize;

// Re-exports for convenience
pub use dso_error::{ApiError, Result};
pub use schema::{SchemaRegistry, SchemaSnapshot};

/// Version of the core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
