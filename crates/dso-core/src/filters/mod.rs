//! Query-string filter handling.
//!
//! Splits into three layers: lexing the raw query keys ([`parser`]), strict
//! conversion of raw values to typed values ([`values`]), and the per-type
//! lookup whitelist ([`lookups`]). The lowering to SQL predicates lives in
//! [`crate::plan`].

pub mod lookups;
pub mod parser;
pub mod values;

pub use lookups::{allowed_lookups, validate_lookup, Lookup};
pub use parser::{parse_query, strip_lookup, FilterInput, RESERVED_PARAMS};
pub use values::{parse_point, parse_scalar, DateOrDateTime, ParsedValue};
