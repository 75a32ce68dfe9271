//! Lexing of query-string keys into filter inputs.
//!
//! Allowed notation: `field.subfield[lookup]=value`. Everything that is not a
//! reserved parameter is a filter.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use dso_error::{ApiError, Result};

// Allow notations: field.subfield[lookup]
static RE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A(?P<path>[\w\-]+(?:\.[\w\-]+)*)(?:\[(?P<lookup>[a-zA-Z0-9_\-]+)\])?\z")
        .expect("valid regex")
});

/// Request parameters that are never filters.
///
/// Except for `page`, the non-underscore-prefixed names exist for backward
/// compatibility.
pub const RESERVED_PARAMS: &[&str] = &[
    "_count",
    "_expand",
    "_expandScope",
    "_fields",
    "fields",
    "_format",
    "format",
    "_pageSize",
    "page_size",
    "page",
    "_sort",
    "sorteer",
];

/// The parsed details of a single filter parameter,
/// for example `?someField[isnull]=false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInput {
    /// The raw query key as written.
    pub key: String,
    /// Dotted path split into segments.
    pub path: Vec<String>,
    /// The lookup between brackets; empty for a plain `field=...` filter.
    pub lookup: String,
    /// All values supplied for this key (a key may repeat in the query).
    pub raw_values: Vec<String>,
}

impl FilterInput {
    /// Parse a single query key.
    ///
    /// # Errors
    ///
    /// `InvalidFilterSyntax` when the key does not match the grammar
    /// (e.g. unmatched brackets).
    pub fn from_parameter(key: &str, raw_values: Vec<String>) -> Result<Self> {
        let captures = RE_KEY.captures(key).ok_or_else(|| {
            ApiError::InvalidFilterSyntax {
                message: format!("Invalid filter: {key}"),
            }
        })?;

        Ok(Self {
            key: key.to_string(),
            path: captures["path"].split('.').map(ToString::to_string).collect(),
            lookup: captures
                .name("lookup")
                .map_or_else(String::new, |m| m.as_str().to_string()),
            raw_values,
        })
    }

    /// The single value, for filters that expect exactly one.
    #[must_use]
    pub fn raw_value(&self) -> &str {
        self.raw_values.first().map_or("", String::as_str)
    }

    /// The first value split on comma, for `in`/array-contains style filters.
    #[must_use]
    pub fn split_values(&self) -> Vec<&str> {
        self.raw_value().split(',').collect()
    }

    /// The dotted path without the lookup suffix.
    #[must_use]
    pub fn path_name(&self) -> String {
        self.path.join(".")
    }
}

/// Translate raw query pairs into filter inputs.
///
/// Reserved parameters are skipped, repeated keys are collapsed into one
/// input carrying all values, and keys are processed in sorted order so
/// error reporting and plan layout are deterministic.
pub fn parse_query(pairs: &[(String, String)]) -> Result<Vec<FilterInput>> {
    let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped.entry(key.as_str()).or_default().push(value.clone());
    }

    let mut filters = Vec::new();
    for (key, values) in grouped {
        if RESERVED_PARAMS.contains(&key) {
            continue;
        }
        filters.push(FilterInput::from_parameter(key, values)?);
    }
    Ok(filters)
}

/// Strip the `[lookup]` suffix from a query key, returning the field part.
///
/// Used for mandatory-filter-set matching, which accepts a present key both
/// with and without its lookup.
#[must_use]
pub fn strip_lookup(key: &str) -> &str {
    key.find('[').map_or(key, |idx| &key[..idx])
}
