//! The lookup operators and their per-type whitelist.
//!
//! Preventing a `like` on an integer or a `gt` on a geometry happens here,
//! before any value parsing or SQL generation.

use dso_error::{ApiError, Result};

use crate::schema::{Field, FieldKind};

/// A filter lookup operator, the part between brackets in `field[op]=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lookup {
    /// Plain `field=value`; case-sensitive equality.
    Exact,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    /// Inequality; repeatable, AND-combined.
    Not,
    IsNull,
    IsEmpty,
    /// Wildcard match with `*` and `?`.
    Like,
    /// Geometry point-in-shape, or case-insensitive array superset.
    Contains,
}

impl Lookup {
    /// Parse the bracket content; empty means [`Lookup::Exact`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "" | "exact" => Some(Self::Exact),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "not" => Some(Self::Not),
            "isnull" => Some(Self::IsNull),
            "isempty" => Some(Self::IsEmpty),
            "like" => Some(Self::Like),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }

    /// The query-string spelling; empty for [`Lookup::Exact`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Not => "not",
            Self::IsNull => "isnull",
            Self::IsEmpty => "isempty",
            Self::Like => "like",
            Self::Contains => "contains",
        }
    }

    /// Lookups that may legitimately repeat in the query string.
    #[must_use]
    pub const fn is_multi_value(self) -> bool {
        matches!(self, Self::Not | Self::In)
    }

    /// Lookups whose single value splits on comma.
    #[must_use]
    pub const fn splits_value(self) -> bool {
        matches!(self, Self::In)
    }
}

const COMPARISON_LOOKUPS: &[Lookup] = &[
    Lookup::Exact,
    Lookup::Gte,
    Lookup::Gt,
    Lookup::Lt,
    Lookup::Lte,
    Lookup::In,
    Lookup::Not,
    Lookup::IsNull,
];

const STRING_LOOKUPS: &[Lookup] = &[
    Lookup::Exact,
    Lookup::In,
    Lookup::IsNull,
    Lookup::Not,
    Lookup::IsEmpty,
    Lookup::Like,
];

const POLYGON_LOOKUPS: &[Lookup] = &[Lookup::Exact, Lookup::Contains, Lookup::IsNull, Lookup::Not];

const POINT_LOOKUPS: &[Lookup] = &[Lookup::Exact, Lookup::IsNull, Lookup::Not];

const BOOLEAN_LOOKUPS: &[Lookup] = &[Lookup::Exact, Lookup::IsNull];

const ARRAY_LOOKUPS: &[Lookup] = &[Lookup::Exact, Lookup::Contains];

const IDENTIFIER_LOOKUPS: &[Lookup] = &[Lookup::Exact, Lookup::In, Lookup::Not, Lookup::IsNull];

fn scalar_lookups(kind: FieldKind) -> &'static [Lookup] {
    match kind {
        FieldKind::Boolean => BOOLEAN_LOOKUPS,
        FieldKind::Integer
        | FieldKind::Number
        | FieldKind::Date
        | FieldKind::DateTime
        | FieldKind::Time => COMPARISON_LOOKUPS,
        FieldKind::String | FieldKind::Uri => STRING_LOOKUPS,
        FieldKind::Array => ARRAY_LOOKUPS,
        FieldKind::GeoPoint => POINT_LOOKUPS,
        FieldKind::GeoPolygon | FieldKind::GeoMultiPolygon | FieldKind::GeoOther => {
            POLYGON_LOOKUPS
        }
        FieldKind::Object => &[],
    }
}

/// The lookups allowed on a field, given its type and role.
///
/// Relations and identifier parts accept the identifier set on top of their
/// scalar set; object-typed relation stubs are treated as strings for the
/// deprecated `?temporalRelationId=..` filter.
#[must_use]
pub fn allowed_lookups(field: &Field, is_identifier_part: bool) -> Vec<Lookup> {
    let mut allowed: Vec<Lookup> = if field.is_relation() || is_identifier_part {
        let kind = if field.kind() == FieldKind::Object {
            FieldKind::String
        } else {
            field.kind()
        };
        IDENTIFIER_LOOKUPS
            .iter()
            .chain(scalar_lookups(kind))
            .copied()
            .collect()
    } else {
        scalar_lookups(field.kind()).to_vec()
    };

    allowed.sort_unstable();
    allowed.dedup();
    allowed
}

/// Validate the raw lookup of a filter against a field.
///
/// # Errors
///
/// `UnsupportedLookup` with a message listing the supported lookups.
pub fn validate_lookup(
    field: &Field,
    field_name: &str,
    raw_lookup: &str,
    is_identifier_part: bool,
) -> Result<Lookup> {
    let allowed = allowed_lookups(field, is_identifier_part);
    let lookup = Lookup::parse(raw_lookup);

    match lookup {
        Some(lookup) if allowed.contains(&lookup) => Ok(lookup),
        _ => {
            let possible = allowed
                .iter()
                .map(|l| l.as_str())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            let shown = if raw_lookup.is_empty() {
                "(none)"
            } else {
                raw_lookup
            };
            Err(ApiError::UnsupportedLookup {
                field:   field_name.to_string(),
                message: format!("Lookup not supported: {shown}, supported are: {possible}"),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn field(json: serde_json::Value) -> Field {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_string_allows_like_integer_does_not() {
        let name = field(serde_json::json!({"id": "name", "type": "string"}));
        assert!(validate_lookup(&name, "name", "like", false).is_ok());

        let age = field(serde_json::json!({"id": "age", "type": "integer"}));
        let err = validate_lookup(&age, "age", "like", false).unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedLookup { .. }));
        assert!(err.to_string().contains("supported are:"));
    }

    #[test]
    fn test_boolean_only_exact_and_isnull() {
        let flag = field(serde_json::json!({"id": "flag", "type": "boolean"}));
        assert!(validate_lookup(&flag, "flag", "", false).is_ok());
        assert!(validate_lookup(&flag, "flag", "isnull", false).is_ok());
        assert!(validate_lookup(&flag, "flag", "gt", false).is_err());
    }

    #[test]
    fn test_geometry_lookups() {
        let polygon = field(serde_json::json!({
            "id": "geo", "type": "https://geojson.org/schema/Polygon.json"
        }));
        assert!(validate_lookup(&polygon, "geo", "contains", false).is_ok());

        let point = field(serde_json::json!({
            "id": "geo", "type": "https://geojson.org/schema/Point.json"
        }));
        assert!(validate_lookup(&point, "geo", "contains", false).is_err());
        assert!(validate_lookup(&point, "geo", "isnull", false).is_ok());
    }

    #[test]
    fn test_relation_gains_identifier_lookups() {
        let fk = field(serde_json::json!({
            "id": "cluster", "type": "string", "relation": "afvalwegingen:clusters"
        }));
        let allowed = allowed_lookups(&fk, false);
        assert!(allowed.contains(&Lookup::In));
        assert!(allowed.contains(&Lookup::IsNull));
    }

    #[test]
    fn test_unknown_lookup_is_rejected() {
        let name = field(serde_json::json!({"id": "name", "type": "string"}));
        let err = validate_lookup(&name, "name", "wibble", false).unwrap_err();
        assert!(err.to_string().contains("wibble"));
    }

    #[test]
    fn test_date_time_comparisons() {
        let stamp = field(serde_json::json!({
            "id": "dateAdded", "type": "string", "format": "date-time"
        }));
        for lookup in ["gt", "gte", "lt", "lte", "in", "not", "isnull"] {
            assert!(validate_lookup(&stamp, "dateAdded", lookup, false).is_ok());
        }
        assert!(validate_lookup(&stamp, "dateAdded", "isempty", false).is_err());
    }
}
