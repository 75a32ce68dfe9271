//! Backend-neutral query planning.
//!
//! The planner lowers parsed query-string input (filters, sort, projection,
//! expansion, pagination) plus the table schema into a [`QueryPlan`]: selected
//! columns, joins, WHERE predicates, ordering and a temporal slice. SQL text
//! is only produced afterwards, by [`sql::SqlGenerator`], and never contains
//! raw user input outside `$n` placeholders.

pub mod lowering;
pub mod sql;
pub mod temporal;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use dso_error::{ApiError, Result};

use crate::filters::{parse_query, FilterInput, ParsedValue};
use crate::schema::FieldKind;

pub use lowering::{Planner, PlannerOptions};
pub use sql::{SqlGenerator, SqlQuery};
pub use temporal::TemporalSlice;

/// A column reference, qualified with its table alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub alias:  String,
    pub column: String,
}

impl ColumnRef {
    #[must_use]
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias:  alias.into(),
            column: column.into(),
        }
    }

    /// Quoted SQL rendering: `"alias"."column"`.
    #[must_use]
    pub fn sql(&self) -> String {
        format!("\"{}\".\"{}\"", self.alias, self.column)
    }
}

/// Comparison operators used in predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A typed SQL parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Time(NaiveTime),
}

impl SqlValue {
    /// Borrow as a `tokio-postgres` parameter.
    #[must_use]
    pub fn as_pg(&self) -> &(dyn tokio_postgres::types::ToSql + Sync) {
        match self {
            Self::Bool(v) => v,
            Self::Int(v) => v,
            Self::Float(v) => v,
            Self::Text(v) => v,
            Self::Date(v) => v,
            Self::DateTime(v) => v,
            Self::Time(v) => v,
        }
    }

    /// Uppercase text values, for case-insensitive comparisons.
    #[must_use]
    pub fn uppercased(&self) -> Self {
        match self {
            Self::Text(v) => Self::Text(v.to_uppercase()),
            other => other.clone(),
        }
    }
}

impl TryFrom<ParsedValue> for SqlValue {
    type Error = ApiError;

    fn try_from(value: ParsedValue) -> Result<Self> {
        Ok(match value {
            ParsedValue::Bool(v) => Self::Bool(v),
            ParsedValue::Int(v) => Self::Int(v),
            ParsedValue::Number(v) => Self::Float(v),
            ParsedValue::Text(v) => Self::Text(v),
            ParsedValue::Date(v) => Self::Date(v),
            ParsedValue::DateTime(v) => Self::DateTime(v),
            ParsedValue::Time(v) => Self::Time(v),
            ParsedValue::Point(..) => {
                return Err(ApiError::internal("point values bind via GeoContains"))
            }
        })
    }
}

/// A single WHERE term. All user data lives in [`SqlValue`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `col op $n`, optionally upper-cased on both sides.
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: SqlValue,
        case_insensitive: bool,
    },

    /// `date(col) op $n`: date-only comparison against a datetime column.
    CompareDate {
        column: ColumnRef,
        op: CompareOp,
        date: NaiveDate,
    },

    /// `(col IS NULL OR col != $n)`, AND-combined per value.
    /// Non-PK string columns compare upper-cased.
    NotEqual {
        column: ColumnRef,
        values: Vec<SqlValue>,
        case_insensitive: bool,
    },

    /// `col IN ($n, ...)`.
    In {
        column: ColumnRef,
        values: Vec<SqlValue>,
    },

    /// `col IS [NOT] NULL`.
    IsNull { column: ColumnRef, negate: bool },

    /// `(col = '') IS [NOT] FALSE`, three-valued-logic aware emptiness.
    /// `empty = true` selects empty-or-null, `false` selects non-empty.
    IsEmpty { column: ColumnRef, empty: bool },

    /// `col LIKE $n` / `UPPER(col) LIKE $n` with the wildcard-escaped pattern.
    Like {
        column: ColumnRef,
        pattern: String,
        case_insensitive: bool,
    },

    /// Case-insensitive array superset:
    /// `(ARRAY(SELECT UPPER(x) FROM unnest(col) AS x)) @> ARRAY[$n, ...]`.
    ArrayContains {
        column: ColumnRef,
        values: Vec<String>,
    },

    /// Point-in-geometry; the point is transformed to the column's SRID.
    GeoContains {
        column: ColumnRef,
        x: f64,
        y: f64,
        srid: i32,
    },

    /// Geometry equality against a point, for `(none)`/`not` on point fields.
    GeoEquals {
        column: ColumnRef,
        x: f64,
        y: f64,
        srid: i32,
        negate: bool,
    },

    /// Whole-array equality: `col = ARRAY[$n, ...]`.
    ArrayEquals {
        column: ColumnRef,
        values: Vec<SqlValue>,
    },

    /// `start <= $n AND (end > $n OR end IS NULL)`: a temporal slice.
    TemporalRange {
        start: ColumnRef,
        end: ColumnRef,
        value: SqlValue,
    },

    /// Pick the greatest sequence per logical identifier:
    /// `(alias.id, alias.seq) IN (SELECT id, MAX(seq) FROM table GROUP BY id)`.
    LatestSequence {
        alias: String,
        db_table: String,
        identifier: String,
        sequence: String,
    },

    /// `(col IS NULL OR <inner>)`: keeps LEFT JOIN semantics when slicing
    /// a joined temporal table.
    OrNull {
        column: ColumnRef,
        inner: Box<Predicate>,
    },
}

/// Join type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

/// One join of the plan. `on` pairs are ANDed `left = right` conditions,
/// supporting composite (identifier, sequence) keys.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub kind: JoinKind,
    pub db_table: String,
    pub alias: String,
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// How a selected column is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectExpr {
    /// The plain column.
    Column,
    /// Geometry rendered as GeoJSON in the response CRS:
    /// `ST_AsGeoJSON(ST_Transform(col, srid))`.
    GeoJson { srid: i32 },
}

/// One column of the SELECT list.
#[derive(Debug, Clone)]
pub struct SelectedColumn {
    /// Schema field id; also the output alias.
    pub field_id: String,
    pub column: ColumnRef,
    pub kind: FieldKind,
    pub expr: SelectExpr,
}

/// Pagination settings of a plan.
#[derive(Debug, Clone)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u64,
    pub page_size: u64,
    pub count_requested: bool,
    /// Disabled for renderers that stream the full cursor (CSV, GeoJSON
    /// without an explicit page size).
    pub enabled: bool,
}

/// The lowered query plan for one table.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub dataset_id: String,
    pub table_id: String,
    pub db_table: String,
    /// Alias of the base table in the FROM clause.
    pub base_alias: String,
    pub selected: Vec<SelectedColumn>,
    /// Snake-cased identifier columns on the base table, for DISTINCT counts.
    pub identifier_columns: Vec<String>,
    pub joins: Vec<JoinSpec>,
    pub where_terms: Vec<Predicate>,
    pub order_by: Vec<(ColumnRef, SortDir)>,
    pub distinct: bool,
    /// Relation field ids to prefetch for `_embedded`.
    pub prefetch: Vec<String>,
    pub temporal: Option<TemporalSlice>,
    pub pagination: Pagination,
}

/// The parsed, renderer-independent query parameters of a request.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filters: Vec<FilterInput>,
    /// Sort entries as written (`-field` descending).
    pub sort: Vec<String>,
    /// `_fields` projection entries as written (`-name` negates).
    pub fields: Option<Vec<String>>,
    pub expand_all: bool,
    pub expand_scope: Vec<String>,
    /// 1-based page number.
    pub page: u64,
    pub page_size: Option<u64>,
    pub count: bool,
    pub format: Option<String>,
    /// All raw pairs, for temporal parameters and remote forwarding.
    pub raw: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse raw query pairs.
    ///
    /// # Errors
    ///
    /// 400-class errors for malformed filters or numeric parameters.
    pub fn parse(pairs: &[(String, String)]) -> Result<Self> {
        let mut params = Self {
            page: 1,
            raw: pairs.to_vec(),
            ..Self::default()
        };

        for (key, value) in pairs {
            match key.as_str() {
                "_sort" | "sorteer" => {
                    params.sort = split_list(value);
                }
                "_fields" | "fields" => {
                    params.fields = Some(split_list(value));
                }
                "_expand" => {
                    params.expand_all = value == "true";
                    if !params.expand_all && value != "false" {
                        return Err(ApiError::InvalidExpand {
                            message: format!(
                                "Only _expand=true|false is allowed, not '{value}'"
                            ),
                        });
                    }
                }
                "_expandScope" => {
                    params.expand_scope = split_list(value);
                }
                "_pageSize" | "page_size" => {
                    params.page_size = Some(parse_positive(key, value)?);
                }
                "page" => {
                    params.page = parse_positive(key, value)?;
                }
                "_count" => {
                    params.count = value == "true";
                }
                "_format" | "format" => {
                    params.format = Some(value.clone());
                }
                _ => {}
            }
        }

        params.filters = parse_query(pairs)?;
        Ok(params)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    let n: u64 = value.parse().map_err(|_| ApiError::InvalidValue {
        field:  key.to_string(),
        reason: format!("Expected a positive number, not '{value}'"),
    })?;
    if n == 0 {
        return Err(ApiError::InvalidValue {
            field:  key.to_string(),
            reason: "Expected a positive number".to_string(),
        });
    }
    Ok(n)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_query_params_parse() {
        let params = QueryParams::parse(&pairs(&[
            ("_sort", "name,-dateAdded"),
            ("_pageSize", "50"),
            ("page", "3"),
            ("_count", "true"),
            ("name[like]", "foo*"),
        ]))
        .unwrap();

        assert_eq!(params.sort, vec!["name", "-dateAdded"]);
        assert_eq!(params.page_size, Some(50));
        assert_eq!(params.page, 3);
        assert!(params.count);
        assert_eq!(params.filters.len(), 1);
    }

    #[test]
    fn test_legacy_parameter_names() {
        let params = QueryParams::parse(&pairs(&[
            ("sorteer", "naam"),
            ("page_size", "5"),
            ("fields", "a,b"),
        ]))
        .unwrap();
        assert_eq!(params.sort, vec!["naam"]);
        assert_eq!(params.page_size, Some(5));
        assert_eq!(params.fields, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_bad_page_size() {
        assert!(QueryParams::parse(&pairs(&[("_pageSize", "zero")])).is_err());
        assert!(QueryParams::parse(&pairs(&[("page", "0")])).is_err());
    }

    #[test]
    fn test_column_ref_sql_is_quoted() {
        assert_eq!(ColumnRef::new("t", "naam").sql(), "\"t\".\"naam\"");
    }
}
