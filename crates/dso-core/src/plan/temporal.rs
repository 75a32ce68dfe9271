//! Temporal slice resolution.
//!
//! Every temporal table reached by a query resolves to exactly one "slice":
//! an explicit sequence pin, a validity-dimension date, or the latest version
//! per logical identifier. The same slice applies to the base table, to
//! joined temporal tables and to relation prefetches, so a response never
//! mixes versions.

use dso_error::Result;

use crate::filters::values::{parse_iso_date, parse_integer, DateOrDateTime};
use crate::schema::{Table, Temporal};

use super::{ColumnRef, Predicate, SqlValue};
use crate::schema::to_snake_case;

/// The slice chosen for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum TemporalSlice {
    /// `?volgnummer=X`: pin one sequence number.
    Sequence(i64),

    /// A dimension parameter (`?geldigOp=2021-01-01`): rows whose validity
    /// range contains the value.
    Dimension {
        start_field: String,
        end_field: String,
        value: SqlValue,
    },

    /// No selector present: the greatest sequence per logical identifier.
    Latest,
}

impl TemporalSlice {
    /// Determine the slice from the request's query parameters.
    ///
    /// First match wins: the sequence field name, then any declared
    /// dimension, else latest. Returns `None` for non-temporal tables.
    ///
    /// # Errors
    ///
    /// `InvalidValue` when a selector parameter fails to parse.
    pub fn resolve(table: &Table, raw_pairs: &[(String, String)]) -> Result<Option<Self>> {
        let Some(temporal) = &table.temporal else {
            return Ok(None);
        };

        if let Some((_, value)) = raw_pairs
            .iter()
            .find(|(key, _)| *key == temporal.sequence_field)
        {
            let sequence = parse_integer(value).map_err(|e| with_field(e, &temporal.sequence_field))?;
            return Ok(Some(Self::Sequence(sequence)));
        }

        for (name, dimension) in &temporal.dimensions {
            if let Some((_, value)) = raw_pairs.iter().find(|(key, _)| key == name) {
                let value = match parse_iso_date(value).map_err(|e| with_field(e, name))? {
                    DateOrDateTime::Date(d) => SqlValue::Date(d),
                    DateOrDateTime::DateTime(dt) => SqlValue::DateTime(dt),
                };
                return Ok(Some(Self::Dimension {
                    start_field: dimension.start.clone(),
                    end_field: dimension.end.clone(),
                    value,
                }));
            }
        }

        Ok(Some(Self::Latest))
    }

    /// The WHERE terms pinning `alias` (an occurrence of `table`) to this slice.
    #[must_use]
    pub fn predicates(
        &self,
        alias: &str,
        db_table: &str,
        table: &Table,
        temporal: &Temporal,
    ) -> Vec<Predicate> {
        match self {
            Self::Sequence(sequence) => vec![Predicate::Compare {
                column: ColumnRef::new(alias, to_snake_case(&temporal.sequence_field)),
                op: super::CompareOp::Eq,
                value: SqlValue::Int(*sequence),
                case_insensitive: false,
            }],
            Self::Dimension {
                start_field,
                end_field,
                value,
            } => vec![Predicate::TemporalRange {
                start: ColumnRef::new(alias, to_snake_case(start_field)),
                end: ColumnRef::new(alias, to_snake_case(end_field)),
                value: value.clone(),
            }],
            Self::Latest => vec![Predicate::LatestSequence {
                alias: alias.to_string(),
                db_table: db_table.to_string(),
                identifier: to_snake_case(table.logical_identifier()),
                sequence: to_snake_case(&temporal.sequence_field),
            }],
        }
    }

    /// The slice to apply when traversing into a *related* temporal table.
    ///
    /// A sequence pin only applies to the table it was requested for; related
    /// tables fall back to "latest" so their own versions stay consistent.
    #[must_use]
    pub fn for_related(&self) -> Self {
        match self {
            Self::Dimension { .. } => self.clone(),
            Self::Sequence(_) | Self::Latest => Self::Latest,
        }
    }
}

fn with_field(err: dso_error::ApiError, field: &str) -> dso_error::ApiError {
    match err {
        dso_error::ApiError::InvalidValue { reason, .. } => dso_error::ApiError::InvalidValue {
            field: field.to_string(),
            reason,
        },
        other => other,
    }
}
