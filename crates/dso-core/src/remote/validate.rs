//! Validation of remote responses against the table schema.
//!
//! A remote that returns data not matching its declared schema surfaces as a
//! 502 with the validation details, never as silently wrong data.

use serde_json::Value;

use dso_error::{ApiError, Result};

use crate::schema::{Field, FieldKind, Table};

/// How much of a broken remote payload lands in `x-raw-response`.
const RAW_RESPONSE_LIMIT: usize = 2048;

/// Validate a remote object (or HAL listing) against the table schema.
///
/// # Errors
///
/// A 502 "Invalid remote data" carrying `x-validation-errors` and a
/// truncated `x-raw-response`.
pub fn validate_remote_response(table: &Table, data: &Value) -> Result<()> {
    let mut errors = Vec::new();

    match data {
        Value::Object(map) => {
            if let Some(embedded) = map.get("_embedded").and_then(Value::as_object) {
                // HAL listing: validate every embedded row set.
                for rows in embedded.values() {
                    if let Value::Array(rows) = rows {
                        for row in rows {
                            validate_object(table, row, &mut errors);
                        }
                    }
                }
            } else {
                validate_object(table, data, &mut errors);
            }
        }
        Value::Array(rows) => {
            for row in rows {
                validate_object(table, row, &mut errors);
            }
        }
        other => errors.push(format!("expected an object, got: {}", type_name(other))),
    }

    if errors.is_empty() {
        return Ok(());
    }

    let raw: String = serde_json::to_string(data)
        .unwrap_or_default()
        .chars()
        .take(RAW_RESPONSE_LIMIT)
        .collect();
    Err(ApiError::Remote {
        status: 502,
        title: "Invalid remote data".to_string(),
        code: "bad_gateway".to_string(),
        detail: serde_json::json!({
            "x-validation-errors": errors,
            "x-raw-response": raw,
        }),
    })
}

fn validate_object(table: &Table, data: &Value, errors: &mut Vec<String>) {
    let Some(object) = data.as_object() else {
        errors.push(format!("expected an object, got: {}", type_name(data)));
        return;
    };

    for id_field in &table.identifier {
        let missing = object
            .get(id_field)
            .is_none_or(Value::is_null);
        if missing {
            errors.push(format!("identifier field '{id_field}' is missing"));
        }
    }

    for field in &table.fields {
        let Some(value) = object.get(&field.id) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if !type_matches(field, value) {
            errors.push(format!(
                "field '{}' has type {}, expected {}",
                field.id,
                type_name(value),
                field.field_type
            ));
        }
    }
}

fn type_matches(field: &Field, value: &Value) -> bool {
    match field.kind() {
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Number => value.is_number(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object | FieldKind::GeoPoint | FieldKind::GeoPolygon
        | FieldKind::GeoMultiPolygon | FieldKind::GeoOther => {
            value.is_object() || value.is_string()
        }
        // Strings, dates, times, URIs all arrive as JSON strings.
        _ => value.is_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn table() -> Table {
        serde_json::from_value(serde_json::json!({
            "id": "panden",
            "identifier": ["identificatie"],
            "fields": [
                {"id": "identificatie", "type": "string"},
                {"id": "bouwjaar", "type": "integer"},
                {"id": "status", "type": "string"},
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_object_passes() {
        let data = serde_json::json!({
            "identificatie": "0363100012345678",
            "bouwjaar": 1906,
            "status": "in gebruik",
        });
        assert!(validate_remote_response(&table(), &data).is_ok());
    }

    #[test]
    fn test_missing_identifier_is_502() {
        let data = serde_json::json!({"bouwjaar": 1906});
        let err = validate_remote_response(&table(), &data).unwrap_err();
        match err {
            ApiError::Remote { status, title, detail, .. } => {
                assert_eq!(status, 502);
                assert_eq!(title, "Invalid remote data");
                assert!(detail["x-validation-errors"][0]
                    .as_str()
                    .unwrap()
                    .contains("identificatie"));
                assert!(detail.get("x-raw-response").is_some());
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let data = serde_json::json!({
            "identificatie": "0363100012345678",
            "bouwjaar": "new",
        });
        let err = validate_remote_response(&table(), &data).unwrap_err();
        assert!(err.to_string().contains("Invalid remote data"));
    }

    #[test]
    fn test_hal_listing_rows_are_validated() {
        let data = serde_json::json!({
            "_embedded": {
                "panden": [
                    {"identificatie": "a", "bouwjaar": 1900},
                    {"bouwjaar": 2000},
                ]
            }
        });
        assert!(validate_remote_response(&table(), &data).is_err());
    }
}
