//! The per-request authorization gate.
//!
//! Runs before query planning: table-level access, then per-filter field
//! access. Emits one structured audit event per request regardless of the
//! outcome.

use serde::Serialize;
use uuid::Uuid;

use dso_error::{ApiError, Result};

use crate::filters::FilterInput;
use crate::schema::{Dataset, SchemaSnapshot, Table};

use super::evaluator::{has_field_access, has_table_access};
use super::profiles::{active_profile_tables, mandatory_filter_fields};
use super::scopes::UserScopes;

/// The audit record of one authorization decision.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub method: String,
    pub path: String,
    pub decision: &'static str,
    pub scopes: Vec<String>,
    pub matched_profiles: Vec<String>,
}

impl AuditEvent {
    fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(target: "dso_api::audit", event = %json),
            Err(e) => tracing::error!(target: "dso_api::audit", error = %e, "audit serialization failed"),
        }
    }
}

/// The outcome of a granted table check.
#[derive(Debug)]
pub struct AccessDecision {
    /// Names of the profiles that activated for this request.
    pub matched_profiles: Vec<String>,
}

/// Check table-level access and emit the audit event.
///
/// # Errors
///
/// `AccessDenied` when neither the scope set nor an active profile covers
/// the table.
pub fn check_table_access(
    snapshot: &SchemaSnapshot,
    user: &UserScopes,
    dataset: &Dataset,
    table: &Table,
    method: &str,
    path: &str,
) -> Result<AccessDecision> {
    let matched_profiles: Vec<String> =
        active_profile_tables(snapshot, user, &dataset.id, &table.id)
            .iter()
            .map(|active| active.profile.name.clone())
            .collect();

    let permission = has_table_access(snapshot, user, dataset, table);
    let event = AuditEvent {
        id: Uuid::new_v4().to_string(),
        method: method.to_string(),
        path: path.to_string(),
        decision: if permission.is_granted() {
            "granted"
        } else {
            "denied"
        },
        scopes: user.granted().iter().cloned().collect(),
        matched_profiles: matched_profiles.clone(),
    };
    event.emit();

    if permission.is_granted() {
        Ok(AccessDecision { matched_profiles })
    } else {
        Err(ApiError::access_denied(format!(
            "Access denied to table {}.{}",
            dataset.id, table.id
        )))
    }
}

/// Check field authorization for the requested filters.
///
/// Every hop of every filter path must be readable, except:
/// - keys naming a temporal dimension (the temporal resolver consumes those,
///   but their start/end fields must still be readable);
/// - fields named by an active profile's mandatory filter sets, which the
///   profile requires even when they are otherwise invisible.
///
/// # Errors
///
/// `FieldNotFound` for unknown fields, `AccessDenied` when the caller is
/// filtering on fields they may not see.
pub fn check_filter_access(
    snapshot: &SchemaSnapshot,
    user: &UserScopes,
    dataset: &Dataset,
    table: &Table,
    filters: &[FilterInput],
) -> Result<()> {
    let active = active_profile_tables(snapshot, user, &dataset.id, &table.id);
    let mandatory = mandatory_filter_fields(&active);

    for filter in filters {
        let field_name = filter.path_name();

        // The mandatory filters may reference fields that are not otherwise
        // accessible; the profile requires them, so let them through.
        if mandatory.contains(filter.key.as_str()) || mandatory.contains(field_name.as_str()) {
            continue;
        }

        // Temporal dimension parameters are slice selectors, not filters;
        // their boundary fields still need access.
        if let Some(temporal) = &table.temporal {
            if let Some(dimension) = temporal.dimensions.get(field_name.as_str()) {
                for boundary in [&dimension.start, &dimension.end] {
                    let field = table
                        .field(boundary)
                        .ok_or_else(|| ApiError::field_not_found(boundary))?;
                    if !has_field_access(snapshot, user, dataset, table, field).is_granted() {
                        return Err(ApiError::access_denied(format!(
                            "No access to filter on '{field_name}'"
                        )));
                    }
                }
                continue;
            }
        }

        let parts = crate::schema::resolve_field_path(snapshot, dataset, table, &filter.path)?;
        for part in &parts {
            if !has_field_access(snapshot, user, part.dataset, part.table, part.field)
                .is_granted()
            {
                return Err(ApiError::access_denied(format!(
                    "No access to filter on '{field_name}'"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::schema::Dataset;

    fn snapshot() -> SchemaSnapshot {
        let dataset: Dataset = serde_json::from_value(serde_json::json!({
            "id": "movies",
            "tables": [{
                "id": "movie",
                "fields": [
                    {"id": "id", "type": "integer"},
                    {"id": "name", "type": "string"},
                    {"id": "rating", "type": "number", "auth": "MOVIES/RATING"},
                ]
            }]
        }))
        .unwrap();
        SchemaSnapshot::from_documents(vec![dataset], vec![]).unwrap()
    }

    fn filter(key: &str) -> FilterInput {
        FilterInput::from_parameter(key, vec!["x".to_string()]).unwrap()
    }

    #[test]
    fn test_open_table_is_granted() {
        let snapshot = snapshot();
        let dataset = snapshot.dataset("movies").unwrap();
        let table = dataset.table("movie").unwrap();
        let user = UserScopes::new([], []);

        let decision =
            check_table_access(&snapshot, &user, dataset, table, "GET", "/v1/movies/movie/")
                .unwrap();
        assert!(decision.matched_profiles.is_empty());
    }

    #[test]
    fn test_filter_on_protected_field_is_denied() {
        let snapshot = snapshot();
        let dataset = snapshot.dataset("movies").unwrap();
        let table = dataset.table("movie").unwrap();
        let user = UserScopes::new([], []);

        let err = check_filter_access(&snapshot, &user, dataset, table, &[filter("rating[gte]")])
            .unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied { .. }));

        // Accessible field filters pass.
        assert!(
            check_filter_access(&snapshot, &user, dataset, table, &[filter("name")]).is_ok()
        );
    }

    #[test]
    fn test_unknown_filter_field_is_400() {
        let snapshot = snapshot();
        let dataset = snapshot.dataset("movies").unwrap();
        let table = dataset.table("movie").unwrap();
        let user = UserScopes::new([], []);

        let err = check_filter_access(&snapshot, &user, dataset, table, &[filter("bogus")])
            .unwrap_err();
        assert!(matches!(err, ApiError::FieldNotFound { .. }));
    }
}
