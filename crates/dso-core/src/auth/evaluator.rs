//! Pure access evaluation over (user scopes, schema node).
//!
//! Ancestor auth dominates: a field check always includes the table's and
//! dataset's scopes. Profiles are consulted only when the plain scope check
//! fails; multiple active profiles combine by taking the most permissive
//! permission.

use std::collections::BTreeSet;

use crate::schema::{Dataset, Field, Permission, SchemaSnapshot, Table};

use super::profiles::active_profile_tables;
use super::scopes::UserScopes;

/// Access to the dataset as a whole.
#[must_use]
pub fn has_dataset_access(user: &UserScopes, dataset: &Dataset) -> Permission {
    if user.has_all_scopes(&dataset.auth) {
        Permission::Read
    } else {
        Permission::None
    }
}

/// Access to a table: the union of dataset and table auth must be granted,
/// or an active profile must cover the table.
#[must_use]
pub fn has_table_access(
    snapshot: &SchemaSnapshot,
    user: &UserScopes,
    dataset: &Dataset,
    table: &Table,
) -> Permission {
    let required: BTreeSet<String> = dataset
        .auth
        .iter()
        .chain(table.auth.iter())
        .cloned()
        .collect();
    if user.has_all_scopes(&required) {
        return Permission::Read;
    }

    if active_profile_tables(snapshot, user, &dataset.id, &table.id).is_empty() {
        Permission::None
    } else {
        Permission::Read
    }
}

/// Access to a single field, including any profile transform.
///
/// The plain check requires the union of dataset, table and field auth.
/// When that fails, the most permissive active-profile grant for this field
/// applies (possibly `letters:N`).
#[must_use]
pub fn has_field_access(
    snapshot: &SchemaSnapshot,
    user: &UserScopes,
    dataset: &Dataset,
    table: &Table,
    field: &Field,
) -> Permission {
    let required: BTreeSet<String> = dataset
        .auth
        .iter()
        .chain(table.auth.iter())
        .chain(field.auth.iter())
        .cloned()
        .collect();
    if user.has_all_scopes(&required) {
        return Permission::Read;
    }

    active_profile_tables(snapshot, user, &dataset.id, &table.id)
        .iter()
        .filter_map(|active| active.table.fields.get(&field.id))
        .copied()
        .max()
        .unwrap_or(Permission::None)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::schema::Dataset;

    fn snapshot_with_profile() -> SchemaSnapshot {
        let dataset: Dataset = serde_json::from_value(serde_json::json!({
            "id": "brp",
            "auth": "BRP/R",
            "tables": [{
                "id": "ingeschrevenpersonen",
                "fields": [
                    {"id": "bsn", "type": "string"},
                    {"id": "naam", "type": "string", "auth": "BRP/NAAM"},
                ]
            }]
        }))
        .unwrap();
        let profile = serde_json::from_value(serde_json::json!({
            "name": "medewerker",
            "scopes": ["BRP/RSN"],
            "datasets": {
                "brp": {
                    "tables": {
                        "ingeschrevenpersonen": {
                            "mandatoryFilterSets": [["bsn"]],
                            "fields": {"naam": "letters:3"}
                        }
                    }
                }
            }
        }))
        .unwrap();
        SchemaSnapshot::from_documents(vec![dataset], vec![profile]).unwrap()
    }

    #[test]
    fn test_plain_scope_grant() {
        let snapshot = snapshot_with_profile();
        let dataset = snapshot.dataset("brp").unwrap();
        let table = dataset.table("ingeschrevenpersonen").unwrap();

        let user = UserScopes::new(["BRP/R".to_string()], []);
        assert_eq!(
            has_table_access(&snapshot, &user, dataset, table),
            Permission::Read
        );

        let user = UserScopes::new([], []);
        assert_eq!(
            has_table_access(&snapshot, &user, dataset, table),
            Permission::None
        );
    }

    #[test]
    fn test_ancestor_auth_dominates_field() {
        let snapshot = snapshot_with_profile();
        let dataset = snapshot.dataset("brp").unwrap();
        let table = dataset.table("ingeschrevenpersonen").unwrap();
        let naam = table.field("naam").unwrap();

        // Dataset scope alone is not enough for a field with extra auth.
        let user = UserScopes::new(["BRP/R".to_string()], []);
        assert_eq!(
            has_field_access(&snapshot, &user, dataset, table, naam),
            Permission::None
        );

        let user = UserScopes::new(["BRP/R".to_string(), "BRP/NAAM".to_string()], []);
        assert_eq!(
            has_field_access(&snapshot, &user, dataset, table, naam),
            Permission::Read
        );
    }

    #[test]
    fn test_profile_grants_table_and_transforms_field() {
        let snapshot = snapshot_with_profile();
        let dataset = snapshot.dataset("brp").unwrap();
        let table = dataset.table("ingeschrevenpersonen").unwrap();
        let naam = table.field("naam").unwrap();

        // Profile scope + mandatory filter present: table opens up,
        // the name field is readable as its first three letters.
        let user = UserScopes::new(["BRP/RSN".to_string()], ["bsn".to_string()]);
        assert_eq!(
            has_table_access(&snapshot, &user, dataset, table),
            Permission::Read
        );
        assert_eq!(
            has_field_access(&snapshot, &user, dataset, table, naam),
            Permission::Letters(3)
        );

        // Without the mandatory filter the profile never activates.
        let user = UserScopes::new(["BRP/RSN".to_string()], []);
        assert_eq!(
            has_table_access(&snapshot, &user, dataset, table),
            Permission::None
        );
    }
}
