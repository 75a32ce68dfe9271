//! Profile activation: conditional access through mandatory filter sets.

use std::collections::BTreeSet;

use crate::filters::strip_lookup;
use crate::schema::{Profile, ProfileTable, SchemaSnapshot};

use super::scopes::UserScopes;

/// A profile whose table entry applies to the current request.
#[derive(Debug, Clone, Copy)]
pub struct ActiveProfile<'a> {
    pub profile: &'a Profile,
    pub table:   &'a ProfileTable,
}

/// Whether a present query key satisfies a mandatory filter set entry.
///
/// Mandatory sets may name either the complete filter (with lookup) or just
/// the field; a present key matches both spellings.
fn key_matches(present: &str, entry: &str) -> bool {
    present == entry || strip_lookup(present) == entry
}

fn filter_set_satisfied(set: &[String], query_params: &BTreeSet<String>) -> bool {
    set.iter()
        .all(|entry| query_params.iter().any(|present| key_matches(present, entry)))
}

/// The profiles that activate for this request on `dataset_id.table_id`.
///
/// A profile activates when the caller bears all of its scopes and, if the
/// table entry declares mandatory filter sets, at least one set is fully
/// covered by the query parameters present on the request.
#[must_use]
pub fn active_profile_tables<'a>(
    snapshot: &'a SchemaSnapshot,
    user: &UserScopes,
    dataset_id: &str,
    table_id: &str,
) -> Vec<ActiveProfile<'a>> {
    snapshot
        .profiles()
        .iter()
        .filter(|profile| user.has_all_scopes(&profile.scopes))
        .filter_map(|profile| {
            let table = profile.datasets.get(dataset_id)?.tables.get(table_id)?;
            let satisfied = table.mandatory_filter_sets.is_empty()
                || table
                    .mandatory_filter_sets
                    .iter()
                    .any(|set| filter_set_satisfied(set, user.query_params()));
            satisfied.then_some(ActiveProfile { profile, table })
        })
        .collect()
}

/// All field names referenced by the active profiles' mandatory filter sets.
///
/// Filters on these fields are exempt from the per-field access check: the
/// profile requires them even when the field is otherwise invisible.
#[must_use]
pub fn mandatory_filter_fields(active: &[ActiveProfile<'_>]) -> BTreeSet<String> {
    active
        .iter()
        .flat_map(|p| p.table.mandatory_filter_sets.iter())
        .flatten()
        .map(|entry| strip_lookup(entry).to_string())
        .collect()
}
