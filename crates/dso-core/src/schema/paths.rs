//! Dotted field-path resolution against the schema.
//!
//! Filter keys, sort fields and expand scopes all address fields with dotted
//! paths that may span relations (`regimes.eindtijd`, `ligtInWijk.naam`).
//! Resolution turns such a path into a list of [`FieldPathPart`]s carrying the
//! schema metadata for every hop.

use dso_error::{ApiError, Result};

use super::types::{AdditionalRelation, Dataset, Field, FieldKind, SchemaSnapshot, Table};

/// One resolved hop of a dotted field path.
#[derive(Debug, Clone)]
pub struct FieldPathPart<'a> {
    /// The path segment as written in the query string.
    pub name: String,

    /// The schema field this segment resolves to. For a reverse relation this
    /// is the identifier field of the far table, which is what value lookups
    /// compare against.
    pub field: &'a Field,

    /// Set when the segment names a reverse relation rather than a field.
    pub reverse: Option<&'a AdditionalRelation>,

    /// The dataset and table owning `field`.
    pub dataset: &'a Dataset,
    pub table:   &'a Table,

    /// Whether traversing this hop can produce multiple rows.
    pub is_many: bool,
}

enum Parent<'a> {
    Table(&'a Dataset, &'a Table),
    /// An object-typed field with subfields, treated as a nested table.
    Subfields(&'a Dataset, &'a Table, &'a Field),
    None,
}

/// Resolve a dotted field path starting at `table`.
///
/// Handles three extra cases beyond plain field lookup:
/// - the legacy `…Id` suffix on a **terminal** segment resolves to the
///   relation field it denotes (and only to relations);
/// - a segment may name an additional (reverse) relation, which then resolves
///   against the far table's identifier;
/// - paths through a loose relation only support the target's first
///   identifier part.
///
/// # Errors
///
/// `FieldNotFound` when a segment does not exist, `InvalidFilterSyntax` for
/// unsupported loose-relation traversal.
pub fn resolve_field_path<'a>(
    snapshot: &'a SchemaSnapshot,
    dataset: &'a Dataset,
    table: &'a Table,
    path: &[String],
) -> Result<Vec<FieldPathPart<'a>>> {
    let full_name = path.join(".");
    let mut parts: Vec<FieldPathPart<'a>> = Vec::with_capacity(path.len());
    let mut parent = Parent::Table(dataset, table);
    let last = path.len().saturating_sub(1);

    for (i, name) in path.iter().enumerate() {
        let part = match parent {
            Parent::None => return Err(ApiError::field_not_found(&full_name)),
            Parent::Table(ds, tbl) => {
                lookup_in_table(snapshot, ds, tbl, name, i == last)
                    .ok_or_else(|| ApiError::field_not_found(&full_name))?
            }
            Parent::Subfields(ds, tbl, field) => {
                let sub = field
                    .subfields
                    .iter()
                    .find(|f| f.id == *name)
                    .ok_or_else(|| ApiError::field_not_found(&full_name))?;
                FieldPathPart {
                    name: name.clone(),
                    field: sub,
                    reverse: None,
                    dataset: ds,
                    table: tbl,
                    is_many: sub.kind() == FieldKind::Array,
                }
            }
        };

        // Determine where the next segment resolves.
        parent = next_parent(snapshot, &part)?;

        // Loose relations store only the logical identifier; anything beyond
        // that cannot be resolved to a column.
        if part.reverse.is_none() && part.field.is_loose_relation && i < last {
            let target_id = part
                .field
                .related_field_ids
                .as_ref()
                .and_then(|ids| ids.first().cloned())
                .unwrap_or_default();
            let supported = i + 1 == last && path[last] == target_id;
            if !supported {
                return Err(ApiError::InvalidFilterSyntax {
                    message: format!(
                        "Filtering nested fields of '{}' is not supported, \
                         except for the primary key ({target_id}).",
                        part.field.id
                    ),
                });
            }
        }

        parts.push(part);
    }

    Ok(parts)
}

fn lookup_in_table<'a>(
    snapshot: &'a SchemaSnapshot,
    dataset: &'a Dataset,
    table: &'a Table,
    name: &str,
    is_last: bool,
) -> Option<FieldPathPart<'a>> {
    let mut field = table.field(name);

    if field.is_none() && is_last {
        // Backwards compatibility: the "FOREIGNKEY_id" column was exposed in
        // the API; accept the camelCase "xyzId" spelling for actual relations.
        if let Some(base) = name.strip_suffix("Id") {
            field = table.field(base).filter(|f| f.relation.is_some());
        }
    }

    if let Some(field) = field {
        return Some(FieldPathPart {
            name: name.to_string(),
            field,
            reverse: None,
            dataset,
            table,
            is_many: field.kind() == FieldKind::Array || field.nm_relation.is_some(),
        });
    }

    // The segment may name a declared reverse relation. Direct lookups then
    // compare against the far table's identifier field.
    let relation = table.additional_relation(name)?;
    let far_table = snapshot.table(&relation.table.dataset, &relation.table.table)?;
    let far_dataset = snapshot.dataset(&relation.table.dataset)?;
    let id_field = far_table.field(far_table.logical_identifier())?;

    Some(FieldPathPart {
        name: name.to_string(),
        field: id_field,
        reverse: Some(relation),
        dataset: far_dataset,
        table: far_table,
        is_many: true,
    })
}

fn next_parent<'a>(
    snapshot: &'a SchemaSnapshot,
    part: &FieldPathPart<'a>,
) -> Result<Parent<'a>> {
    if let Some(reverse) = part.reverse {
        let dataset = snapshot
            .dataset(&reverse.table.dataset)
            .ok_or_else(|| ApiError::schema(format!("unknown dataset {}", reverse.table.dataset)))?;
        let table = dataset
            .table(&reverse.table.table)
            .ok_or_else(|| ApiError::schema(format!("unknown table {}", reverse.table)))?;
        return Ok(Parent::Table(dataset, table));
    }

    if let Some(target) = part.field.related_table() {
        let dataset = snapshot
            .dataset(&target.dataset)
            .ok_or_else(|| ApiError::schema(format!("unknown dataset {}", target.dataset)))?;
        let table = dataset
            .table(&target.table)
            .ok_or_else(|| ApiError::schema(format!("unknown table {target}")))?;
        return Ok(Parent::Table(dataset, table));
    }

    if !part.field.subfields.is_empty() {
        return Ok(Parent::Subfields(part.dataset, part.table, part.field));
    }

    Ok(Parent::None)
}

/// Resolve a `_sort` identifier.
///
/// Sorting is allowed on plain fields and on forward relations (which sort by
/// the local FK column); traversing a relation with a dotted path is denied.
///
/// # Errors
///
/// `InvalidSort` for dotted paths, `FieldNotFound` for unknown names.
pub fn resolve_sort_path<'a>(
    snapshot: &'a SchemaSnapshot,
    dataset: &'a Dataset,
    table: &'a Table,
    name: &str,
) -> Result<FieldPathPart<'a>> {
    if name.contains('.') {
        return Err(ApiError::InvalidSort {
            message: format!("Sorting on relations is not supported: {name}"),
        });
    }

    lookup_in_table(snapshot, dataset, table, name, true)
        .filter(|part| part.reverse.is_none())
        .ok_or_else(|| ApiError::field_not_found(name))
}
