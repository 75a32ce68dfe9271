//! Per-chunk relation prefetching with a bounded cache.
//!
//! For every chunk of base rows and every expanded relation, one batched
//! query fetches the related rows, which are then grouped back onto their
//! parents. Forward lookups go through an LRU cache keyed by
//! `(relation lookup, target id)`: commonly shared parents (a cluster with
//! thousands of containers) are fetched once per process, not once per chunk.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use dso_error::{ApiError, Result};

use crate::auth::UserScopes;
use crate::plan::{
    ColumnRef, JoinKind, JoinSpec, Planner, PlannerOptions, Predicate, QueryParams, QueryPlan,
    SelectExpr, SelectedColumn, SqlGenerator, SqlQuery, SqlValue,
};
use crate::schema::{
    to_snake_case, Dataset, Field, FieldKind, RelationFormat, SchemaSnapshot, Table,
};

use super::execute::{DataRow, QueryExecutor, Row, RowDecoder};

/// Alias used for the parent-link column added to prefetch queries.
const PARENT_KEY: &str = "__parent_id";

/// Process-wide cache of prefetched parent rows.
pub struct PrefetchCache {
    inner: Mutex<LruCache<(String, String), Arc<Row>>>,
}

impl PrefetchCache {
    /// Create a cache bounded to `capacity` rows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get(&self, lookup: &str, id: &str) -> Option<Arc<Row>> {
        self.inner
            .lock()
            .get(&(lookup.to_string(), id.to_string()))
            .cloned()
    }

    fn put(&self, lookup: &str, id: &str, row: Arc<Row>) {
        self.inner
            .lock()
            .put((lookup.to_string(), id.to_string()), row);
    }

    /// Drop everything; called when a schema reload publishes a new snapshot.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Fetches and attaches related rows for one request.
pub struct Prefetcher<'a> {
    snapshot: &'a SchemaSnapshot,
    user:     &'a UserScopes,
    executor: &'a QueryExecutor,
    cache:    &'a PrefetchCache,
    options:  PlannerOptions,
    /// Raw query pairs of the parent request; carries temporal dimension
    /// parameters into related-table slices.
    raw_params: Vec<(String, String)>,
}

impl<'a> Prefetcher<'a> {
    #[must_use]
    pub fn new(
        snapshot: &'a SchemaSnapshot,
        user: &'a UserScopes,
        executor: &'a QueryExecutor,
        cache: &'a PrefetchCache,
        options: PlannerOptions,
        raw_params: Vec<(String, String)>,
    ) -> Self {
        Self {
            snapshot,
            user,
            executor,
            cache,
            options,
            raw_params,
        }
    }

    /// Attach prefetched relations for all `expand` names to a chunk of rows.
    pub async fn attach(
        &self,
        dataset: &Dataset,
        table: &Table,
        expand: &[String],
        rows: Vec<Row>,
    ) -> Result<Vec<DataRow>> {
        let mut data_rows: Vec<DataRow> = rows.into_iter().map(DataRow::new).collect();

        for name in expand {
            if let Some(field) = table.field(name) {
                if field.is_nested_table {
                    self.attach_nested(dataset, table, field, &mut data_rows).await?;
                } else if field.nm_relation.is_some() {
                    self.attach_m2m(dataset, table, field, &mut data_rows).await?;
                } else if field.relation.is_some() {
                    self.attach_forward(dataset, table, field, &mut data_rows).await?;
                }
            } else if let Some(relation) = table.additional_relation(name) {
                if relation.format == RelationFormat::Embedded {
                    self.attach_reverse(table, name, relation, &mut data_rows).await?;
                }
            }
        }

        for relation in &table.additional_relations {
            if relation.format == RelationFormat::Summary {
                self.attach_summary_counts(table, relation, &mut data_rows).await?;
            }
        }

        Ok(data_rows)
    }

    /// One grouped COUNT per chunk fills the `{count}` of summary links.
    async fn attach_summary_counts(
        &self,
        table: &Table,
        relation: &crate::schema::AdditionalRelation,
        rows: &mut [DataRow],
    ) -> Result<()> {
        let far_dataset = self
            .snapshot
            .dataset(&relation.table.dataset)
            .ok_or_else(|| ApiError::schema(format!("unknown dataset {}", relation.table.dataset)))?;
        let far_table = far_dataset
            .table(&relation.table.table)
            .ok_or_else(|| ApiError::schema(format!("unknown table {}", relation.table)))?;
        let fk_field = far_table.field(&relation.field).ok_or_else(|| {
            ApiError::schema(format!("missing FK field {} on {}", relation.field, far_table.id))
        })?;

        let parent_id_field = table.logical_identifier().to_string();
        let parent_ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.values.get(&parent_id_field).and_then(value_key))
            .collect();
        if parent_ids.is_empty() {
            return Ok(());
        }

        let fk_column = format!("{}_id", to_snake_case(&fk_field.id));
        let far_db_table = SchemaSnapshot::db_table_name(far_dataset, far_table);
        let placeholders: Vec<String> =
            (1..=parent_ids.len()).map(|n| format!("${n}")).collect();
        let query = SqlQuery {
            sql: format!(
                "SELECT \"{fk_column}\", COUNT(*) FROM \"{far_db_table}\" \
                 WHERE \"{fk_column}\" IN ({}) GROUP BY \"{fk_column}\"",
                placeholders.join(", ")
            ),
            params: parent_ids
                .iter()
                .map(|id| SqlValue::Text(id.clone()))
                .collect(),
        };

        let counts = self.executor.fetch_grouped_counts(query).await?;
        for row in rows.iter_mut() {
            if let Some(id) = row.values.get(&parent_id_field).and_then(value_key) {
                let count = counts.get(&id).copied().unwrap_or(0);
                row.summary_counts.insert(relation.id.clone(), count);
            }
        }
        Ok(())
    }

    /// Build the plan for a related table: its readable columns plus the
    /// request's temporal slice, no pagination.
    fn target_plan(&self, dataset: &Dataset, table: &Table) -> Result<QueryPlan> {
        let params = QueryParams {
            raw: self.raw_params.clone(),
            page: 1,
            ..QueryParams::default()
        };
        Planner::new(self.snapshot, dataset, table, self.user, self.options.clone())
            .plan_list(&params, false)
    }

    fn resolve_target(&self, field: &Field) -> Result<(&'a Dataset, &'a Table)> {
        let target = field
            .related_table()
            .ok_or_else(|| ApiError::schema(format!("field {} is not a relation", field.id)))?;
        let dataset = self
            .snapshot
            .dataset(&target.dataset)
            .ok_or_else(|| ApiError::schema(format!("unknown dataset {}", target.dataset)))?;
        let table = dataset
            .table(&target.table)
            .ok_or_else(|| ApiError::schema(format!("unknown table {target}")))?;
        Ok((dataset, table))
    }

    async fn fetch_rows(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let query = SqlGenerator::new().select(plan)?;
        let decoder = RowDecoder::from_plan(plan);
        let stream = self.executor.stream(query, decoder).await?;
        stream.collect_rows().await
    }

    // ------------------------------------------------------------------
    // Forward FK (including loose relations)
    // ------------------------------------------------------------------

    async fn attach_forward(
        &self,
        dataset: &Dataset,
        table: &Table,
        field: &Field,
        rows: &mut [DataRow],
    ) -> Result<()> {
        let (target_dataset, target_table) = self.resolve_target(field)?;
        let lookup = format!("{}.{}.{}", dataset.id, table.id, field.id);
        let link_key = forward_link_key(field, target_table);
        let id_field = target_table.logical_identifier().to_string();

        // Split wanted ids into cache hits and misses.
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        for row in rows.iter() {
            if let Some(id) = row.values.get(&link_key).and_then(value_key) {
                wanted.insert(id);
            }
        }
        let mut found: HashMap<String, Arc<Row>> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        for id in &wanted {
            match self.cache.get(&lookup, id) {
                Some(row) => {
                    found.insert(id.clone(), row);
                }
                None => misses.push(id.clone()),
            }
        }

        if !misses.is_empty() {
            let mut plan = self.target_plan(target_dataset, target_table)?;
            plan.where_terms.push(Predicate::In {
                column: ColumnRef::new(&plan.base_alias, to_snake_case(&id_field)),
                values: misses.iter().map(|id| SqlValue::Text(id.clone())).collect(),
            });
            for fetched in self.fetch_rows(&plan).await? {
                if let Some(id) = fetched.get(&id_field).and_then(value_key) {
                    let shared = Arc::new(fetched);
                    self.cache.put(&lookup, &id, shared.clone());
                    found.insert(id, shared);
                }
            }
        }

        for row in rows.iter_mut() {
            if let Some(id) = row.values.get(&link_key).and_then(value_key) {
                if let Some(related) = found.get(&id) {
                    row.embedded
                        .insert(field.id.clone(), vec![DataRow::new((**related).clone())]);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reverse relation (additionalRelations with format=embedded)
    // ------------------------------------------------------------------

    async fn attach_reverse(
        &self,
        table: &Table,
        name: &str,
        relation: &crate::schema::AdditionalRelation,
        rows: &mut [DataRow],
    ) -> Result<()> {
        let far_dataset = self
            .snapshot
            .dataset(&relation.table.dataset)
            .ok_or_else(|| ApiError::schema(format!("unknown dataset {}", relation.table.dataset)))?;
        let far_table = far_dataset
            .table(&relation.table.table)
            .ok_or_else(|| ApiError::schema(format!("unknown table {}", relation.table)))?;
        let fk_field = far_table.field(&relation.field).ok_or_else(|| {
            ApiError::schema(format!("missing FK field {} on {}", relation.field, far_table.id))
        })?;

        let parent_id_field = table.logical_identifier().to_string();
        let parent_ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.values.get(&parent_id_field).and_then(value_key))
            .collect();
        if parent_ids.is_empty() {
            return Ok(());
        }

        let mut plan = self.target_plan(far_dataset, far_table)?;
        let fk_column = format!("{}_id", to_snake_case(&fk_field.id));
        plan.where_terms.push(Predicate::In {
            column: ColumnRef::new(&plan.base_alias, fk_column.clone()),
            values: parent_ids.iter().map(|id| SqlValue::Text(id.clone())).collect(),
        });
        plan.selected.push(SelectedColumn {
            field_id: PARENT_KEY.to_string(),
            column: ColumnRef::new(&plan.base_alias, fk_column),
            kind: FieldKind::String,
            expr: SelectExpr::Column,
        });

        let grouped = group_rows(self.fetch_rows(&plan).await?);
        attach_grouped(rows, &parent_id_field, name, grouped);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nested tables (array-of-object child rows)
    // ------------------------------------------------------------------

    async fn attach_nested(
        &self,
        dataset: &Dataset,
        table: &Table,
        field: &Field,
        rows: &mut [DataRow],
    ) -> Result<()> {
        let parent_id_field = table.logical_identifier().to_string();
        let parent_ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.values.get(&parent_id_field).and_then(value_key))
            .collect();
        if parent_ids.is_empty() {
            return Ok(());
        }

        let child_table = format!(
            "{}_{}",
            SchemaSnapshot::db_table_name(dataset, table),
            to_snake_case(&field.id)
        );

        // Nested tables have no schema table of their own; assemble a small
        // plan from the subfield descriptors.
        let mut selected: Vec<SelectedColumn> = field
            .subfields
            .iter()
            .map(|sub| SelectedColumn {
                field_id: sub.id.clone(),
                column: ColumnRef::new("t", to_snake_case(&sub.id)),
                kind: sub.kind(),
                expr: SelectExpr::Column,
            })
            .collect();
        selected.push(SelectedColumn {
            field_id: PARENT_KEY.to_string(),
            column: ColumnRef::new("t", "parent_id"),
            kind: FieldKind::String,
            expr: SelectExpr::Column,
        });

        let plan = QueryPlan {
            dataset_id: dataset.id.clone(),
            table_id: field.id.clone(),
            db_table: child_table,
            base_alias: "t".to_string(),
            selected,
            identifier_columns: vec!["id".to_string()],
            joins: Vec::new(),
            where_terms: vec![Predicate::In {
                column: ColumnRef::new("t", "parent_id"),
                values: parent_ids.iter().map(|id| SqlValue::Text(id.clone())).collect(),
            }],
            order_by: Vec::new(),
            distinct: false,
            prefetch: Vec::new(),
            temporal: None,
            pagination: crate::plan::Pagination {
                page: 1,
                page_size: 0,
                count_requested: false,
                enabled: false,
            },
        };

        let grouped = group_rows(self.fetch_rows(&plan).await?);
        attach_grouped(rows, &parent_id_field, &field.id, grouped);
        Ok(())
    }

    // ------------------------------------------------------------------
    // M2M through a junction table
    // ------------------------------------------------------------------

    async fn attach_m2m(
        &self,
        dataset: &Dataset,
        table: &Table,
        field: &Field,
        rows: &mut [DataRow],
    ) -> Result<()> {
        let (target_dataset, target_table) = self.resolve_target(field)?;
        let parent_id_field = table.logical_identifier().to_string();
        let parent_ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.values.get(&parent_id_field).and_then(value_key))
            .collect();
        if parent_ids.is_empty() {
            return Ok(());
        }

        let through_table = format!(
            "{}_{}",
            SchemaSnapshot::db_table_name(dataset, table),
            to_snake_case(&field.id)
        );

        let mut plan = self.target_plan(target_dataset, target_table)?;
        let through_alias = "m".to_string();
        plan.joins.push(JoinSpec {
            kind: JoinKind::Inner,
            db_table: through_table,
            alias: through_alias.clone(),
            on: vec![(
                ColumnRef::new(&through_alias, format!("{}_id", to_snake_case(&target_table.id))),
                ColumnRef::new(
                    &plan.base_alias,
                    to_snake_case(target_table.logical_identifier()),
                ),
            )],
        });
        plan.where_terms.push(Predicate::In {
            column: ColumnRef::new(&through_alias, format!("{}_id", to_snake_case(&table.id))),
            values: parent_ids.iter().map(|id| SqlValue::Text(id.clone())).collect(),
        });
        plan.selected.push(SelectedColumn {
            field_id: PARENT_KEY.to_string(),
            column: ColumnRef::new(&through_alias, format!("{}_id", to_snake_case(&table.id))),
            kind: FieldKind::String,
            expr: SelectExpr::Column,
        });

        let grouped = group_rows(self.fetch_rows(&plan).await?);
        attach_grouped(rows, &parent_id_field, &field.id, grouped);
        Ok(())
    }
}

/// The row key a forward relation's link value is stored under.
fn forward_link_key(field: &Field, target_table: &Table) -> String {
    if !field.is_loose_relation {
        if let Some(related_ids) = field.related_field_ids.as_ref().filter(|ids| ids.len() > 1) {
            let logical = target_table.logical_identifier();
            let first = related_ids
                .iter()
                .find(|id| id.as_str() == logical)
                .or_else(|| related_ids.first());
            if let Some(first) = first {
                return format!("{}_{first}", field.id);
            }
        }
    }
    field.id.clone()
}

/// A stable string key for joining rows on identifier values.
fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn group_rows(rows: Vec<Row>) -> HashMap<String, Vec<DataRow>> {
    let mut grouped: HashMap<String, Vec<DataRow>> = HashMap::new();
    for mut row in rows {
        let Some(key) = row.get(PARENT_KEY).and_then(value_key) else {
            continue;
        };
        row.shift_remove(PARENT_KEY);
        grouped.entry(key).or_default().push(DataRow::new(row));
    }
    grouped
}

fn attach_grouped(
    rows: &mut [DataRow],
    parent_id_field: &str,
    name: &str,
    mut grouped: HashMap<String, Vec<DataRow>>,
) {
    for row in rows.iter_mut() {
        if let Some(id) = row.values.get(parent_id_field).and_then(value_key) {
            if let Some(related) = grouped.remove(&id) {
                row.embedded.insert(name.to_string(), related);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key() {
        assert_eq!(value_key(&Value::String("c1".into())).unwrap(), "c1");
        assert_eq!(value_key(&serde_json::json!(12)).unwrap(), "12");
        assert!(value_key(&Value::Null).is_none());
    }

    #[test]
    fn test_group_rows_strips_parent_key() {
        let mut row = Row::new();
        row.insert("naam".to_string(), Value::String("x".into()));
        row.insert(PARENT_KEY.to_string(), Value::String("p1".into()));

        let grouped = group_rows(vec![row]);
        let rows = grouped.get("p1").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].values.contains_key(PARENT_KEY));
    }

    #[test]
    fn test_cache_round_trip() {
        let cache = PrefetchCache::new(8);
        assert!(cache.get("a.b.c", "1").is_none());

        let mut row = Row::new();
        row.insert("id".to_string(), Value::String("1".into()));
        cache.put("a.b.c", "1", Arc::new(row));

        assert!(cache.get("a.b.c", "1").is_some());
        cache.clear();
        assert!(cache.get("a.b.c", "1").is_none());
    }

    #[test]
    fn test_forward_link_key_composite() {
        let field: Field = serde_json::from_value(serde_json::json!({
            "id": "ligtInWijk",
            "type": "string",
            "relation": "gebieden:wijken",
            "relatedFieldIds": ["identificatie", "volgnummer"],
        }))
        .unwrap();
        let target: Table = serde_json::from_value(serde_json::json!({
            "id": "wijken",
            "identifier": ["identificatie", "volgnummer"],
            "temporal": {"identifier": "volgnummer"},
            "fields": [
                {"id": "identificatie", "type": "string"},
                {"id": "volgnummer", "type": "integer"},
            ]
        }))
        .unwrap();
        assert_eq!(forward_link_key(&field, &target), "ligtInWijk_identificatie");
    }
}
