//! Lowering query-string input to a [`QueryPlan`].
//!
//! Field paths become join chains (with the local-FK-column optimization for
//! terminal identifier segments), lookups become typed predicates, sort and
//! projection are validated against the schema and the caller's permissions.

use std::collections::{BTreeSet, HashMap};

use dso_error::{ApiError, Result};

use crate::auth::{has_field_access, has_table_access, UserScopes};
use crate::crs::Crs;
use crate::filters::values::{parse_bool, parse_point, parse_scalar, ParsedValue};
use crate::filters::{validate_lookup, FilterInput, Lookup};
use crate::schema::{
    resolve_field_path, resolve_sort_path, to_snake_case, Dataset, Field, FieldKind,
    FieldPathPart, Permission, RelationFormat, SchemaSnapshot, Table,
};

use super::temporal::TemporalSlice;
use super::{
    ColumnRef, CompareOp, JoinKind, JoinSpec, Pagination, Predicate, QueryParams, QueryPlan,
    SelectExpr, SelectedColumn, SortDir, SqlValue,
};

/// Environment for planning one request.
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// CRS of geometry values in the query string (`Accept-Crs`).
    pub input_crs: Option<Crs>,
    /// SRID geometry columns are rendered in.
    pub response_srid: i32,
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            input_crs: None,
            response_srid: 4326,
            default_page_size: 20,
            max_page_size: 1000,
        }
    }
}

const BASE_ALIAS: &str = "t";

/// Lowers request input into a [`QueryPlan`] for one table.
pub struct Planner<'a> {
    snapshot: &'a SchemaSnapshot,
    dataset:  &'a Dataset,
    table:    &'a Table,
    user:     &'a UserScopes,
    options:  PlannerOptions,
}

/// Join bookkeeping during lowering.
struct JoinState {
    joins: Vec<JoinSpec>,
    /// Path prefix → alias, so `a.b.x` and `a.b.y` share one join.
    by_prefix: HashMap<String, String>,
    /// Slice predicates for joined temporal tables, merged into WHERE.
    temporal_predicates: Vec<Predicate>,
    counter: usize,
    distinct: bool,
}

impl JoinState {
    fn new() -> Self {
        Self {
            joins: Vec::new(),
            by_prefix: HashMap::new(),
            temporal_predicates: Vec::new(),
            counter: 0,
            distinct: false,
        }
    }

    fn next_alias(&mut self) -> String {
        self.counter += 1;
        format!("j{}", self.counter)
    }

    fn push(&mut self, prefix: &str, spec: JoinSpec) -> String {
        let alias = spec.alias.clone();
        self.by_prefix.insert(prefix.to_string(), alias.clone());
        self.joins.push(spec);
        alias
    }
}

impl<'a> Planner<'a> {
    #[must_use]
    pub fn new(
        snapshot: &'a SchemaSnapshot,
        dataset: &'a Dataset,
        table: &'a Table,
        user: &'a UserScopes,
        options: PlannerOptions,
    ) -> Self {
        Self {
            snapshot,
            dataset,
            table,
            user,
            options,
        }
    }

    /// Plan a listing request.
    ///
    /// `paginate` is false for renderers that stream the full cursor.
    pub fn plan_list(&self, params: &QueryParams, paginate: bool) -> Result<QueryPlan> {
        let mut joins = JoinState::new();
        let mut where_terms = Vec::new();

        let temporal = TemporalSlice::resolve(self.table, &params.raw)?;
        let db_table = SchemaSnapshot::db_table_name(self.dataset, self.table);

        for filter in &params.filters {
            if self.is_temporal_param(filter) {
                continue;
            }
            self.compile_filter(filter, &mut joins, &mut where_terms)?;
        }

        if let (Some(slice), Some(descriptor)) = (&temporal, &self.table.temporal) {
            where_terms.extend(slice.predicates(BASE_ALIAS, &db_table, self.table, descriptor));
        }
        where_terms.append(&mut joins.temporal_predicates);

        let selected = self.select_columns(params.fields.as_deref())?;
        let order_by = self.compile_sort(&params.sort)?;
        let mut prefetch = self.compile_expand(params)?;

        // Nested tables render inline in the body, so their child rows are
        // always fetched along, independent of ?_expand.
        for field in &self.table.fields {
            if field.is_nested_table
                && !prefetch.contains(&field.id)
                && has_field_access(self.snapshot, self.user, self.dataset, self.table, field)
                    .is_granted()
            {
                prefetch.push(field.id.clone());
            }
        }

        let page_size = params
            .page_size
            .unwrap_or(self.options.default_page_size)
            .min(self.options.max_page_size);

        Ok(QueryPlan {
            dataset_id: self.dataset.id.clone(),
            table_id: self.table.id.clone(),
            db_table,
            base_alias: BASE_ALIAS.to_string(),
            selected,
            identifier_columns: self
                .table
                .identifier
                .iter()
                .map(|id| to_snake_case(id))
                .collect(),
            joins: joins.joins,
            where_terms,
            order_by,
            distinct: joins.distinct,
            prefetch,
            temporal,
            pagination: Pagination {
                page: params.page,
                page_size,
                count_requested: params.count,
                enabled: paginate,
            },
        })
    }

    /// Plan a detail request for one identifier.
    ///
    /// For temporal tables `id` is the logical identifier alone; the sequence
    /// comes from `?volgnummer=` or defaults to the latest slice.
    pub fn plan_detail(&self, id: &str, params: &QueryParams) -> Result<QueryPlan> {
        let mut plan = self.plan_list(params, false)?;
        plan.pagination.count_requested = false;

        let id_field_name = self.table.logical_identifier().to_string();
        let id_field = self
            .table
            .field(&id_field_name)
            .ok_or_else(|| ApiError::schema(format!("missing identifier field {id_field_name}")))?;
        let value = parse_scalar(id_field.scalar_kind(), id)
            .map_err(|_| ApiError::not_found(format!("No record found with id '{id}'")))?;

        plan.where_terms.push(Predicate::Compare {
            column: ColumnRef::new(BASE_ALIAS, to_snake_case(&id_field_name)),
            op: CompareOp::Eq,
            value: value.try_into()?,
            case_insensitive: false,
        });
        Ok(plan)
    }

    /// Whether this filter key is a temporal slice selector instead of a filter.
    fn is_temporal_param(&self, filter: &FilterInput) -> bool {
        let Some(temporal) = &self.table.temporal else {
            return false;
        };
        let name = filter.path_name();
        name == temporal.sequence_field || temporal.dimensions.contains_key(&name)
    }

    /// The target (dataset, table) a relation part traverses into.
    fn relation_target(&self, part: &FieldPathPart<'a>) -> Result<(&'a Dataset, &'a Table)> {
        let target = part
            .field
            .related_table()
            .ok_or_else(|| ApiError::schema(format!("field {} is not a relation", part.field.id)))?;
        let dataset = self
            .snapshot
            .dataset(&target.dataset)
            .ok_or_else(|| ApiError::schema(format!("unknown dataset {}", target.dataset)))?;
        let table = dataset
            .table(&target.table)
            .ok_or_else(|| ApiError::schema(format!("unknown table {target}")))?;
        Ok((dataset, table))
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    fn compile_filter(
        &self,
        filter: &FilterInput,
        joins: &mut JoinState,
        where_terms: &mut Vec<Predicate>,
    ) -> Result<()> {
        let parts = resolve_field_path(self.snapshot, self.dataset, self.table, &filter.path)?;
        let field_name = filter.path_name();
        let terminal = parts
            .last()
            .ok_or_else(|| ApiError::field_not_found(&field_name))?;

        let is_identifier_part = terminal.table.identifier.contains(&terminal.field.id);
        let lookup =
            validate_lookup(terminal.field, &field_name, &filter.lookup, is_identifier_part)?;

        if parts.iter().any(|p| p.is_many) {
            joins.distinct = true;
        }

        let column = self.resolve_terminal_column(&parts, joins)?;
        let predicate = self.build_predicate(filter, terminal, lookup, column, &field_name)?;
        where_terms.push(predicate);
        Ok(())
    }

    /// Resolve the column a path compares against, creating joins as needed.
    ///
    /// When the terminal segment matches an identifier stored locally as an
    /// FK column (`relatedFieldIds`), the join is elided and the local column
    /// is used instead.
    fn resolve_terminal_column(
        &self,
        parts: &[FieldPathPart<'a>],
        joins: &mut JoinState,
    ) -> Result<ColumnRef> {
        // Join elision: foo.identifier → local "foo_identifier" / "foo_id".
        if parts.len() > 1 {
            let parent = &parts[parts.len() - 2];
            let terminal = &parts[parts.len() - 1];
            if parent.reverse.is_none() && parent.field.relation.is_some() {
                if let Some(related_ids) = &parent.field.related_field_ids {
                    if related_ids.contains(&terminal.field.id) {
                        let alias = self.join_path(&parts[..parts.len() - 2], joins)?;
                        let fk = to_snake_case(&parent.field.id);
                        let column = if parent.field.is_loose_relation {
                            format!("{fk}_id")
                        } else {
                            format!("{fk}_{}", to_snake_case(&terminal.field.id))
                        };
                        return Ok(ColumnRef::new(alias, column));
                    }
                }
            }
        }

        let alias = self.join_path(&parts[..parts.len() - 1], joins)?;
        let terminal = &parts[parts.len() - 1];

        // Subfields of a plain object are flattened into prefixed columns on
        // the same table.
        let column = match parts.len().checked_sub(2).map(|i| &parts[i]) {
            Some(parent)
                if parent.reverse.is_none()
                    && !parent.field.is_nested_table
                    && !parent.field.subfields.is_empty()
                    && !parent.field.is_relation() =>
            {
                format!(
                    "{}_{}",
                    to_snake_case(&parent.field.id),
                    to_snake_case(&terminal.field.id)
                )
            }
            _ => terminal.field.db_name(),
        };

        Ok(ColumnRef::new(alias, column))
    }

    /// Create the join chain for the non-terminal parts, returning the alias
    /// the terminal column lives on.
    fn join_path(&self, parts: &[FieldPathPart<'a>], joins: &mut JoinState) -> Result<String> {
        let mut alias = BASE_ALIAS.to_string();
        let mut prefix = String::new();
        let mut parent: (&Dataset, &Table) = (self.dataset, self.table);

        for part in parts {
            prefix = if prefix.is_empty() {
                part.name.to_string()
            } else {
                format!("{prefix}.{}", part.name)
            };

            // Plain object subfields stay on the same table/alias.
            if part.reverse.is_none()
                && !part.field.is_nested_table
                && !part.field.subfields.is_empty()
                && !part.field.is_relation()
            {
                continue;
            }

            if let Some(existing) = joins.by_prefix.get(&prefix).cloned() {
                alias = existing;
            } else {
                let (next_parent, new_alias) =
                    self.add_join(part, &alias, &prefix, parent.0, parent.1, joins)?;
                alias = new_alias;
                parent = next_parent;
                continue;
            }
            parent = self.next_tables(part, parent)?;
        }

        Ok(alias)
    }

    /// The (dataset, table) scope after traversing `part`.
    fn next_tables(
        &self,
        part: &FieldPathPart<'a>,
        current: (&'a Dataset, &'a Table),
    ) -> Result<(&'a Dataset, &'a Table)> {
        if part.reverse.is_some() {
            return Ok((part.dataset, part.table));
        }
        if part.field.is_relation() {
            return self.relation_target(part);
        }
        // Nested tables and object subfields keep the schema scope.
        Ok(current)
    }

    fn add_join(
        &self,
        part: &FieldPathPart<'a>,
        parent_alias: &str,
        prefix: &str,
        parent_dataset: &'a Dataset,
        parent_table: &'a Table,
        joins: &mut JoinState,
    ) -> Result<((&'a Dataset, &'a Table), String)> {
        if let Some(reverse) = part.reverse {
            // Reverse relation: the far table's FK points back at us.
            let (far_dataset, far_table) = (part.dataset, part.table);
            let fk_field = far_table.field(&reverse.field).ok_or_else(|| {
                ApiError::schema(format!(
                    "missing FK field {} on {}",
                    reverse.field, far_table.id
                ))
            })?;
            let alias = joins.next_alias();
            let on = fk_join_columns(fk_field, parent_table)
                .into_iter()
                .map(|(local_col, target_field)| {
                    (
                        ColumnRef::new(&alias, local_col),
                        ColumnRef::new(parent_alias, to_snake_case(&target_field)),
                    )
                })
                .collect();
            joins.distinct = true;
            joins.push(
                prefix,
                JoinSpec {
                    kind: JoinKind::Left,
                    db_table: SchemaSnapshot::db_table_name(far_dataset, far_table),
                    alias: alias.clone(),
                    on,
                },
            );
            self.slice_joined_temporal(far_dataset, far_table, &alias, joins);
            return Ok(((far_dataset, far_table), alias));
        }

        if part.field.is_nested_table {
            // Nested table: child rows with a parent_id back-reference.
            let alias = joins.next_alias();
            let child_table = format!(
                "{}_{}",
                SchemaSnapshot::db_table_name(parent_dataset, parent_table),
                to_snake_case(&part.field.id)
            );
            joins.distinct = true;
            joins.push(
                prefix,
                JoinSpec {
                    kind: JoinKind::Left,
                    db_table: child_table,
                    alias: alias.clone(),
                    on: vec![(
                        ColumnRef::new(&alias, "parent_id"),
                        ColumnRef::new(
                            parent_alias,
                            to_snake_case(parent_table.logical_identifier()),
                        ),
                    )],
                },
            );
            return Ok(((parent_dataset, parent_table), alias));
        }

        if part.field.nm_relation.is_some() {
            // M2M: join the through table, then the target.
            let (target_dataset, target_table) = self.relation_target(part)?;
            let through_alias = joins.next_alias();
            let through_table = format!(
                "{}_{}",
                SchemaSnapshot::db_table_name(parent_dataset, parent_table),
                to_snake_case(&part.field.id)
            );
            joins.distinct = true;
            joins.push(
                &format!("{prefix}#through"),
                JoinSpec {
                    kind: JoinKind::Left,
                    db_table: through_table,
                    alias: through_alias.clone(),
                    on: vec![(
                        ColumnRef::new(
                            &through_alias,
                            format!("{}_id", to_snake_case(&parent_table.id)),
                        ),
                        ColumnRef::new(
                            parent_alias,
                            to_snake_case(parent_table.logical_identifier()),
                        ),
                    )],
                },
            );

            let target_alias = joins.next_alias();
            joins.push(
                prefix,
                JoinSpec {
                    kind: JoinKind::Left,
                    db_table: SchemaSnapshot::db_table_name(target_dataset, target_table),
                    alias: target_alias.clone(),
                    on: vec![(
                        ColumnRef::new(
                            &through_alias,
                            format!("{}_id", to_snake_case(&target_table.id)),
                        ),
                        ColumnRef::new(
                            &target_alias,
                            to_snake_case(target_table.logical_identifier()),
                        ),
                    )],
                },
            );
            self.slice_joined_temporal(target_dataset, target_table, &target_alias, joins);
            return Ok(((target_dataset, target_table), target_alias));
        }

        // Forward FK.
        let (target_dataset, target_table) = self.relation_target(part)?;
        let alias = joins.next_alias();
        let on = fk_join_columns(part.field, target_table)
            .into_iter()
            .map(|(local_col, target_field)| {
                (
                    ColumnRef::new(parent_alias, local_col),
                    ColumnRef::new(&alias, to_snake_case(&target_field)),
                )
            })
            .collect();
        joins.push(
            prefix,
            JoinSpec {
                kind: JoinKind::Left,
                db_table: SchemaSnapshot::db_table_name(target_dataset, target_table),
                alias: alias.clone(),
                on,
            },
        );
        // A loose relation binds no sequence, so the slice picks one.
        if part.field.is_loose_relation || target_table.is_temporal() {
            self.slice_joined_temporal(target_dataset, target_table, &alias, joins);
        }
        Ok(((target_dataset, target_table), alias))
    }

    /// Apply the "latest" slice to a joined temporal table, NULL-tolerant so
    /// LEFT JOIN semantics survive.
    fn slice_joined_temporal(
        &self,
        dataset: &Dataset,
        table: &Table,
        alias: &str,
        joins: &mut JoinState,
    ) {
        let Some(descriptor) = &table.temporal else {
            return;
        };
        let db_table = SchemaSnapshot::db_table_name(dataset, table);
        let id_column = ColumnRef::new(alias, to_snake_case(table.logical_identifier()));
        for predicate in
            TemporalSlice::Latest.predicates(alias, &db_table, table, descriptor)
        {
            joins.temporal_predicates.push(Predicate::OrNull {
                column: id_column.clone(),
                inner: Box::new(predicate),
            });
        }
    }

    fn build_predicate(
        &self,
        filter: &FilterInput,
        terminal: &FieldPathPart<'a>,
        lookup: Lookup,
        column: ColumnRef,
        field_name: &str,
    ) -> Result<Predicate> {
        let field = terminal.field;
        let kind = field.kind();
        let is_pk = terminal.table.identifier.contains(&field.id);
        let with_field = |e: ApiError| match e {
            ApiError::InvalidValue { reason, .. } => ApiError::InvalidValue {
                field: field_name.to_string(),
                reason,
            },
            other => other,
        };

        // Lookups whose value type differs from the field type.
        match lookup {
            Lookup::IsNull => {
                let value = parse_bool(filter.raw_value()).map_err(with_field)?;
                return Ok(Predicate::IsNull {
                    column,
                    negate: !value,
                });
            }
            Lookup::IsEmpty => {
                let value = parse_bool(filter.raw_value()).map_err(with_field)?;
                return Ok(Predicate::IsEmpty {
                    column,
                    empty: value,
                });
            }
            Lookup::Like => {
                return Ok(Predicate::Like {
                    column,
                    pattern: sql_wildcards(filter.raw_value()),
                    case_insensitive: !is_pk,
                });
            }
            _ => {}
        }

        // Geometry fields parse their value with the request CRS.
        if kind.is_geo() {
            let (point, srid) =
                parse_point(filter.raw_value(), self.options.input_crs).map_err(with_field)?;
            return Ok(match lookup {
                Lookup::Contains => Predicate::GeoContains {
                    column,
                    x: point.x(),
                    y: point.y(),
                    srid,
                },
                other => Predicate::GeoEquals {
                    column,
                    x: point.x(),
                    y: point.y(),
                    srid,
                    negate: other == Lookup::Not,
                },
            });
        }

        // Relation stubs filter against the stored identifier verbatim,
        // e.g. ?ligtInBouwblokId=03630012095418.1
        let scalar_kind = if field.is_relation() && kind == FieldKind::Object {
            FieldKind::String
        } else {
            field.scalar_kind()
        };

        // Array contains: case-insensitive superset of all supplied values.
        if kind == FieldKind::Array && lookup == Lookup::Contains {
            return Ok(Predicate::ArrayContains {
                column,
                values: filter
                    .split_values()
                    .iter()
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            });
        }

        let multi_value =
            kind == FieldKind::Array || lookup.is_multi_value();
        if multi_value {
            let use_split = field.is_array_of_scalars() || lookup.splits_value();
            let raw_values: Vec<String> = if use_split {
                filter
                    .split_values()
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            } else {
                filter.raw_values.clone()
            };
            let values: Vec<SqlValue> = raw_values
                .iter()
                .map(|v| {
                    parse_scalar(scalar_kind, v)
                        .map_err(with_field)
                        .and_then(SqlValue::try_from)
                })
                .collect::<Result<_>>()?;

            return Ok(match lookup {
                Lookup::In => Predicate::In { column, values },
                Lookup::Not => Predicate::NotEqual {
                    column,
                    values,
                    case_insensitive: matches!(kind, FieldKind::String | FieldKind::Uri)
                        && !is_pk,
                },
                // Plain lookup on an array field: whole-array equality.
                _ => Predicate::ArrayEquals { column, values },
            });
        }

        let parsed = parse_scalar(scalar_kind, filter.raw_value()).map_err(with_field)?;

        // Date-only input against a datetime column compares whole days.
        if kind == FieldKind::DateTime {
            if let ParsedValue::Date(date) = parsed {
                return Ok(Predicate::CompareDate {
                    column,
                    op: lookup_compare_op(lookup)?,
                    date,
                });
            }
        }

        let value: SqlValue = parsed.try_into()?;
        match lookup {
            Lookup::Not => Ok(Predicate::NotEqual {
                column,
                values: vec![value],
                case_insensitive: matches!(kind, FieldKind::String | FieldKind::Uri) && !is_pk,
            }),
            other => Ok(Predicate::Compare {
                column,
                op: lookup_compare_op(other)?,
                value,
                case_insensitive: false,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    /// Build the SELECT list: every readable scalar/array/object/geometry
    /// field plus FK columns for links, reduced by the `_fields` projection.
    /// Identifier fields (and the temporal sequence) are always retained.
    fn select_columns(&self, fields_param: Option<&[String]>) -> Result<Vec<SelectedColumn>> {
        let projection = FieldsProjection::parse(fields_param)?;
        projection.validate_names(self.table)?;

        let mut always_keep: BTreeSet<&str> =
            self.table.identifier.iter().map(String::as_str).collect();
        if let Some(temporal) = &self.table.temporal {
            always_keep.insert(temporal.sequence_field.as_str());
        }

        let mut selected = Vec::new();
        for field in &self.table.fields {
            let kind = field.kind();

            // No physical column for M2M and nested-table fields; their data
            // arrives through prefetches.
            if field.nm_relation.is_some() || field.is_nested_table {
                continue;
            }

            let keep = always_keep.contains(field.id.as_str()) || projection.keeps(&field.id);
            if !keep {
                continue;
            }

            // Hidden fields are silently dropped; transformed fields stay
            // selected and the serializer applies the transform.
            let permission =
                has_field_access(self.snapshot, self.user, self.dataset, self.table, field);
            if !permission.is_granted() && !always_keep.contains(field.id.as_str()) {
                continue;
            }

            if field.relation.is_some() && !field.is_loose_relation {
                if let Some(related_ids) = field
                    .related_field_ids
                    .as_ref()
                    .filter(|ids| ids.len() > 1)
                {
                    // Composite temporal FK: select each subcolumn.
                    for related in related_ids {
                        selected.push(SelectedColumn {
                            field_id: format!("{}_{related}", field.id),
                            column: ColumnRef::new(
                                BASE_ALIAS,
                                format!(
                                    "{}_{}",
                                    to_snake_case(&field.id),
                                    to_snake_case(related)
                                ),
                            ),
                            kind: FieldKind::String,
                            expr: SelectExpr::Column,
                        });
                    }
                    continue;
                }
            }

            let expr = if kind.is_geo() {
                SelectExpr::GeoJson {
                    srid: self.options.response_srid,
                }
            } else {
                SelectExpr::Column
            };

            selected.push(SelectedColumn {
                field_id: field.id.clone(),
                column: ColumnRef::new(BASE_ALIAS, field.db_name()),
                kind,
                expr,
            });
        }

        Ok(selected)
    }

    // ------------------------------------------------------------------
    // Sort
    // ------------------------------------------------------------------

    fn compile_sort(&self, sort: &[String]) -> Result<Vec<(ColumnRef, SortDir)>> {
        let mut order_by = Vec::new();
        for entry in sort {
            let (name, dir) = entry
                .strip_prefix('-')
                .map_or((entry.as_str(), SortDir::Asc), |stripped| {
                    (stripped, SortDir::Desc)
                });

            let part = resolve_sort_path(self.snapshot, self.dataset, self.table, name)?;

            // Sorting on a field the caller may not read would leak data
            // through row ordering.
            let permission =
                has_field_access(self.snapshot, self.user, part.dataset, part.table, part.field);
            if permission == Permission::None {
                return Err(ApiError::access_denied(format!(
                    "You do not have permission to sort on '{name}'"
                )));
            }

            order_by.push((ColumnRef::new(BASE_ALIAS, part.field.db_name()), dir));
        }
        Ok(order_by)
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    /// Validate expansion input and list the relations to prefetch.
    fn compile_expand(&self, params: &QueryParams) -> Result<Vec<String>> {
        if params.expand_all {
            // Auto-expansion silently omits inaccessible relations.
            return Ok(self
                .expandable_relations()
                .into_iter()
                .filter(|name| self.expansion_accessible(name))
                .collect());
        }

        let mut result = Vec::new();
        for name in &params.expand_scope {
            if self
                .table
                .additional_relation(name)
                .is_some_and(|r| r.format == RelationFormat::Summary)
            {
                return Err(ApiError::InvalidExpand {
                    message: format!(
                        "The field '{name}' is not available for embedding \
                         as it's a summary of a huge listing."
                    ),
                });
            }
            if !self.expandable_relations().iter().any(|r| r == name) {
                return Err(ApiError::InvalidExpand {
                    message: format!("Eager loading is not supported for field '{name}'"),
                });
            }
            // Explicit expansion of an inaccessible relation is an error.
            if !self.expansion_accessible(name) {
                return Err(ApiError::access_denied(format!(
                    "Eager loading not allowed for field '{name}'"
                )));
            }
            result.push(name.clone());
        }
        Ok(result)
    }

    fn expandable_relations(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .fields
            .iter()
            .filter(|f| f.is_relation() || f.is_nested_table)
            .map(|f| f.id.clone())
            .collect();
        names.extend(
            self.table
                .additional_relations
                .iter()
                .filter(|r| r.format == RelationFormat::Embedded)
                .map(|r| r.id.clone()),
        );
        names
    }

    fn expansion_accessible(&self, name: &str) -> bool {
        if let Some(field) = self.table.field(name) {
            if !has_field_access(self.snapshot, self.user, self.dataset, self.table, field)
                .is_granted()
            {
                return false;
            }
            if field.is_nested_table {
                return true;
            }
            let Some(target) = field.related_table() else {
                return false;
            };
            return self.target_accessible(&target.dataset, &target.table);
        }
        if let Some(relation) = self.table.additional_relation(name) {
            return self.target_accessible(&relation.table.dataset, &relation.table.table);
        }
        false
    }

    fn target_accessible(&self, dataset_id: &str, table_id: &str) -> bool {
        let Some(dataset) = self.snapshot.dataset(dataset_id) else {
            return false;
        };
        let Some(table) = dataset.table(table_id) else {
            return false;
        };
        has_table_access(self.snapshot, self.user, dataset, table).is_granted()
    }
}

/// The `?_fields=` projection: include-list, exclude-list, or everything.
#[derive(Debug)]
enum FieldsProjection {
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl FieldsProjection {
    fn parse(fields: Option<&[String]>) -> Result<Self> {
        let Some(fields) = fields else {
            return Ok(Self::All);
        };
        let negated = fields.iter().filter(|f| f.starts_with('-')).count();
        if negated == 0 {
            return Ok(Self::Include(fields.to_vec()));
        }
        if negated == fields.len() {
            return Ok(Self::Exclude(
                fields
                    .iter()
                    .map(|f| f.trim_start_matches('-').to_string())
                    .collect(),
            ));
        }
        Err(ApiError::InvalidFields {
            message: "It's not possible to combine inclusions and exclusions \
                      in the _fields parameter"
                .to_string(),
        })
    }

    fn validate_names(&self, table: &Table) -> Result<()> {
        let names = match self {
            Self::All => return Ok(()),
            Self::Include(names) | Self::Exclude(names) => names,
        };
        for name in names {
            if table.field(name).is_none() {
                return Err(ApiError::InvalidFields {
                    message: format!("'{name}' is not one of the available options"),
                });
            }
        }
        Ok(())
    }

    fn keeps(&self, field_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Include(names) => names.iter().any(|n| n == field_id),
            Self::Exclude(names) => !names.iter().any(|n| n == field_id),
        }
    }
}

/// The local FK columns of a relation field, paired with the target field
/// each column references.
fn fk_join_columns(field: &Field, target: &Table) -> Vec<(String, String)> {
    let fk = to_snake_case(&field.id);
    if field.is_loose_relation {
        return vec![(format!("{fk}_id"), target.logical_identifier().to_string())];
    }
    if let Some(related_ids) = &field.related_field_ids {
        if target.is_temporal() && related_ids.len() > 1 {
            return related_ids
                .iter()
                .map(|id| (format!("{fk}_{}", to_snake_case(id)), id.clone()))
                .collect();
        }
    }
    vec![(format!("{fk}_id"), target.logical_identifier().to_string())]
}

/// Translate the API wildcard syntax to SQL LIKE syntax.
///
/// `%` and `_` are escaped first, then `*` becomes `%` and `?` becomes `_`.
fn sql_wildcards(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace('*', "%")
        .replace('?', "_")
}

fn lookup_compare_op(lookup: Lookup) -> Result<CompareOp> {
    match lookup {
        Lookup::Exact => Ok(CompareOp::Eq),
        Lookup::Gt => Ok(CompareOp::Gt),
        Lookup::Gte => Ok(CompareOp::Gte),
        Lookup::Lt => Ok(CompareOp::Lt),
        Lookup::Lte => Ok(CompareOp::Lte),
        other => Err(ApiError::internal(format!(
            "lookup {other:?} has no comparison operator"
        ))),
    }
}
