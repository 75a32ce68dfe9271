//! The per-table serializer tree.
//!
//! A serializer is built once per request from the schema descriptor and the
//! caller's permissions, then applied to every row. It produces the DSO
//! HAL-JSON shape: `_links` (self, schema, relations), the body (readable
//! scalar values, with profile transforms applied), and embedded relation
//! rows for the renderer to place.
//!
//! Cycle avoidance: when a child serializer is built for a relation edge, the
//! edge is pushed on a stack and any child link that resolves straight back
//! over it is elided. Recursion depth is capped to survive pathological
//! schemas.

use serde_json::{json, Map, Value};

use crate::auth::{has_field_access, UserScopes};
use crate::db::DataRow;
use crate::schema::{
    to_snake_case, AdditionalRelation, Dataset, Field, Permission, RelationFormat,
    SchemaSnapshot, Table,
};

/// Maximum relation expansion depth.
const MAX_EMBED_DEPTH: usize = 10;

/// Request-scoped data every serializer shares.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub snapshot: &'a SchemaSnapshot,
    pub user:     &'a UserScopes,
    /// Scheme+host of this server, no trailing slash.
    pub base_url: String,
    /// URL version segment, e.g. `v1`.
    pub version: String,
}

impl RenderContext<'_> {
    /// The canonical listing URL of a table.
    #[must_use]
    pub fn table_url(&self, dataset: &Dataset, table: &Table) -> String {
        format!(
            "{}/{}/{}/{}/",
            self.base_url,
            self.version,
            dataset.url_path(),
            to_snake_case(&table.id)
        )
    }

    /// The canonical detail URL of a row.
    #[must_use]
    pub fn detail_url(&self, dataset: &Dataset, table: &Table, id: &str) -> String {
        format!(
            "{}{}/",
            self.table_url(dataset, table),
            urlencoding::encode(id)
        )
    }
}

/// One traversed relation edge, for cycle elision in child serializers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ViaEdge {
    dataset:  String,
    table:    String,
    /// The FK field id that was traversed.
    fk_field: String,
}

/// A serializer for one table under one request's permissions.
pub struct Serializer<'a> {
    ctx:     &'a RenderContext<'a>,
    dataset: &'a Dataset,
    table:   &'a Table,
    /// Relations to render into `_embedded`.
    expand: Vec<String>,
    depth: usize,
    via: Vec<ViaEdge>,
}

impl<'a> Serializer<'a> {
    #[must_use]
    pub fn new(
        ctx: &'a RenderContext<'a>,
        dataset: &'a Dataset,
        table: &'a Table,
        expand: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            dataset,
            table,
            expand,
            depth: 0,
            via: Vec::new(),
        }
    }

    fn child(
        &self,
        dataset: &'a Dataset,
        table: &'a Table,
        via: ViaEdge,
    ) -> Serializer<'a> {
        let mut stack = self.via.clone();
        stack.push(via);
        Serializer {
            ctx: self.ctx,
            dataset,
            table,
            expand: Vec::new(),
            depth: self.depth + 1,
            via: stack,
        }
    }

    /// The serialized object for one row: `_links` plus the body.
    ///
    /// Embedded relations are returned separately by [`Self::render_embedded`]
    /// so the renderer can place them per the output format.
    #[must_use]
    pub fn render_row(&self, row: &DataRow) -> Value {
        let mut object = Map::new();
        object.insert("_links".to_string(), self.render_links(row));

        for field in &self.table.fields {
            // Relations live in _links; M2M and reverse need no body entry.
            if field.is_relation() {
                continue;
            }

            if field.is_nested_table {
                if let Some(children) = row.embedded.get(&field.id) {
                    let rendered: Vec<Value> = children
                        .iter()
                        .map(|child| self.render_nested(field, child))
                        .collect();
                    object.insert(field.id.clone(), Value::Array(rendered));
                }
                continue;
            }

            let permission =
                has_field_access(self.ctx.snapshot, self.ctx.user, self.dataset, self.table, field);
            if !permission.is_granted() {
                continue;
            }

            let value = row.values.get(&field.id).cloned().unwrap_or(Value::Null);
            object.insert(field.id.clone(), permission.transform(value));
        }

        Value::Object(object)
    }

    /// Nested-table child rows render as plain objects, no `_links`.
    fn render_nested(&self, field: &Field, child: &DataRow) -> Value {
        let mut object = Map::new();
        for sub in &field.subfields {
            let value = child.values.get(&sub.id).cloned().unwrap_or(Value::Null);
            object.insert(sub.id.clone(), value);
        }
        Value::Object(object)
    }

    /// The `_embedded` entries this row contributes, keyed by relation name.
    #[must_use]
    pub fn render_embedded(&self, row: &DataRow) -> Vec<(String, Vec<Value>)> {
        if self.depth >= MAX_EMBED_DEPTH {
            return Vec::new();
        }

        let mut result = Vec::new();
        for name in &self.expand {
            let Some(children) = row.embedded.get(name) else {
                continue;
            };

            let rendered: Option<Vec<Value>> = if let Some(field) = self.table.field(name) {
                if field.is_nested_table {
                    // Already rendered inline in the body.
                    continue;
                }
                self.relation_target(field).map(|(ds, tbl)| {
                    let child = self.child(
                        ds,
                        tbl,
                        ViaEdge {
                            dataset:  self.dataset.id.clone(),
                            table:    self.table.id.clone(),
                            fk_field: field.id.clone(),
                        },
                    );
                    children.iter().map(|c| child.render_row(c)).collect()
                })
            } else {
                self.table.additional_relation(name).and_then(|relation| {
                    let ds = self.ctx.snapshot.dataset(&relation.table.dataset)?;
                    let tbl = ds.table(&relation.table.table)?;
                    let child = self.child(
                        ds,
                        tbl,
                        ViaEdge {
                            dataset:  relation.table.dataset.clone(),
                            table:    relation.table.table.clone(),
                            fk_field: relation.field.clone(),
                        },
                    );
                    Some(children.iter().map(|c| child.render_row(c)).collect())
                })
            };

            if let Some(rendered) = rendered {
                result.push((name.clone(), rendered));
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // _links
    // ------------------------------------------------------------------

    fn render_links(&self, row: &DataRow) -> Value {
        let mut links = Map::new();

        links.insert("self".to_string(), self.self_link(row));
        links.insert(
            "schema".to_string(),
            Value::String(format!(
                "https://schemas.data.amsterdam.nl/datasets/{}/dataset#{}",
                self.dataset.url_path(),
                self.table.id
            )),
        );

        for field in &self.table.fields {
            if !field.is_relation() || self.elided(field) {
                continue;
            }
            let permission = has_field_access(
                self.ctx.snapshot,
                self.ctx.user,
                self.dataset,
                self.table,
                field,
            );
            if !permission.is_granted() {
                continue;
            }

            if field.nm_relation.is_some() {
                // M2M: an array of link objects from the prefetched rows.
                if let Some(children) = row.embedded.get(&field.id) {
                    if let Some((ds, tbl)) = self.relation_target(field) {
                        let entries: Vec<Value> = children
                            .iter()
                            .map(|child| self.row_link(ds, tbl, &child.values))
                            .collect();
                        links.insert(field.id.clone(), Value::Array(entries));
                    }
                }
                continue;
            }

            if let Some(link) = self.forward_link(field, row) {
                links.insert(field.id.clone(), link);
            }
        }

        for relation in &self.table.additional_relations {
            if self.elided_reverse(relation) {
                continue;
            }
            match relation.format {
                RelationFormat::Summary => {
                    links.insert(relation.id.clone(), self.summary_link(relation, row));
                }
                RelationFormat::Embedded => {
                    if let Some(children) = row.embedded.get(&relation.id) {
                        if let Some(ds) = self.ctx.snapshot.dataset(&relation.table.dataset) {
                            if let Some(tbl) = ds.table(&relation.table.table) {
                                let entries: Vec<Value> = children
                                    .iter()
                                    .map(|child| self.row_link(ds, tbl, &child.values))
                                    .collect();
                                links.insert(relation.id.clone(), Value::Array(entries));
                            }
                        }
                    }
                }
            }
        }

        Value::Object(links)
    }

    /// Whether a forward relation resolves straight back over the edge the
    /// parent serializer traversed.
    fn elided(&self, field: &Field) -> bool {
        self.via.last().is_some_and(|via| {
            via.dataset == self.dataset.id
                && via.table == self.table.id
                && via.fk_field == field.id
        })
    }

    /// Whether a reverse relation points back at the parent's traversed FK.
    fn elided_reverse(&self, relation: &AdditionalRelation) -> bool {
        self.via.last().is_some_and(|via| {
            via.dataset == relation.table.dataset
                && via.table == relation.table.table
                && via.fk_field == relation.field
        })
    }

    fn self_link(&self, row: &DataRow) -> Value {
        let id = self.logical_id(&row.values);
        let mut href = self.ctx.detail_url(self.dataset, self.table, &id);

        let mut link = Map::new();
        if let Some(temporal) = &self.table.temporal {
            if let Some(sequence) = row.values.get(&temporal.sequence_field) {
                if !sequence.is_null() {
                    href.push_str(&format!(
                        "?{}={}",
                        temporal.sequence_field,
                        value_text(sequence)
                    ));
                    link.insert(temporal.sequence_field.clone(), sequence.clone());
                }
            }
            link.insert(
                self.table.logical_identifier().to_string(),
                Value::String(id.clone()),
            );
        }
        link.insert("href".to_string(), Value::String(href));
        link.insert("title".to_string(), Value::String(id));
        Value::Object(link)
    }

    /// A link object for a row of `table`, used for M2M/reverse arrays.
    fn row_link(&self, dataset: &Dataset, table: &Table, values: &crate::db::Row) -> Value {
        let id = values
            .get(table.logical_identifier())
            .map(value_text)
            .unwrap_or_default();
        let mut href = self.ctx.detail_url(dataset, table, &id);

        let mut link = Map::new();
        if let Some(temporal) = &table.temporal {
            if let Some(sequence) = values.get(&temporal.sequence_field) {
                if !sequence.is_null() {
                    href.push_str(&format!(
                        "?{}={}",
                        temporal.sequence_field,
                        value_text(sequence)
                    ));
                    link.insert(temporal.sequence_field.clone(), sequence.clone());
                }
            }
            link.insert(
                table.logical_identifier().to_string(),
                Value::String(id.clone()),
            );
        }
        link.insert("href".to_string(), Value::String(href));
        link.insert("title".to_string(), Value::String(id));
        Value::Object(link)
    }

    fn forward_link(&self, field: &Field, row: &DataRow) -> Option<Value> {
        let (target_dataset, target_table) = self.relation_target(field)?;

        // Composite temporal FK: both the logical id and the sequence.
        if !field.is_loose_relation {
            if let Some(related_ids) =
                field.related_field_ids.as_ref().filter(|ids| ids.len() > 1)
            {
                let logical = target_table.logical_identifier();
                let id = row
                    .values
                    .get(&format!("{}_{logical}", field.id))
                    .map(value_text)?;
                if id.is_empty() {
                    return None;
                }
                let mut link = Map::new();
                let mut href = self.ctx.detail_url(target_dataset, target_table, &id);
                for related in related_ids {
                    if related == logical {
                        link.insert(related.clone(), Value::String(id.clone()));
                        continue;
                    }
                    if let Some(value) = row.values.get(&format!("{}_{related}", field.id)) {
                        if !value.is_null() {
                            href.push_str(&format!("?{related}={}", value_text(value)));
                            link.insert(related.clone(), value.clone());
                        }
                    }
                }
                link.insert("href".to_string(), Value::String(href));
                link.insert("title".to_string(), Value::String(id));
                return Some(Value::Object(link));
            }
        }

        // Simple or loose FK: the logical identifier alone.
        let raw = row.values.get(&field.id)?;
        if raw.is_null() {
            return None;
        }
        let id = value_text(raw);
        let mut link = Map::new();
        link.insert(
            "href".to_string(),
            Value::String(self.ctx.detail_url(target_dataset, target_table, &id)),
        );
        link.insert("title".to_string(), Value::String(id.clone()));
        if target_table.is_temporal() {
            link.insert(
                target_table.logical_identifier().to_string(),
                Value::String(id),
            );
        } else {
            let id_field = target_table.logical_identifier().to_string();
            link.insert(id_field, raw.clone());
        }
        Some(Value::Object(link))
    }

    /// `{count, href}` with a pre-built filter query string.
    fn summary_link(&self, relation: &AdditionalRelation, row: &DataRow) -> Value {
        let id = self.logical_id(&row.values);
        let mut link = Map::new();

        if let Some(ds) = self.ctx.snapshot.dataset(&relation.table.dataset) {
            if let Some(tbl) = ds.table(&relation.table.table) {
                let href = format!(
                    "{}?{}={}",
                    self.ctx.table_url(ds, tbl),
                    urlencoding::encode(&format!("{}Id", relation.field)),
                    urlencoding::encode(&id)
                );
                link.insert("href".to_string(), Value::String(href));
            }
        }
        if let Some(count) = row.summary_counts.get(&relation.id) {
            link.insert("count".to_string(), json!(count));
        }
        Value::Object(link)
    }

    fn relation_target(&self, field: &Field) -> Option<(&'a Dataset, &'a Table)> {
        let target = field.related_table()?;
        let dataset = self.ctx.snapshot.dataset(&target.dataset)?;
        let table = dataset.table(&target.table)?;
        Some((dataset, table))
    }

    /// The row's logical identifier as text.
    fn logical_id(&self, values: &crate::db::Row) -> String {
        values
            .get(self.table.logical_identifier())
            .map(value_text)
            .unwrap_or_default()
    }

    /// The fields a flat renderer (CSV) exports, in schema order.
    #[must_use]
    pub fn flat_fields(&self) -> Vec<&'a Field> {
        self.table
            .fields
            .iter()
            .filter(|field| {
                !field.is_nested_table
                    && field.nm_relation.is_none()
                    && has_field_access(
                        self.ctx.snapshot,
                        self.ctx.user,
                        self.dataset,
                        self.table,
                        field,
                    )
                    .is_granted()
            })
            .collect()
    }

    /// The table this serializer renders.
    #[must_use]
    pub fn table(&self) -> &'a Table {
        self.table
    }

    /// The dataset this serializer renders.
    #[must_use]
    pub fn dataset(&self) -> &'a Dataset {
        self.dataset
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Row;

    fn snapshot() -> SchemaSnapshot {
        let afval: Dataset = serde_json::from_value(serde_json::json!({
            "id": "afvalwegingen",
            "tables": [
                {
                    "id": "containers",
                    "fields": [
                        {"id": "id", "type": "integer"},
                        {"id": "serienummer", "type": "string"},
                        {"id": "eigenaarNaam", "type": "string"},
                        {"id": "cluster", "type": "string",
                         "relation": "afvalwegingen:clusters",
                         "relatedFieldIds": ["id"]},
                    ]
                },
                {
                    "id": "clusters",
                    "fields": [
                        {"id": "id", "type": "string"},
                        {"id": "status", "type": "string"},
                    ],
                    "additionalRelations": [
                        {"id": "containers", "table": "afvalwegingen:containers",
                         "field": "cluster", "format": "summary"}
                    ]
                }
            ]
        }))
        .unwrap();
        let gebieden: Dataset = serde_json::from_value(serde_json::json!({
            "id": "gebieden",
            "tables": [
                {
                    "id": "buurten",
                    "identifier": ["identificatie", "volgnummer"],
                    "temporal": {
                        "identifier": "volgnummer",
                        "dimensions": {
                            "geldigOp": {"start": "beginGeldigheid", "end": "eindGeldigheid"}
                        }
                    },
                    "fields": [
                        {"id": "identificatie", "type": "string"},
                        {"id": "volgnummer", "type": "integer"},
                        {"id": "naam", "type": "string"},
                        {"id": "ligtInWijk", "type": "string",
                         "relation": "gebieden:wijken",
                         "relatedFieldIds": ["identificatie", "volgnummer"]},
                    ]
                },
                {
                    "id": "wijken",
                    "identifier": ["identificatie", "volgnummer"],
                    "temporal": {"identifier": "volgnummer"},
                    "fields": [
                        {"id": "identificatie", "type": "string"},
                        {"id": "volgnummer", "type": "integer"},
                        {"id": "naam", "type": "string"},
                    ],
                    "additionalRelations": [
                        {"id": "buurt", "table": "gebieden:buurten",
                         "field": "ligtInWijk", "format": "embedded"}
                    ]
                }
            ]
        }))
        .unwrap();
        SchemaSnapshot::from_documents(vec![afval, gebieden], vec![]).unwrap()
    }

    fn row(pairs: &[(&str, Value)]) -> DataRow {
        let mut values = Row::new();
        for (key, value) in pairs {
            values.insert((*key).to_string(), value.clone());
        }
        DataRow::new(values)
    }

    #[test]
    fn test_container_links_and_body() {
        let snapshot = snapshot();
        let user = UserScopes::new([], []);
        let ctx = RenderContext {
            snapshot: &snapshot,
            user: &user,
            base_url: "http://testserver".to_string(),
            version: "v1".to_string(),
        };
        let dataset = snapshot.dataset("afvalwegingen").unwrap();
        let table = dataset.table("containers").unwrap();
        let serializer = Serializer::new(&ctx, dataset, table, vec![]);

        let rendered = serializer.render_row(&row(&[
            ("id", serde_json::json!(1)),
            ("serienummer", serde_json::json!("S123")),
            ("eigenaarNaam", serde_json::json!("Gemeente")),
            ("cluster", serde_json::json!("c1")),
        ]));

        assert_eq!(
            rendered["_links"]["self"]["href"],
            "http://testserver/v1/afvalwegingen/containers/1/"
        );
        assert_eq!(
            rendered["_links"]["cluster"]["href"],
            "http://testserver/v1/afvalwegingen/clusters/c1/"
        );
        assert_eq!(rendered["serienummer"], "S123");
        // Relations do not appear in the body.
        assert!(rendered.get("cluster").is_none());
    }

    #[test]
    fn test_temporal_self_link_carries_sequence() {
        let snapshot = snapshot();
        let user = UserScopes::new([], []);
        let ctx = RenderContext {
            snapshot: &snapshot,
            user: &user,
            base_url: "http://testserver".to_string(),
            version: "v1".to_string(),
        };
        let dataset = snapshot.dataset("gebieden").unwrap();
        let table = dataset.table("buurten").unwrap();
        let serializer = Serializer::new(&ctx, dataset, table, vec![]);

        let rendered = serializer.render_row(&row(&[
            ("identificatie", serde_json::json!("03630000000078")),
            ("volgnummer", serde_json::json!(2)),
            ("naam", serde_json::json!("AAA v2")),
            ("ligtInWijk_identificatie", serde_json::json!("03630012052035")),
            ("ligtInWijk_volgnummer", serde_json::json!(1)),
        ]));

        let self_link = &rendered["_links"]["self"];
        assert_eq!(
            self_link["href"],
            "http://testserver/v1/gebieden/buurten/03630000000078/?volgnummer=2"
        );
        assert_eq!(self_link["volgnummer"], 2);
        // The body carries identifier and sequence too.
        assert_eq!(rendered["volgnummer"], 2);
        assert_eq!(rendered["identificatie"], "03630000000078");

        // Composite FK link: logical id and sequence both appear.
        let wijk_link = &rendered["_links"]["ligtInWijk"];
        assert_eq!(
            wijk_link["href"],
            "http://testserver/v1/gebieden/wijken/03630012052035/?volgnummer=1"
        );
        assert_eq!(wijk_link["volgnummer"], 1);
        assert_eq!(wijk_link["identificatie"], "03630012052035");
    }

    #[test]
    fn test_embedded_child_elides_backlink() {
        let snapshot = snapshot();
        let user = UserScopes::new([], []);
        let ctx = RenderContext {
            snapshot: &snapshot,
            user: &user,
            base_url: "http://testserver".to_string(),
            version: "v1".to_string(),
        };
        let dataset = snapshot.dataset("gebieden").unwrap();
        let table = dataset.table("buurten").unwrap();
        let serializer =
            Serializer::new(&ctx, dataset, table, vec!["ligtInWijk".to_string()]);

        let mut parent = row(&[
            ("identificatie", serde_json::json!("03630000000078")),
            ("volgnummer", serde_json::json!(2)),
            ("ligtInWijk_identificatie", serde_json::json!("03630012052035")),
            ("ligtInWijk_volgnummer", serde_json::json!(1)),
        ]);
        parent.embedded.insert(
            "ligtInWijk".to_string(),
            vec![row(&[
                ("identificatie", serde_json::json!("03630012052035")),
                ("volgnummer", serde_json::json!(1)),
                ("naam", serde_json::json!("Centrum-West")),
            ])],
        );

        let embedded = serializer.render_embedded(&parent);
        assert_eq!(embedded.len(), 1);
        let (name, rows) = &embedded[0];
        assert_eq!(name, "ligtInWijk");

        let wijk = &rows[0];
        assert_eq!(
            wijk["_links"]["self"]["href"],
            "http://testserver/v1/gebieden/wijken/03630012052035/?volgnummer=1"
        );
        // The reverse relation walking straight back to buurten is elided.
        assert!(wijk["_links"].get("buurt").is_none());
    }

    #[test]
    fn test_hidden_field_is_dropped_from_body() {
        let afval: Dataset = serde_json::from_value(serde_json::json!({
            "id": "afvalwegingen",
            "tables": [{
                "id": "containers",
                "fields": [
                    {"id": "id", "type": "integer"},
                    {"id": "geheim", "type": "string", "auth": "GEHEIM/R"},
                ]
            }]
        }))
        .unwrap();
        let snapshot = SchemaSnapshot::from_documents(vec![afval], vec![]).unwrap();
        let user = UserScopes::new([], []);
        let ctx = RenderContext {
            snapshot: &snapshot,
            user: &user,
            base_url: "http://testserver".to_string(),
            version: "v1".to_string(),
        };
        let dataset = snapshot.dataset("afvalwegingen").unwrap();
        let table = dataset.table("containers").unwrap();
        let serializer = Serializer::new(&ctx, dataset, table, vec![]);

        let rendered = serializer.render_row(&row(&[
            ("id", serde_json::json!(1)),
            ("geheim", serde_json::json!("verborgen")),
        ]));
        assert!(rendered.get("geheim").is_none());
        assert_eq!(rendered["id"], 1);
    }

    #[test]
    fn test_summary_link() {
        let snapshot = snapshot();
        let user = UserScopes::new([], []);
        let ctx = RenderContext {
            snapshot: &snapshot,
            user: &user,
            base_url: "http://testserver".to_string(),
            version: "v1".to_string(),
        };
        let dataset = snapshot.dataset("afvalwegingen").unwrap();
        let table = dataset.table("clusters").unwrap();
        let serializer = Serializer::new(&ctx, dataset, table, vec![]);

        let mut cluster = row(&[
            ("id", serde_json::json!("c1")),
            ("status", serde_json::json!("open")),
        ]);
        cluster.summary_counts.insert("containers".to_string(), 3);

        let rendered = serializer.render_row(&cluster);
        let summary = &rendered["_links"]["containers"];
        assert_eq!(summary["count"], 3);
        assert!(summary["href"]
            .as_str()
            .unwrap()
            .starts_with("http://testserver/v1/afvalwegingen/containers/?clusterId="));
    }
}
