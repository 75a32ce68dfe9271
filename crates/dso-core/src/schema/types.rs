//! Schema descriptor types - owned data, deserialized from Amsterdam Schema JSON.
//!
//! # Snapshot freeze invariant
//!
//! After [`SchemaSnapshot::from_documents`], the snapshot is frozen:
//! - All data is owned; relation edges are `(dataset, table)` identifiers,
//!   never references, so cyclic schemas (reverse relations) need no pointers.
//! - Safe to share between request handlers without locking.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::Deserialize;

use dso_error::{ApiError, Result};

use super::names::to_snake_case;

/// The scope that every caller implicitly holds.
pub const PUBLIC_SCOPE: &str = "OPENBAAR";

/// A set of OAuth scopes guarding a schema node.
pub type ScopeSet = BTreeSet<String>;

/// Deserialize `auth` fields that may be a single string or a list.
fn de_scope_set<'de, D>(deserializer: D) -> std::result::Result<ScopeSet, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let scopes = match Option::<OneOrMany>::deserialize(deserializer)? {
        None => ScopeSet::new(),
        Some(OneOrMany::One(scope)) => std::iter::once(scope).collect(),
        Some(OneOrMany::Many(scopes)) => scopes.into_iter().collect(),
    };
    // The public scope is the absence of a requirement.
    Ok(scopes
        .into_iter()
        .filter(|s| s != PUBLIC_SCOPE)
        .collect())
}

/// Reference to a table in (possibly another) dataset, written as
/// `"dataset:table"` in schema files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub dataset: String,
    pub table:   String,
}

impl<'de> Deserialize<'de> for TableRef {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.split_once(':') {
            Some((dataset, table)) => Ok(Self {
                dataset: dataset.to_string(),
                table:   table.to_string(),
            }),
            None => Err(serde::de::Error::custom(format!(
                "relation '{raw}' is not in 'dataset:table' form"
            ))),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dataset, self.table)
    }
}

/// One bitemporal axis: the start/end fields bounding a validity range.
#[derive(Debug, Clone, Deserialize)]
pub struct TemporalDimension {
    pub start: String,
    pub end:   String,
}

/// Temporal descriptor of a table.
///
/// A table is temporal iff this is present on it. `sequence_field` orders the
/// versions of one logical identifier; `dimensions` name the query parameters
/// that select a validity slice (e.g. `geldigOp`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Temporal {
    #[serde(rename = "identifier")]
    pub sequence_field: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, TemporalDimension>,
}

/// Item descriptor for array-typed fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayItems {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub format: Option<String>,
}

/// The effective value type of a field, derived from its raw `type`/`format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
    Time,
    Uri,
    Array,
    Object,
    GeoPoint,
    GeoPolygon,
    GeoMultiPolygon,
    /// Any other geometry ($ref) type.
    GeoOther,
}

impl FieldKind {
    /// Whether this is a geometry kind.
    #[must_use]
    pub const fn is_geo(self) -> bool {
        matches!(
            self,
            Self::GeoPoint | Self::GeoPolygon | Self::GeoMultiPolygon | Self::GeoOther
        )
    }
}

/// A field of a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: String,

    /// The raw JSON-schema type, e.g. `string`, or a geometry `$ref` URL.
    #[serde(rename = "type", default)]
    pub field_type: String,

    #[serde(default)]
    pub format: Option<String>,

    #[serde(default, deserialize_with = "de_scope_set")]
    pub auth: ScopeSet,

    /// Forward foreign key to another table.
    #[serde(default)]
    pub relation: Option<TableRef>,

    /// Many-to-many relation through an implicit junction table.
    #[serde(default)]
    pub nm_relation: Option<TableRef>,

    /// Identifier parts of the relation target stored locally as FK columns.
    #[serde(default)]
    pub related_field_ids: Option<Vec<String>>,

    /// A loose relation stores only the target's logical identifier,
    /// deliberately unbound to a temporal sequence.
    #[serde(default)]
    pub is_loose_relation: bool,

    /// An array-of-object field materialized as a child table with a
    /// `parent_id` column (e.g. `parkeervakken.regimes`).
    #[serde(default)]
    pub is_nested_table: bool,

    /// Sub-fields for `object`-typed fields.
    #[serde(default)]
    pub subfields: Vec<Field>,

    /// Item type for `array`-typed fields.
    #[serde(default)]
    pub items: Option<ArrayItems>,

    #[serde(default)]
    pub description: Option<String>,
}

impl Field {
    /// The effective kind, folding `format` variants and geometry refs.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        if let Some(geo) = self.field_type.strip_prefix("https://geojson.org/schema/") {
            return match geo {
                "Point.json" => FieldKind::GeoPoint,
                "Polygon.json" => FieldKind::GeoPolygon,
                "MultiPolygon.json" => FieldKind::GeoMultiPolygon,
                _ => FieldKind::GeoOther,
            };
        }
        match (self.field_type.as_str(), self.format.as_deref()) {
            ("string", Some("date")) => FieldKind::Date,
            ("string", Some("date-time")) => FieldKind::DateTime,
            ("string", Some("time")) => FieldKind::Time,
            ("string", Some("uri")) | ("uri", _) => FieldKind::Uri,
            ("integer", _) => FieldKind::Integer,
            ("number", _) => FieldKind::Number,
            ("boolean", _) => FieldKind::Boolean,
            ("array", _) => FieldKind::Array,
            ("object", _) => FieldKind::Object,
            _ => FieldKind::String,
        }
    }

    /// Whether the field is a forward relation (FK or M2M).
    #[must_use]
    pub fn is_relation(&self) -> bool {
        self.relation.is_some() || self.nm_relation.is_some()
    }

    /// The relation target, for both FK and M2M relations.
    #[must_use]
    pub fn related_table(&self) -> Option<&TableRef> {
        self.relation.as_ref().or(self.nm_relation.as_ref())
    }

    /// Whether the array items are scalars (as opposed to objects).
    #[must_use]
    pub fn is_array_of_scalars(&self) -> bool {
        self.kind() == FieldKind::Array
            && self
                .items
                .as_ref()
                .is_some_and(|items| items.item_type != "object")
    }

    /// The scalar kind used to parse filter values for this field.
    ///
    /// For arrays this is the item kind; for everything else the field kind.
    #[must_use]
    pub fn scalar_kind(&self) -> FieldKind {
        if let Some(items) = &self.items {
            return match (items.item_type.as_str(), items.format.as_deref()) {
                ("string", Some("date")) => FieldKind::Date,
                ("string", Some("date-time")) => FieldKind::DateTime,
                ("string", Some("time")) => FieldKind::Time,
                ("integer", _) => FieldKind::Integer,
                ("number", _) => FieldKind::Number,
                ("boolean", _) => FieldKind::Boolean,
                _ => FieldKind::String,
            };
        }
        self.kind()
    }

    /// Physical column name for this field.
    #[must_use]
    pub fn db_name(&self) -> String {
        if self.relation.is_some() {
            format!("{}_id", to_snake_case(&self.id))
        } else {
            to_snake_case(&self.id)
        }
    }
}

/// Output style of a reverse relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationFormat {
    /// Full embeddable listing.
    Embedded,
    /// Only `{count, href}` with a pre-built filter query.
    Summary,
}

/// A reverse relation declared on the schema but not present as a column.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalRelation {
    pub id: String,
    /// The table holding the foreign key pointing back at us.
    pub table: TableRef,
    /// The FK field on that table.
    pub field: String,
    #[serde(default = "default_relation_format")]
    pub format: RelationFormat,
}

const fn default_relation_format() -> RelationFormat {
    RelationFormat::Summary
}

/// A table of a dataset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,

    #[serde(default, deserialize_with = "de_scope_set")]
    pub auth: ScopeSet,

    /// Composite natural key. Defaults to `["id"]`.
    #[serde(default = "default_identifier")]
    pub identifier: Vec<String>,

    #[serde(default)]
    pub temporal: Option<Temporal>,

    pub fields: Vec<Field>,

    #[serde(default)]
    pub additional_relations: Vec<AdditionalRelation>,

    /// Zoom window within which non-identifier fields appear in vector tiles.
    #[serde(default = "default_min_zoom")]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,

    /// Set on the implicit junction tables materializing M2M relations.
    #[serde(default)]
    pub through_table: bool,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_identifier() -> Vec<String> {
    vec!["id".to_string()]
}

const fn default_min_zoom() -> u8 {
    15
}

const fn default_max_zoom() -> u8 {
    30
}

impl Table {
    /// Whether this table keeps historical versions of its rows.
    #[must_use]
    pub fn is_temporal(&self) -> bool {
        self.temporal.is_some()
    }

    /// Find a field by its (camelCase) id.
    #[must_use]
    pub fn field(&self, id: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Find an additional (reverse) relation by id.
    #[must_use]
    pub fn additional_relation(&self, id: &str) -> Option<&AdditionalRelation> {
        self.additional_relations.iter().find(|r| r.id == id)
    }

    /// The identifier fields, in declaration order.
    #[must_use]
    pub fn identifier_fields(&self) -> Vec<&Field> {
        self.identifier
            .iter()
            .filter_map(|id| self.field(id))
            .collect()
    }

    /// The first (grouping) identifier part. For temporal tables this is the
    /// logical identifier; the sequence field is excluded.
    #[must_use]
    pub fn logical_identifier(&self) -> &str {
        let sequence = self.temporal.as_ref().map(|t| t.sequence_field.as_str());
        self.identifier
            .iter()
            .find(|part| Some(part.as_str()) != sequence)
            .map_or("id", String::as_str)
    }

    /// The main geometry field, if any.
    #[must_use]
    pub fn main_geometry_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.kind().is_geo())
    }

    /// Whether any field is a geometry.
    #[must_use]
    pub fn has_geometry(&self) -> bool {
        self.main_geometry_field().is_some()
    }
}

/// A dataset: a named collection of tables with a shared auth boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default = "default_dataset_version")]
    pub version: String,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default, deserialize_with = "de_scope_set")]
    pub auth: ScopeSet,

    /// URL path segment; defaults to the snake-cased id.
    #[serde(default)]
    pub path: Option<String>,

    /// When set, requests are proxied to this upstream endpoint instead of
    /// hitting the local database. May contain a `{table_id}` placeholder.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Forward the caller's Authorization header to the upstream endpoint.
    #[serde(default)]
    pub forward_auth: bool,

    pub tables: Vec<Table>,
}

fn default_dataset_version() -> String {
    "v1".to_string()
}

fn default_status() -> String {
    "beschikbaar".to_string()
}

impl Dataset {
    /// Find a table by id.
    #[must_use]
    pub fn table(&self, id: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    /// The URL path segment for this dataset.
    #[must_use]
    pub fn url_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| to_snake_case(&self.id))
    }

    /// Whether this dataset is served by a remote endpoint.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.endpoint_url.is_some()
    }
}

/// Field permission granted by the schema or a profile.
///
/// Ordered from most to least restrictive, so combining multiple active
/// profiles is `max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Permission {
    /// No access.
    #[default]
    None,
    /// Read, transformed to the first N characters.
    Letters(u32),
    /// Full read access.
    Read,
}

impl Permission {
    /// Whether any level of access is granted.
    #[must_use]
    pub const fn is_granted(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Apply the permission's transform to an output value.
    #[must_use]
    pub fn transform(self, value: serde_json::Value) -> serde_json::Value {
        match self {
            Self::Letters(n) => match value {
                serde_json::Value::String(s) => {
                    serde_json::Value::String(s.chars().take(n as usize).collect())
                }
                other => other,
            },
            _ => value,
        }
    }

    /// Parse a profile permission string: `read` or `letters:N`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "read" {
            return Ok(Self::Read);
        }
        if let Some(n) = raw.strip_prefix("letters:") {
            let n: u32 = n.parse().map_err(|_| {
                ApiError::schema(format!("invalid permission transform: {raw}"))
            })?;
            return Ok(Self::Letters(n));
        }
        Err(ApiError::schema(format!("unknown permission: {raw}")))
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

/// Per-table grants of a profile.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTable {
    /// The profile activates when at least one of these sets is fully
    /// covered by the filter keys present on the request.
    #[serde(default)]
    pub mandatory_filter_sets: Vec<Vec<String>>,

    #[serde(default)]
    pub fields: BTreeMap<String, Permission>,
}

/// Per-dataset grants of a profile.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDataset {
    #[serde(default)]
    pub tables: BTreeMap<String, ProfileTable>,
}

/// A policy object granting conditional access.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,

    /// All of these scopes must be held for the profile to be considered.
    #[serde(default, deserialize_with = "de_scope_set")]
    pub scopes: ScopeSet,

    #[serde(default)]
    pub datasets: BTreeMap<String, ProfileDataset>,
}

/// A frozen, shareable view of all loaded schemas and profiles.
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    datasets: IndexMap<String, Dataset>,
    profiles: Vec<Profile>,
    /// Dataset ids keyed by URL path, for router dispatch.
    paths: BTreeMap<String, String>,
}

impl SchemaSnapshot {
    /// Build a snapshot from parsed dataset and profile documents.
    ///
    /// # Errors
    ///
    /// Returns `Schema` errors for duplicate ids or dangling relation targets.
    pub fn from_documents(datasets: Vec<Dataset>, profiles: Vec<Profile>) -> Result<Self> {
        let mut map = IndexMap::new();
        let mut paths = BTreeMap::new();
        for dataset in datasets {
            if map.contains_key(&dataset.id) {
                return Err(ApiError::schema(format!(
                    "duplicate dataset id: {}",
                    dataset.id
                )));
            }
            paths.insert(dataset.url_path(), dataset.id.clone());
            map.insert(dataset.id.clone(), dataset);
        }

        let snapshot = Self {
            datasets: map,
            profiles,
            paths,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Validate internal consistency: every relation edge must resolve.
    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        for dataset in self.datasets.values() {
            for table in &dataset.tables {
                for field in &table.fields {
                    if let Some(target) = field.related_table() {
                        if self.table(&target.dataset, &target.table).is_none() {
                            errors.push(format!(
                                "{}.{}.{} references undefined table '{target}'",
                                dataset.id, table.id, field.id
                            ));
                        }
                    }
                }
                for relation in &table.additional_relations {
                    if self.table(&relation.table.dataset, &relation.table.table).is_none() {
                        errors.push(format!(
                            "{}.{} additional relation '{}' references undefined table '{}'",
                            dataset.id, table.id, relation.id, relation.table
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::schema(errors.join("; ")))
        }
    }

    /// Get a dataset by id.
    #[must_use]
    pub fn dataset(&self, id: &str) -> Option<&Dataset> {
        self.datasets.get(id)
    }

    /// Get a dataset by URL path segment.
    #[must_use]
    pub fn dataset_by_path(&self, path: &str) -> Option<&Dataset> {
        self.paths.get(path).and_then(|id| self.datasets.get(id))
    }

    /// Get a table by dataset and table id.
    #[must_use]
    pub fn table(&self, dataset_id: &str, table_id: &str) -> Option<&Table> {
        self.dataset(dataset_id).and_then(|d| d.table(table_id))
    }

    /// All datasets, in load order.
    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    /// All loaded profiles.
    #[must_use]
    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Physical table name for a dataset/table pair.
    #[must_use]
    pub fn db_table_name(dataset: &Dataset, table: &Table) -> String {
        format!(
            "{}_{}",
            to_snake_case(&dataset.id),
            to_snake_case(&table.id)
        )
    }
}
