//! Mapbox Vector Tile rendering.
//!
//! The tile is produced entirely inside PostGIS (`ST_AsMVTGeom`/`ST_AsMVT`):
//! filters, authorization pruning and the temporal slice apply as in any
//! listing, the geometry is clipped to the tile envelope, and the encoded
//! protobuf comes back as one `bytea`. An empty tile renders as 204.

use dso_error::{ApiError, Result};

use crate::auth::{has_field_access, UserScopes};
use crate::plan::{
    ColumnRef, Planner, PlannerOptions, QueryParams, QueryPlan, SelectExpr, SelectedColumn,
    SqlGenerator,
};
use crate::crs::{AMSTERDAM_BOUNDS, DAM_SQUARE};
use crate::db::QueryExecutor;
use crate::schema::{Dataset, SchemaSnapshot, Table};

/// The MVT content type.
pub const MVT_CONTENT_TYPE: &str = "application/vnd.mapbox-vector-tile";

/// TileJSON zoom range served by the tile endpoints.
pub const TILE_MIN_ZOOM: u8 = 7;
pub const TILE_MAX_ZOOM: u8 = 15;

/// Build the plan for one tile request.
///
/// Identifier fields are always included as properties; other fields only
/// when the caller may read them and the zoom is inside the table's
/// min/max-zoom window. The main geometry stays out of the property set (it
/// IS the feature geometry).
///
/// # Errors
///
/// `NotFound` when the table has no geometry, `AccessDenied` when the caller
/// cannot read the geometry field.
pub fn tile_plan(
    snapshot: &SchemaSnapshot,
    dataset: &Dataset,
    table: &Table,
    user: &UserScopes,
    params: &QueryParams,
    options: PlannerOptions,
    zoom: u8,
) -> Result<(QueryPlan, String)> {
    let geometry_field = table
        .main_geometry_field()
        .ok_or_else(|| ApiError::not_found(format!("Table {} has no geometry", table.id)))?;

    // Reading a tile is pointless without access to its geometry.
    if !has_field_access(snapshot, user, dataset, table, geometry_field).is_granted() {
        return Err(ApiError::access_denied(format!(
            "No access to geometry of {}.{}",
            dataset.id, table.id
        )));
    }

    let planner = Planner::new(snapshot, dataset, table, user, options);
    let mut plan = planner.plan_list(params, false)?;

    let include_attributes = zoom >= table.min_zoom && zoom <= table.max_zoom;
    let mut selected: Vec<SelectedColumn> = Vec::new();
    for field in &table.fields {
        if field.kind().is_geo() || field.is_nested_table || field.nm_relation.is_some() {
            continue;
        }
        let is_identifier = table.identifier.contains(&field.id);
        if !is_identifier {
            if !include_attributes {
                continue;
            }
            if !has_field_access(snapshot, user, dataset, table, field).is_granted() {
                continue;
            }
        }
        selected.push(SelectedColumn {
            field_id: field.id.clone(),
            column: ColumnRef::new(&plan.base_alias, field.db_name()),
            kind: field.kind(),
            expr: SelectExpr::Column,
        });
    }
    plan.selected = selected;
    plan.prefetch.clear();

    Ok((plan, geometry_field.db_name()))
}

/// Execute the tile query; `None` means an empty tile (HTTP 204).
pub async fn fetch_tile(
    executor: &QueryExecutor,
    plan: &QueryPlan,
    layer: &str,
    geometry_column: &str,
    z: u32,
    x: u32,
    y: u32,
) -> Result<Option<Vec<u8>>> {
    let query = SqlGenerator::new().tile(plan, layer, geometry_column, z, x, y)?;
    executor.fetch_tile(query).await
}

/// The TileJSON document for a dataset's geo tables.
#[must_use]
pub fn tilejson(
    base_url: &str,
    version: &str,
    dataset: &Dataset,
) -> serde_json::Value {
    let geo_tables: Vec<&Table> = dataset.tables.iter().filter(|t| t.has_geometry()).collect();

    let tiles: Vec<String> = geo_tables
        .iter()
        .map(|table| {
            format!(
                "{base_url}/{version}/mvt/{}/{}/{{z}}/{{x}}/{{y}}.pbf",
                dataset.url_path(),
                crate::schema::to_snake_case(&table.id)
            )
        })
        .collect();

    let vector_layers: Vec<serde_json::Value> = geo_tables
        .iter()
        .map(|table| {
            let fields: serde_json::Map<String, serde_json::Value> = table
                .fields
                .iter()
                .filter(|f| f.id != "schema" && !f.kind().is_geo())
                .map(|f| {
                    let description = f
                        .description
                        .clone()
                        .unwrap_or_else(|| f.field_type.clone());
                    (f.id.clone(), serde_json::Value::String(description))
                })
                .collect();
            serde_json::json!({
                "id": table.id,
                "fields": fields,
                "minzoom": TILE_MIN_ZOOM,
                "maxzoom": TILE_MAX_ZOOM,
                "description": table.description.clone().unwrap_or_default(),
            })
        })
        .collect();

    serde_json::json!({
        "tilejson": "3.0.0",
        "name": dataset.title.clone().unwrap_or_else(|| dataset.id.clone()),
        "tiles": tiles,
        "minzoom": TILE_MIN_ZOOM,
        "maxzoom": TILE_MAX_ZOOM,
        "bounds": AMSTERDAM_BOUNDS,
        "center": DAM_SQUARE,
        "vector_layers": vector_layers,
    })
}
