//! Vector tile endpoints: `.pbf` tiles and the TileJSON descriptor.

use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use dso_core::auth::{check_filter_access, check_table_access, UserScopes};
use dso_core::plan::{PlannerOptions, QueryParams};
use dso_core::render::mvt::{fetch_tile, tile_plan, tilejson, MVT_CONTENT_TYPE};
use dso_core::schema::to_snake_case;
use dso_error::ApiError;

use crate::error::AppError;
use crate::extract::{granted_scopes, parse_query_string};
use crate::state::AppState;

/// GET `/<version>/mvt/<dataset>/<table>/<z>/<x>/<y>.pbf`
pub async fn tile(
    State(state): State<AppState>,
    Path((dataset_path, table_path, z, x, y_pbf)): Path<(String, String, u32, u32, String)>,
    RawQuery(raw_query): RawQuery,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let self_url = format!("{}{}", state.config.public_base_url(), uri);
    let with_uri = |e: ApiError| AppError::new(e, self_url.clone());

    let y: u32 = y_pbf
        .strip_suffix(".pbf")
        .and_then(|y| y.parse().ok())
        .ok_or_else(|| with_uri(ApiError::not_found("Tiles are served as <y>.pbf")))?;

    let snapshot = state.registry.snapshot();
    let dataset = snapshot
        .dataset_by_path(&dataset_path)
        .ok_or_else(|| with_uri(ApiError::not_found(format!("Unknown dataset: '{dataset_path}'"))))?;
    let table = dataset
        .tables
        .iter()
        .find(|t| to_snake_case(&t.id) == table_path)
        .ok_or_else(|| {
            with_uri(ApiError::not_found(format!(
                "Invalid table: {dataset_path}.{table_path}"
            )))
        })?;

    let pairs = parse_query_string(raw_query.as_deref().unwrap_or(""));
    let params = QueryParams::parse(&pairs).map_err(with_uri)?;
    let user = UserScopes::new(
        granted_scopes(&headers),
        pairs.iter().map(|(key, _)| key.clone()),
    );

    check_table_access(&snapshot, &user, dataset, table, "GET", uri.path())
        .map_err(with_uri)?;
    check_filter_access(&snapshot, &user, dataset, table, &params.filters)
        .map_err(with_uri)?;

    let options = PlannerOptions {
        input_crs: None,
        response_srid: 3857,
        default_page_size: state.config.pagination.default_page_size,
        max_page_size: state.config.pagination.max_page_size,
    };
    let zoom = u8::try_from(z).unwrap_or(u8::MAX);
    let (plan, geometry_column) =
        tile_plan(&snapshot, dataset, table, &user, &params, options, zoom).map_err(with_uri)?;

    let tile_bytes = fetch_tile(
        &state.executor,
        &plan,
        &table.id,
        &geometry_column,
        z,
        x,
        y,
    )
    .await
    .map_err(with_uri)?;

    let content_type = [(header::CONTENT_TYPE, MVT_CONTENT_TYPE)];
    match tile_bytes {
        // An empty tile is a valid answer, not an error.
        None => Ok((StatusCode::NO_CONTENT, content_type).into_response()),
        Some(bytes) => Ok((StatusCode::OK, content_type, bytes).into_response()),
    }
}

/// GET `/<version>/mvt/<dataset>/tilejson.json`
pub async fn tilejson_endpoint(
    State(state): State<AppState>,
    Path(dataset_path): Path<String>,
    OriginalUri(uri): OriginalUri,
) -> Result<Json<serde_json::Value>, AppError> {
    let self_url = format!("{}{}", state.config.public_base_url(), uri);

    let snapshot = state.registry.snapshot();
    let dataset = snapshot.dataset_by_path(&dataset_path).ok_or_else(|| {
        AppError::new(
            ApiError::not_found(format!("Unknown dataset: '{dataset_path}'")),
            self_url.clone(),
        )
    })?;

    if !dataset.tables.iter().any(dso_core::schema::Table::has_geometry) {
        return Err(AppError::new(
            ApiError::not_found(format!(
                "Dataset {dataset_path} does not have tables with geometry"
            )),
            self_url,
        ));
    }

    Ok(Json(tilejson(
        &state.config.public_base_url(),
        &state.config.version,
        dataset,
    )))
}
