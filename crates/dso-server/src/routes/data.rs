//! Listing and detail endpoints, local and proxied.

use axum::body::Body;
use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use dso_core::auth::{check_filter_access, check_table_access, UserScopes};
use dso_core::crs::Crs;
use dso_core::plan::{Planner, PlannerOptions, QueryParams, SqlGenerator};
use dso_core::remote::{
    translate_params, validate_remote_response, RemoteClient, RemoteRequestContext,
};
use dso_core::render::{csv, geojson, hal, ByteStream, OutputFormat, RenderJob};
use dso_core::schema::{to_snake_case, Dataset, SchemaSnapshot, Table};
use dso_error::ApiError;

use crate::error::AppError;
use crate::extract::{accept_crs, accept_header, granted_scopes, parse_query_string};
use crate::state::AppState;

/// Resolve the dataset by URL path and the table by its snake-cased name.
fn resolve<'a>(
    snapshot: &'a SchemaSnapshot,
    dataset_path: &str,
    table_path: &str,
) -> Result<(&'a Dataset, &'a Table), ApiError> {
    let dataset = snapshot
        .dataset_by_path(dataset_path)
        .ok_or_else(|| ApiError::not_found(format!("Unknown dataset: '{dataset_path}'")))?;
    let table = dataset
        .tables
        .iter()
        .find(|t| to_snake_case(&t.id) == table_path)
        .ok_or_else(|| {
            ApiError::not_found(format!("Invalid table: {dataset_path}.{table_path}"))
        })?;
    Ok((dataset, table))
}

/// Shared request setup for list and detail handlers.
struct RequestEnv {
    params: QueryParams,
    user: UserScopes,
    format: OutputFormat,
    response_crs: Crs,
    options: PlannerOptions,
    pairs: Vec<(String, String)>,
}

fn prepare(
    state: &AppState,
    table: &Table,
    raw_query: Option<&str>,
    headers: &HeaderMap,
) -> Result<RequestEnv, ApiError> {
    let pairs = parse_query_string(raw_query.unwrap_or(""));
    let params = QueryParams::parse(&pairs)?;

    let user = UserScopes::new(
        granted_scopes(headers),
        pairs.iter().map(|(key, _)| key.clone()),
    );

    let format = OutputFormat::negotiate(params.format.as_deref(), accept_header(headers).as_deref())?;

    let crs_required = state.config.require_accept_crs && table.has_geometry();
    let input_crs = accept_crs(headers, crs_required)?;
    // GeoJSON defaults to WGS84; other formats keep the requested CRS.
    let response_crs = input_crs.unwrap_or(Crs::Wgs84);

    let options = PlannerOptions {
        input_crs,
        response_srid: response_crs.srid(),
        default_page_size: state.config.pagination.default_page_size,
        max_page_size: state.config.pagination.max_page_size,
    };

    Ok(RequestEnv {
        params,
        user,
        format,
        response_crs,
        options,
        pairs,
    })
}

fn render_job(
    state: &AppState,
    snapshot: std::sync::Arc<SchemaSnapshot>,
    dataset: &Dataset,
    table: &Table,
    env: &RequestEnv,
    plan: dso_core::plan::QueryPlan,
    self_url: String,
    total_count: Option<i64>,
) -> RenderJob {
    RenderJob {
        snapshot,
        user: env.user.clone(),
        dataset_id: dataset.id.clone(),
        table_id: table.id.clone(),
        base_url: state.config.public_base_url(),
        version: state.config.version.clone(),
        executor: state.executor.clone(),
        cache: state.cache.clone(),
        options: env.options.clone(),
        raw_params: env.pairs.clone(),
        plan,
        self_url,
        total_count,
    }
}

/// GET `/<version>/<dataset>/<table>/`
pub async fn list(
    State(state): State<AppState>,
    Path((dataset_path, table_path)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let self_url = format!("{}{}", state.config.public_base_url(), uri);
    let with_uri = |e: ApiError| AppError::new(e, self_url.clone());

    let snapshot = state.registry.snapshot();
    let (dataset, table) =
        resolve(&snapshot, &dataset_path, &table_path).map_err(with_uri)?;

    if dataset.is_remote() {
        return remote_call(&state, dataset, table, raw_query.as_deref(), &headers, None)
            .await
            .map_err(with_uri);
    }

    let env = prepare(&state, table, raw_query.as_deref(), &headers).map_err(with_uri)?;

    check_table_access(&snapshot, &env.user, dataset, table, "GET", uri.path())
        .map_err(with_uri)?;
    check_filter_access(&snapshot, &env.user, dataset, table, &env.params.filters)
        .map_err(with_uri)?;

    let paginate = !(env.format.unlimited_page_size() && env.params.page_size.is_none());
    let planner = Planner::new(&snapshot, dataset, table, &env.user, env.options.clone());
    let plan = planner.plan_list(&env.params, paginate).map_err(with_uri)?;

    let total_count = if plan.pagination.count_requested && paginate {
        let count_query = SqlGenerator::new().count(&plan).map_err(with_uri)?;
        Some(
            state
                .executor
                .fetch_count(count_query)
                .await
                .map_err(with_uri)?,
        )
    } else {
        None
    };

    let mut response_headers = HeaderMap::new();
    insert_header(&mut response_headers, header::CONTENT_TYPE, env.format.content_type());
    if table.has_geometry() {
        insert_header(&mut response_headers, "Content-Crs", &env.response_crs.to_header());
    }
    if paginate {
        insert_header(
            &mut response_headers,
            "X-Pagination-Page",
            &plan.pagination.page.to_string(),
        );
        insert_header(
            &mut response_headers,
            "X-Pagination-Limit",
            &plan.pagination.page_size.to_string(),
        );
    }
    if let Some(total) = total_count {
        insert_header(&mut response_headers, "X-Pagination-Count", &total.to_string());
        insert_header(&mut response_headers, "X-Total-Count", &total.to_string());
    }
    if env.format == OutputFormat::Csv {
        insert_header(
            &mut response_headers,
            header::CONTENT_DISPOSITION,
            &format!("attachment; filename=\"{}.csv\"", plan.db_table),
        );
    }

    let response_crs = env.response_crs;
    let job = render_job(
        &state,
        snapshot.clone(),
        dataset,
        table,
        &env,
        plan,
        self_url,
        total_count,
    );
    let stream: ByteStream = match env.format {
        OutputFormat::HalJson => hal::render_list(job),
        OutputFormat::Csv => csv::render_list(job),
        OutputFormat::GeoJson => geojson::render_list(job, response_crs),
    };

    Ok((StatusCode::OK, response_headers, Body::from_stream(stream)).into_response())
}

/// GET `/<version>/<dataset>/<table>/<id>/`
pub async fn detail(
    State(state): State<AppState>,
    Path((dataset_path, table_path, id)): Path<(String, String, String)>,
    RawQuery(raw_query): RawQuery,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let self_url = format!("{}{}", state.config.public_base_url(), uri);
    let with_uri = |e: ApiError| AppError::new(e, self_url.clone());

    let snapshot = state.registry.snapshot();
    let (dataset, table) =
        resolve(&snapshot, &dataset_path, &table_path).map_err(with_uri)?;

    if dataset.is_remote() {
        return remote_call(
            &state,
            dataset,
            table,
            raw_query.as_deref(),
            &headers,
            Some(&id),
        )
        .await
        .map_err(with_uri);
    }

    let mut env = prepare(&state, table, raw_query.as_deref(), &headers).map_err(with_uri)?;

    // The identifier in the URL counts as a present filter for profile
    // mandatory-filter-set matching.
    env.user.add_query_params(table.identifier.iter().cloned());

    check_table_access(&snapshot, &env.user, dataset, table, "GET", uri.path())
        .map_err(with_uri)?;
    check_filter_access(&snapshot, &env.user, dataset, table, &env.params.filters)
        .map_err(with_uri)?;

    let planner = Planner::new(&snapshot, dataset, table, &env.user, env.options.clone());
    let plan = planner.plan_detail(&id, &env.params).map_err(with_uri)?;

    let mut response_headers = HeaderMap::new();
    insert_header(
        &mut response_headers,
        header::CONTENT_TYPE,
        OutputFormat::HalJson.content_type(),
    );
    if table.has_geometry() {
        insert_header(&mut response_headers, "Content-Crs", &env.response_crs.to_header());
    }

    let job = render_job(
        &state,
        snapshot.clone(),
        dataset,
        table,
        &env,
        plan,
        self_url.clone(),
        None,
    );
    let body = hal::render_detail(job).await.map_err(with_uri)?;

    Ok((StatusCode::OK, response_headers, Json(body)).into_response())
}

/// Forward a request for a remote dataset to its upstream endpoint.
async fn remote_call(
    state: &AppState,
    dataset: &Dataset,
    table: &Table,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    id: Option<&str>,
) -> Result<Response, ApiError> {
    let endpoint = dataset
        .endpoint_url
        .as_deref()
        .ok_or_else(|| ApiError::schema("remote dataset without endpoint"))?;

    let pairs = parse_query_string(raw_query.unwrap_or(""));
    let query = translate_params(&pairs, None)?;

    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    let ctx = RemoteRequestContext {
        client_ip: header_str("X-Real-IP").unwrap_or_else(|| "0.0.0.0".to_string()),
        x_forwarded_for: header_str("X-Forwarded-For"),
        x_correlation_id: header_str("X-Correlation-ID"),
        x_unique_id: header_str("X-Unique-ID"),
        authorization: header_str("Authorization"),
    };

    let client = RemoteClient::new(endpoint, &table.id, dataset.forward_auth)?;
    let response = client.call(&ctx, id.unwrap_or(""), &query).await?;
    validate_remote_response(table, &response.data)?;

    let mut response_headers = HeaderMap::new();
    insert_header(
        &mut response_headers,
        header::CONTENT_TYPE,
        OutputFormat::HalJson.content_type(),
    );
    if let Some(crs) = response.content_crs {
        insert_header(&mut response_headers, "Content-Crs", &crs.to_header());
    }

    Ok((StatusCode::OK, response_headers, Json(response.data)).into_response())
}

fn insert_header<K>(headers: &mut HeaderMap, key: K, value: &str)
where
    K: axum::http::header::IntoHeaderName,
{
    if let Ok(value) = header::HeaderValue::from_str(value) {
        headers.insert(key, value);
    }
}
