//! Schema reload and liveness endpoints.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;

/// POST `/reload`: re-read the schema source and publish a new snapshot.
///
/// On failure the previous snapshot stays active and the error is returned;
/// in-flight requests keep their captured snapshot either way. A successful
/// reload also drops the prefetch cache, since cached rows may belong to a
/// table layout that no longer exists.
pub async fn reload(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state.registry.reload().await?;
    state.cache.clear();

    let snapshot = state.registry.snapshot();
    let base = state.config.public_base_url();
    let version = &state.config.version;
    let models: Vec<Value> = snapshot
        .datasets()
        .flat_map(|dataset| {
            let base = base.clone();
            dataset.tables.iter().map(move |table| {
                json!({
                    "schema": dataset.id,
                    "table": table.id,
                    "url": format!(
                        "{base}/{version}/{}/{}/",
                        dataset.url_path(),
                        dso_core::schema::to_snake_case(&table.id)
                    ),
                })
            })
        })
        .collect();

    Ok(Json(json!({ "models": models })))
}

/// GET `/health`: liveness with the loaded dataset count.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "status": "ok",
        "datasets": snapshot.datasets().count(),
    }))
}
