//! The API index: all datasets with their endpoints.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Map, Value};

use dso_core::schema::PUBLIC_SCOPE;

use crate::state::AppState;

/// GET `/` and `/<version>/`: a dataset catalog in a shape compatible with
/// developer.overheid.nl.
pub async fn index(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let base = state.config.public_base_url();
    let version = &state.config.version;

    let mut datasets = Map::new();
    for dataset in snapshot.datasets() {
        let api_url = format!("{base}/{version}/{}/", dataset.url_path());
        let auth: Vec<Value> = if dataset.auth.is_empty() {
            vec![Value::String(PUBLIC_SCOPE.to_string())]
        } else {
            dataset
                .auth
                .iter()
                .map(|scope| Value::String(scope.clone()))
                .collect()
        };

        datasets.insert(
            dataset.id.clone(),
            json!({
                "id": dataset.id,
                "short_name": dataset.url_path(),
                "service_name": dataset.title.clone().unwrap_or_else(|| dataset.id.clone()),
                "status": dataset.status,
                "api_authentication": auth,
                "api_type": "rest_json",
                "environments": [{
                    "name": "production",
                    "api_url": api_url,
                    "specification_url": "",
                    "documentation_url": "",
                }],
                "related_apis": [],
            }),
        );
    }

    Json(json!({ "datasets": datasets }))
}
