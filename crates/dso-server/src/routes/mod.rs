//! URL dispatch per the DSO grammar.
//!
//! ```text
//! /<version>/                                        index
//! /<version>/<dataset>/<table>/                      list
//! /<version>/<dataset>/<table>/<id>/                 detail
//! /<version>/mvt/<dataset>/tilejson.json             tilejson
//! /<version>/mvt/<dataset>/<table>/<z>/<x>/<y>.pbf   vector tile
//! /reload                                            schema reload
//! /health                                            liveness
//! ```

pub mod data;
pub mod index;
pub mod mvt;
pub mod reload;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router for the configured version segment.
#[must_use]
pub fn router(state: AppState) -> Router {
    let v = &state.config.version;

    Router::new()
        .route("/", get(index::index))
        .route(&format!("/{v}/"), get(index::index))
        .route(
            &format!("/{v}/mvt/{{dataset}}/tilejson.json"),
            get(mvt::tilejson_endpoint),
        )
        .route(
            &format!("/{v}/mvt/{{dataset}}/{{table}}/{{z}}/{{x}}/{{y}}"),
            get(mvt::tile),
        )
        .route(&format!("/{v}/{{dataset}}/{{table}}/"), get(data::list))
        .route(&format!("/{v}/{{dataset}}/{{table}}/{{id}}/"), get(data::detail))
        .route("/reload", post(reload::reload))
        .route("/health", get(reload::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
