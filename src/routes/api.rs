use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// Create the operational router: health and metrics.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/metrics", get(api::metrics))
        .layer(TraceLayer::new_for_http())
}
