use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::ws;
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router
///
/// `/llm-websocket/{call_id}` is the canonical route the platform is
/// configured with. `/ws/{call_id}` is a legacy alias; with
/// `WEBSOCKET_ENFORCE_CANONICAL_ROUTE=true` (the default) it is accepted and
/// immediately closed with policy code 1008 so misconfigured agents fail
/// loudly instead of silently double-serving two paths.
///
/// WebSocket authentication is intentionally limited to the optional
/// handshake gates (IP allowlist, shared-secret header, query token); prefer
/// enforcing access at the reverse proxy.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/llm-websocket/{call_id}", get(ws::ws_brain_handler))
        .route("/ws/{call_id}", get(ws::ws_brain_legacy_handler))
        .layer(TraceLayer::new_for_http())
}
