//! Axum routers
//!
//! - `ws` - WebSocket endpoints (canonical and legacy)
//! - `api` - operational surface (health, metrics)

pub mod api;
pub mod ws;

pub use api::create_api_router;
pub use ws::create_ws_router;
