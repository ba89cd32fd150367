use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

use anyhow::anyhow;

use callbrain::{AppState, BrainConfig, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = BrainConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();
    tracing::info!(%address, "starting brain server");

    let state = AppState::new(config);

    let app = Router::new()
        .merge(routes::create_ws_router())
        .merge(routes::create_api_router())
        .with_state(state);

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| anyhow!("Failed to bind {address}: {e}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await
    .map_err(|e| anyhow!("Server error: {e}"))?;

    Ok(())
}
