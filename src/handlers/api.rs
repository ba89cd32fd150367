use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::core::GLOBAL_PROM;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Supervisor status
    pub ok: bool,
}

/// Health check handler
/// Returns 200 whenever the supervisor is up
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// Prometheus text exposition of the process-global counter registry
pub async fn metrics() -> Response {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        GLOBAL_PROM.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricsSink;

    #[tokio::test]
    async fn healthz_reports_ok() {
        let Json(body) = healthz().await;
        assert!(body.ok);
    }

    #[tokio::test]
    async fn metrics_renders_prometheus_text() {
        GLOBAL_PROM.inc("inbound.bad_schema_total", 1);
        let response = metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("inbound_bad_schema_total"));
    }
}
