//! WebSocket session supervisor.
//!
//! Upgrades the platform connection, applies the handshake gates, then wires
//! one session: reader task, writer task, and the turn-epoch machine running
//! in this task. Teardown is driven by whichever of them signals a close
//! reason first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ConnectInfo, Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::transport::WriterParams;
use crate::core::{
    BoundedQueue, CompositeMetrics, FrameSink, FrameSource, GLOBAL_PROM, InboundQueue, Metrics,
    Orchestrator, OutboundQueue, socket_reader, socket_writer,
};
use crate::errors::TransportError;
use crate::security::{is_ip_allowed, resolve_client_ip, verify_query_token, verify_shared_secret};
use crate::state::AppState;
use async_trait::async_trait;

/// Canonical WebSocket endpoint.
pub async fn ws_brain_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !handshake_allowed(&state, &addr, &headers, &query, &call_id) {
        return ws.on_upgrade(|socket| reject_socket(socket, "forbidden"));
    }
    info!(call_id, "WebSocket brain connection upgrade requested");
    ws.on_upgrade(move |socket| run_session(socket, call_id, state))
}

/// Legacy alias. Kept for platform configurations predating the canonical
/// path; enforcement closes it with policy code 1008.
pub async fn ws_brain_legacy_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if state.config.websocket_enforce_canonical_route {
        warn!(call_id, "rejecting non-canonical WebSocket route");
        return ws.on_upgrade(|socket| reject_socket(socket, "non_canonical_route"));
    }
    if !handshake_allowed(&state, &addr, &headers, &query, &call_id) {
        return ws.on_upgrade(|socket| reject_socket(socket, "forbidden"));
    }
    ws.on_upgrade(move |socket| run_session(socket, call_id, state))
}

fn handshake_allowed(
    state: &AppState,
    addr: &SocketAddr,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    call_id: &str,
) -> bool {
    let cfg = &state.config;
    let header_map: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let effective_ip = resolve_client_ip(
        &addr.ip().to_string(),
        &header_map,
        cfg.ws_trusted_proxy_enabled,
        &cfg.ws_trusted_proxy_cidrs,
    );

    if cfg.ws_allowlist_enabled && !is_ip_allowed(&effective_ip, &cfg.ws_allowlist_cidrs) {
        warn!(call_id, ip = %effective_ip, "connection refused by allowlist");
        return false;
    }
    if cfg.ws_shared_secret_enabled
        && !verify_shared_secret(&header_map, &cfg.ws_shared_secret_header, &cfg.ws_shared_secret)
    {
        warn!(call_id, "connection refused by shared secret");
        return false;
    }
    if !verify_query_token(query, &cfg.ws_query_token_param, &cfg.ws_query_token) {
        warn!(call_id, "connection refused by query token");
        return false;
    }
    true
}

async fn reject_socket(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: reason.into(),
        })))
        .await;
}

/// Run one session to completion. This is the only place the components are
/// assembled; ownership of every handle ends here.
pub(crate) async fn run_session(socket: WebSocket, call_id: String, state: Arc<AppState>) {
    info!(call_id, "session established");
    let cfg = state.config.clone();
    let (sender, receiver) = socket.split();

    let inbound_q: InboundQueue = Arc::new(BoundedQueue::new(cfg.inbound_queue_max));
    let outbound_q: OutboundQueue = Arc::new(BoundedQueue::new(cfg.outbound_queue_max));
    let shutdown = CancellationToken::new();
    let session_metrics = Arc::new(Metrics::new());
    let metrics = CompositeMetrics::new(vec![session_metrics.clone(), GLOBAL_PROM.clone()]);

    let orch = Orchestrator::new(
        call_id.clone(),
        cfg.clone(),
        metrics.clone(),
        inbound_q.clone(),
        outbound_q.clone(),
        shutdown.clone(),
        state.producer.clone(),
    );
    let gate_rx = orch.gate().subscribe();

    let reader_task = tokio::spawn(socket_reader(
        AxumFrameSource { inner: receiver },
        inbound_q.clone(),
        metrics.clone(),
        shutdown.clone(),
        cfg.ws_max_frame_bytes,
        call_id.clone(),
    ));
    let writer_task = tokio::spawn(socket_writer(
        AxumFrameSink { inner: sender },
        outbound_q.clone(),
        inbound_q.clone(),
        metrics.clone(),
        shutdown.clone(),
        gate_rx,
        WriterParams {
            write_timeout_ms: cfg.ws_write_timeout_ms,
            close_on_write_timeout: cfg.ws_close_on_write_timeout,
            max_consecutive_write_timeouts: cfg.ws_max_consecutive_write_timeouts,
        },
    ));

    let reason = orch.run().await;

    shutdown.cancel();
    let _ = reader_task.await;
    if let Ok(mut sink) = writer_task.await {
        sink.close(1000, "session_end").await;
    }
    info!(call_id, reason = %reason, "session terminated");
}

struct AxumFrameSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for AxumFrameSource {
    async fn recv_text(&mut self) -> Result<String, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(data))) => {
                    // The contract is JSON text frames only.
                    debug!(bytes = data.len(), "ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // WebSocket-level ping/pong is handled by axum.
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(TransportError::Failed(err.to_string())),
            }
        }
    }
}

struct AxumFrameSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumFrameSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| TransportError::Failed(err.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self
            .inner
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}
