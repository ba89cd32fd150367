//! End-to-end session tests over an in-memory transport.
//!
//! The harness assembles a session exactly the way the WebSocket supervisor
//! does (reader task, writer task, orchestrator), but the socket halves are
//! channel-backed so tests can stall the write path and inspect every frame.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use callbrain::config::BrainConfig;
use callbrain::core::metrics::names;
use callbrain::core::transport::WriterParams;
use callbrain::core::{
    BoundedQueue, CompositeMetrics, FrameSink, FrameSource, InboundQueue, Metrics, Orchestrator,
    OutboundQueue, ScriptedProducer, socket_reader, socket_writer,
};
use callbrain::errors::{CloseReason, TransportError};

struct HarnessSource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSource for HarnessSource {
    async fn recv_text(&mut self) -> Result<String, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

struct HarnessSink {
    tx: mpsc::UnboundedSender<String>,
    allowed: watch::Receiver<bool>,
    closes: Arc<Mutex<Vec<(u16, String)>>>,
}

#[async_trait]
impl FrameSink for HarnessSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        while !*self.allowed.borrow_and_update() {
            if self.allowed.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
        self.tx
            .send(text)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.closes.lock().push((code, reason.to_string()));
    }
}

struct Session {
    to_reader: mpsc::UnboundedSender<String>,
    from_writer: mpsc::UnboundedReceiver<String>,
    allowed_tx: watch::Sender<bool>,
    store: Arc<Metrics>,
    orch_task: JoinHandle<CloseReason>,
    closes: Arc<Mutex<Vec<(u16, String)>>>,
}

impl Session {
    async fn start(config: BrainConfig) -> Self {
        let (to_reader, reader_rx) = mpsc::unbounded_channel();
        let (writer_tx, from_writer) = mpsc::unbounded_channel();
        let (allowed_tx, allowed_rx) = watch::channel(true);
        let closes = Arc::new(Mutex::new(Vec::new()));

        let inbound_q: InboundQueue = Arc::new(BoundedQueue::new(config.inbound_queue_max));
        let outbound_q: OutboundQueue = Arc::new(BoundedQueue::new(config.outbound_queue_max));
        let shutdown = CancellationToken::new();
        let store = Arc::new(Metrics::new());
        let metrics = CompositeMetrics::new(vec![store.clone()]);

        let orch = Orchestrator::new(
            "call_test".to_string(),
            config.clone(),
            metrics.clone(),
            inbound_q.clone(),
            outbound_q.clone(),
            shutdown.clone(),
            Arc::new(ScriptedProducer),
        );
        let gate_rx = orch.gate().subscribe();

        tokio::spawn(socket_reader(
            HarnessSource { rx: reader_rx },
            inbound_q.clone(),
            metrics.clone(),
            shutdown.clone(),
            config.ws_max_frame_bytes,
            "call_test".to_string(),
        ));
        tokio::spawn(socket_writer(
            HarnessSink {
                tx: writer_tx,
                allowed: allowed_rx,
                closes: closes.clone(),
            },
            outbound_q.clone(),
            inbound_q.clone(),
            metrics.clone(),
            shutdown.clone(),
            gate_rx,
            WriterParams {
                write_timeout_ms: config.ws_write_timeout_ms,
                close_on_write_timeout: config.ws_close_on_write_timeout,
                max_consecutive_write_timeouts: config.ws_max_consecutive_write_timeouts,
            },
        ));
        let orch_task = tokio::spawn(orch.run());

        Session {
            to_reader,
            from_writer,
            allowed_tx,
            store,
            orch_task,
            closes,
        }
    }

    fn send_raw(&self, raw: &str) {
        self.to_reader.send(raw.to_string()).expect("reader alive");
    }

    fn send_json(&self, value: Value) {
        self.send_raw(&value.to_string());
    }

    fn pause_writes(&self) {
        self.allowed_tx.send_replace(false);
    }

    fn resume_writes(&self) {
        self.allowed_tx.send_replace(true);
    }

    async fn recv_frame(&mut self) -> Value {
        let raw = tokio::time::timeout(Duration::from_secs(2), self.from_writer.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("writer alive");
        serde_json::from_str(&raw).expect("outbound frames are JSON")
    }

    async fn try_recv_frame(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.from_writer.recv()).await {
            Ok(Some(raw)) => Some(serde_json::from_str(&raw).expect("outbound frames are JSON")),
            _ => None,
        }
    }

    /// Drain the opening `config` frame plus the BEGIN stream for epoch 0.
    async fn drain_begin(&mut self) {
        let config = self.recv_frame().await;
        assert_eq!(config["response_type"], json!("config"));
        loop {
            let frame = self.recv_frame().await;
            if frame["response_type"] == json!("response")
                && frame["response_id"] == json!(0)
                && frame["content_complete"] == json!(true)
            {
                return;
            }
        }
    }

    async fn close_reason(self) -> CloseReason {
        tokio::time::timeout(Duration::from_secs(5), self.orch_task)
            .await
            .expect("session did not end in time")
            .expect("orchestrator task panicked")
    }

    async fn wait_counter_at_least(&self, name: &str, target: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.store.get(name) >= target {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "counter {name} stuck at {} (wanted {target})",
                self.store.get(name)
            )
        });
    }
}

fn quiet_config() -> BrainConfig {
    let mut config = BrainConfig::default();
    config.speak_first = false;
    // Keep the background timers out of short real-time tests.
    config.idle_timeout_ms = 60_000;
    config.ping_interval_ms = 30_000;
    config
}

fn response_required(id: u64, user: &str) -> Value {
    json!({
        "interaction_type": "response_required",
        "response_id": id,
        "transcript": [{"role": "user", "content": user}],
    })
}

fn is_response(frame: &Value, id: u64) -> bool {
    frame["response_type"] == json!("response") && frame["response_id"] == json!(id)
}

fn is_terminal(frame: &Value, id: u64) -> bool {
    is_response(frame, id) && frame["content_complete"] == json!(true)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_schema_keeps_session_open() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_json(json!({"interaction_type": "novel_event", "x": 1}));
    session
        .wait_counter_at_least(names::INBOUND_BAD_SCHEMA_TOTAL, 1)
        .await;

    // No outbound emission for the unknown frame, and the session still
    // answers pings.
    assert!(session.try_recv_frame(Duration::from_millis(100)).await.is_none());
    session.send_json(json!({"interaction_type": "ping_pong", "timestamp": 123}));
    let echo = session.recv_frame().await;
    assert_eq!(echo["response_type"], json!("ping_pong"));
    assert_eq!(echo["timestamp"], json!(123));
}

#[tokio::test]
async fn normal_turn_streams_ack_content_terminal() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_json(response_required(1, "what are your hours?"));

    let mut contents = Vec::new();
    loop {
        let frame = session.recv_frame().await;
        assert!(is_response(&frame, 1), "unexpected frame: {frame}");
        if frame["content_complete"] == json!(true) {
            break;
        }
        contents.push(frame["content"].as_str().unwrap_or_default().to_string());
    }
    assert!(!contents.is_empty());
    assert_eq!(contents[0], "Okay.");
    assert!(contents.join(" ").contains("nine to five"));
}

#[tokio::test]
async fn barge_in_drops_queued_chunks_and_terminates_epoch() {
    let mut config = quiet_config();
    config.ws_write_timeout_ms = 5_000;
    let mut session = Session::start(config).await;
    session.drain_begin().await;

    // Stall the socket so epoch-7 chunks pile up in the outbound queue.
    session.pause_writes();
    session.send_json(response_required(7, "tell me about pricing"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.send_json(json!({
        "interaction_type": "update_only",
        "transcript": [{"role": "user", "content": "wait"}],
        "turntaking": "user_turn",
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.resume_writes();

    let mut saw_terminal = false;
    while let Some(frame) = session.try_recv_frame(Duration::from_millis(300)).await {
        if is_response(&frame, 7) {
            assert!(
                frame["content_complete"] == json!(true),
                "stale speech chunk escaped the gate: {frame}"
            );
            assert_eq!(frame["content"], json!(""));
            saw_terminal = true;
        }
    }
    assert!(saw_terminal, "barge-in must close the epoch with an empty terminal");
    assert!(session.store.get(names::STALE_SEGMENT_DROPPED_TOTAL) >= 1);
}

#[tokio::test]
async fn clear_event_behaves_like_barge_in() {
    let mut config = quiet_config();
    config.ws_write_timeout_ms = 5_000;
    let mut session = Session::start(config).await;
    session.drain_begin().await;

    session.pause_writes();
    session.send_json(response_required(2, "tell me about pricing"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.send_json(json!({"interaction_type": "clear"}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.resume_writes();

    let mut saw_terminal = false;
    while let Some(frame) = session.try_recv_frame(Duration::from_millis(300)).await {
        if is_response(&frame, 2) {
            assert!(frame["content_complete"] == json!(true), "leaked chunk: {frame}");
            saw_terminal = true;
        }
    }
    assert!(saw_terminal);
}

#[tokio::test]
async fn epoch_preemption_orders_frames() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_json(response_required(3, "what's the price?"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    session.send_json(response_required(4, "actually, can I book?"));

    let mut frames = Vec::new();
    loop {
        let frame = session.recv_frame().await;
        let done = is_terminal(&frame, 4);
        frames.push(frame);
        if done {
            break;
        }
    }

    let first_epoch4 = frames
        .iter()
        .position(|f| is_response(f, 4))
        .expect("epoch 4 frames");
    for frame in &frames[first_epoch4..] {
        assert!(
            !is_response(frame, 3),
            "epoch 3 frame written after epoch 4 started: {frame}"
        );
    }
}

#[tokio::test]
async fn same_epoch_redelivery_is_idempotent() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_json(response_required(1, "what are your hours?"));
    let mut first_run = Vec::new();
    loop {
        let frame = session.recv_frame().await;
        let done = is_terminal(&frame, 1);
        first_run.push(frame);
        if done {
            break;
        }
    }
    assert!(first_run.len() >= 2, "turn should stream ack + terminal");

    // Redelivering the same turn request must not restart the handler.
    session.send_json(response_required(1, "what are your hours?"));
    assert!(
        session.try_recv_frame(Duration::from_millis(200)).await.is_none(),
        "redelivery must not produce new frames"
    );
}

#[tokio::test]
async fn oversized_frame_closes_with_frame_too_large() {
    let mut config = quiet_config();
    config.ws_max_frame_bytes = 256;
    let mut session = Session::start(config).await;
    session.drain_begin().await;

    // A frame of exactly the cap is accepted.
    let pad = "x".repeat(256 - r#"{"interaction_type":"ping_pong","timestamp":1,"pad":""}"#.len());
    let exact = format!(r#"{{"interaction_type":"ping_pong","timestamp":1,"pad":"{pad}"}}"#);
    assert_eq!(exact.len(), 256);
    session.send_raw(&exact);
    let echo = session.recv_frame().await;
    assert_eq!(echo["response_type"], json!("ping_pong"));

    // One byte over closes the session.
    let over = format!(r#"{{"interaction_type":"ping_pong","timestamp":1,"pad":"{pad}x"}}"#);
    session.send_raw(&over);
    assert_eq!(session.close_reason().await, CloseReason::FrameTooLarge);
}

#[tokio::test]
async fn malformed_json_closes_with_bad_json() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_raw("{not json");
    assert_eq!(session.close_reason().await, CloseReason::BadJson);
}

#[tokio::test]
async fn peer_disconnect_closes_with_peer_close() {
    let session = Session::start(quiet_config()).await;
    // Dropping our sender half closes the reader's stream, i.e. the peer
    // hangs up.
    let Session {
        to_reader,
        orch_task,
        ..
    } = session;
    drop(to_reader);
    let reason = tokio::time::timeout(Duration::from_secs(5), orch_task)
        .await
        .expect("session did not end")
        .expect("orchestrator task panicked");
    assert_eq!(reason, CloseReason::PeerClose);
}

#[tokio::test(start_paused = true)]
async fn stalled_socket_escalates_to_backpressure_close() {
    let mut config = BrainConfig::default();
    config.speak_first = false;
    config.idle_timeout_ms = 60_000;
    config.ping_interval_ms = 200;
    config.ws_write_timeout_ms = 400;
    config.ws_max_consecutive_write_timeouts = 2;

    let session = Session::start(config).await;
    session.pause_writes();

    let started = tokio::time::Instant::now();
    let reason = session.close_reason().await;
    assert_eq!(reason, CloseReason::WriteTimeoutBackpressure);
    assert!(
        started.elapsed() <= Duration::from_millis(1_500),
        "close took {:?}",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn idle_session_closes_with_idle_timeout() {
    let mut config = BrainConfig::default();
    config.speak_first = false;
    config.idle_timeout_ms = 3_000;
    config.ping_interval_ms = 1_000;

    let mut session = Session::start(config).await;
    session.drain_begin().await;

    let reason = session.close_reason().await;
    assert_eq!(reason, CloseReason::IdleTimeout);
}

#[tokio::test]
async fn speak_first_opens_with_config_then_greeting_stream() {
    let mut config = quiet_config();
    config.speak_first = true;
    config.greeting = "Hi there! Thanks for calling us today. How can I help?".to_string();
    let mut session = Session::start(config).await;

    let first = session.recv_frame().await;
    assert_eq!(first["response_type"], json!("config"));

    let mut contents = Vec::new();
    loop {
        let frame = session.recv_frame().await;
        assert!(is_response(&frame, 0), "unexpected frame: {frame}");
        if frame["content_complete"] == json!(true) {
            assert_eq!(frame["content"], json!(""));
            break;
        }
        assert_eq!(frame["content_complete"], json!(false));
        contents.push(frame["content"].as_str().unwrap_or_default().to_string());
    }
    assert!(!contents.is_empty());
    assert!(contents.join(" ").contains("Thanks for calling"));
}

#[tokio::test]
async fn update_only_snapshots_do_not_emit() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    for i in 0..5 {
        session.send_json(json!({
            "interaction_type": "update_only",
            "transcript": [{"role": "user", "content": format!("partial {i}")}],
        }));
    }
    assert!(session.try_recv_frame(Duration::from_millis(150)).await.is_none());
}

#[tokio::test]
async fn reminder_before_any_user_text_stays_silent() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_json(json!({
        "interaction_type": "reminder_required",
        "response_id": 1,
        "transcript": [],
    }));
    let frame = session.recv_frame().await;
    assert!(is_terminal(&frame, 1), "expected a silent terminal: {frame}");
    assert_eq!(frame["content"], json!(""));
}

#[tokio::test]
async fn phone_confirmation_spells_digits_slowly() {
    let mut session = Session::start(quiet_config()).await;
    session.drain_begin().await;

    session.send_json(response_required(1, "call me back at 469 599 8571"));
    let mut contents = Vec::new();
    loop {
        let frame = session.recv_frame().await;
        if is_terminal(&frame, 1) {
            break;
        }
        contents.push(frame["content"].as_str().unwrap_or_default().to_string());
    }
    let joined = contents.join(" ");
    assert!(
        joined.contains("4 - 6 - 9"),
        "digits must be spelled with dash pauses: {joined}"
    );
}
