//! Framed WebSocket transport: read loop, write loop, and the epoch gate.
//!
//! Single-writer rule: `socket_writer` is the only task that writes to the
//! socket, and `socket_reader` the only one that reads. Both communicate with
//! the turn-epoch machine exclusively through the bounded queues; fatal
//! transport conditions travel inband as [`InboundItem::TransportClosed`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::metrics::{CompositeMetrics, names};
use crate::core::protocol::{
    DecodeError, InboundClass, InboundEvent, OutboundEvent, decode_inbound, encode_outbound,
};
use crate::core::queue::BoundedQueue;
use crate::errors::{CloseReason, TransportError};

/// Receive half of a framed text transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame; `Err(Closed)` when the peer hangs up.
    async fn recv_text(&mut self) -> Result<String, TransportError>;
}

/// Send half of a framed text transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: &str);
}

/// Item on the inbound queue: a decoded frame or an inband close signal.
#[derive(Debug, Clone)]
pub enum InboundItem {
    Event(InboundEvent),
    TransportClosed { reason: CloseReason },
}

impl InboundItem {
    /// Control-class items are delivered to the machine before any backlog.
    pub fn is_control(&self) -> bool {
        match self {
            InboundItem::TransportClosed { .. } => true,
            InboundItem::Event(ev) => {
                matches!(ev.class(), InboundClass::Control | InboundClass::Turn)
            }
        }
    }
}

/// Outbound priority. Lower sorts first; `Control` and `Terminal` are never
/// evicted under queue pressure. Control outranks Terminal at the queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Control,
    Terminal,
    Speech,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Control,
    Speech,
}

/// Internal-only wrapper enforcing epoch + speak-generation gating in the
/// single writer. Never leaks onto the wire: only `msg` is serialized.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub msg: OutboundEvent,
    pub epoch: Option<u64>,
    pub speak_gen: Option<u64>,
    pub priority: Priority,
    pub plane: Plane,
    pub enqueued_at: Instant,
    /// Enqueue-to-write deadline for keepalive accounting, if any.
    pub deadline_ms: Option<u64>,
}

impl OutboundEnvelope {
    pub fn new(msg: OutboundEvent, epoch: Option<u64>, speak_gen: Option<u64>) -> Self {
        let (priority, plane) = classify(&msg);
        Self {
            msg,
            epoch,
            speak_gen,
            priority,
            plane,
            enqueued_at: Instant::now(),
            deadline_ms: None,
        }
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        if deadline_ms > 0 {
            self.deadline_ms = Some(deadline_ms);
        }
        self
    }

    pub fn is_control(&self) -> bool {
        self.plane == Plane::Control
    }

    fn is_nonterminal_response(&self) -> bool {
        matches!(
            self.msg,
            OutboundEvent::Response {
                content_complete: false,
                ..
            }
        )
    }
}

fn classify(msg: &OutboundEvent) -> (Priority, Plane) {
    match msg {
        OutboundEvent::Config { .. } | OutboundEvent::PingPong { .. } => {
            (Priority::Control, Plane::Control)
        }
        OutboundEvent::Response {
            content_complete: true,
            ..
        } => (Priority::Terminal, Plane::Speech),
        OutboundEvent::Response { .. } => (Priority::Speech, Plane::Speech),
        OutboundEvent::AgentInterrupt { .. } => (Priority::Low, Plane::Speech),
    }
}

/// Published epoch/speak-generation pair all staleness checks compare against.
///
/// `version` counts every transition, including re-activations of the same
/// epoch; staleness never compares it, but the writer resets its per-epoch
/// terminal latch when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateState {
    pub epoch: u64,
    pub speak_gen: u64,
    pub version: u64,
}

/// The machine-owned side of the gate. The writer holds a `watch::Receiver`
/// and observes every transition edge-triggered, including ones that land
/// while a send is in flight.
pub struct Gate {
    tx: watch::Sender<GateState>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> GateState {
        *self.tx.borrow()
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.tx.send_modify(|g| {
            g.epoch = epoch;
            g.speak_gen = 0;
            g.version += 1;
        });
    }

    pub fn bump_speak_gen(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|g| {
            g.speak_gen += 1;
            g.version += 1;
            next = g.speak_gen;
        });
        next
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

pub type InboundQueue = Arc<BoundedQueue<InboundItem>>;
pub type OutboundQueue = Arc<BoundedQueue<OutboundEnvelope>>;

fn push_closed(inbound_q: &InboundQueue, reason: CloseReason) {
    // The close signal must get through even under overload.
    let _ = inbound_q.push_or_evict(InboundItem::TransportClosed { reason }, |_| true);
}

/// Read loop: WS frames -> decode -> classified admission to the inbound queue.
///
/// Never blocks on a full queue; overload is resolved by the class-based
/// eviction policy so the latest turn request always survives.
pub async fn socket_reader<S: FrameSource>(
    mut source: S,
    inbound_q: InboundQueue,
    metrics: CompositeMetrics,
    shutdown: CancellationToken,
    max_frame_bytes: usize,
    call_id: String,
) {
    loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => return,
            raw = source.recv_text() => raw,
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(TransportError::Closed) => {
                debug!(call_id, "peer closed the socket");
                push_closed(&inbound_q, CloseReason::PeerClose);
                return;
            }
            Err(TransportError::Failed(err)) => {
                warn!(call_id, error = %err, "transport read failure");
                push_closed(&inbound_q, CloseReason::PeerClose);
                return;
            }
        };

        let ev = match decode_inbound(&raw, max_frame_bytes) {
            Ok(ev) => ev,
            Err(DecodeError::FrameTooLarge(size)) => {
                warn!(call_id, size, "inbound frame over the size cap");
                push_closed(&inbound_q, CloseReason::FrameTooLarge);
                return;
            }
            Err(DecodeError::BadJson) => {
                warn!(call_id, "inbound frame is not valid JSON");
                push_closed(&inbound_q, CloseReason::BadJson);
                return;
            }
        };

        if let InboundEvent::Unknown(raw) = &ev {
            // Schema drift at the remote end must never close the session.
            metrics.inc(names::INBOUND_BAD_SCHEMA_TOTAL, 1);
            debug!(
                call_id,
                interaction_type = raw
                    .get("interaction_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or(""),
                "unknown inbound variant"
            );
            continue;
        }

        admit_inbound(&inbound_q, &metrics, ev);
    }
}

/// Inbound overflow policy:
/// - `update_only`: keep only the latest snapshot (older snapshots are evicted
///   even when the queue has room).
/// - turn requests: evict updates/info first, then any older turn request, so
///   the newest `response_required` is never lost.
/// - control frames: evict an update if needed; they must not be starved.
fn admit_inbound(inbound_q: &InboundQueue, metrics: &CompositeMetrics, ev: InboundEvent) {
    let class = ev.class();
    let admitted = match class {
        InboundClass::Update => {
            let stale = inbound_q.drop_where(|item| {
                matches!(
                    item,
                    InboundItem::Event(InboundEvent::UpdateOnly { .. })
                )
            });
            if stale > 0 {
                metrics.inc(names::INBOUND_QUEUE_EVICTIONS_TOTAL, stale as u64);
            }
            inbound_q.try_push(InboundItem::Event(ev))
        }
        InboundClass::Turn => {
            let new_id = ev.response_id();
            let outcome = inbound_q.push_or_evict(InboundItem::Event(ev.clone()), |item| {
                matches!(
                    item,
                    InboundItem::Event(
                        InboundEvent::UpdateOnly { .. }
                            | InboundEvent::CallDetails { .. }
                            | InboundEvent::PingPong { .. }
                    )
                )
            });
            if outcome.evicted() {
                metrics.inc(names::INBOUND_QUEUE_EVICTIONS_TOTAL, 1);
            }
            if outcome.admitted() {
                true
            } else {
                // Extreme overload: sacrifice an older turn request, never the
                // newest one.
                let outcome = inbound_q.push_or_evict(InboundItem::Event(ev), |item| {
                    matches!(item, InboundItem::Event(other)
                        if other.response_id().is_some() && other.response_id() < new_id)
                });
                if outcome.evicted() {
                    metrics.inc(names::INBOUND_QUEUE_EVICTIONS_TOTAL, 1);
                }
                outcome.admitted()
            }
        }
        InboundClass::Control => {
            if inbound_q.try_push(InboundItem::Event(ev.clone())) {
                true
            } else {
                let evicted = inbound_q.evict_one_where(|item| {
                    matches!(item, InboundItem::Event(InboundEvent::UpdateOnly { .. }))
                });
                if evicted {
                    metrics.inc(names::INBOUND_QUEUE_EVICTIONS_TOTAL, 1);
                    inbound_q.try_push(InboundItem::Event(ev))
                } else {
                    false
                }
            }
        }
        InboundClass::Info => inbound_q
            .push_or_evict(InboundItem::Event(ev), |item| {
                matches!(item, InboundItem::Event(InboundEvent::UpdateOnly { .. }))
            })
            .admitted(),
    };
    if !admitted {
        metrics.inc(names::INBOUND_QUEUE_DROPPED_TOTAL, 1);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterParams {
    pub write_timeout_ms: u64,
    pub close_on_write_timeout: bool,
    pub max_consecutive_write_timeouts: u32,
}

enum SendResult {
    Sent,
    TimedOut,
    SinkGone,
}

/// Write loop: priority dequeue, staleness gating, deadline-bounded sends.
///
/// Drops stale turn-bound frames whose `(epoch, speak_gen)` no longer matches
/// the gate. This intentionally duplicates the producer-side check: producers
/// can enqueue while a cancellation is still in flight.
pub async fn socket_writer<S: FrameSink>(
    mut sink: S,
    outbound_q: OutboundQueue,
    inbound_q: InboundQueue,
    metrics: CompositeMetrics,
    shutdown: CancellationToken,
    mut gate_rx: watch::Receiver<GateState>,
    params: WriterParams,
) -> S {
    let mut consecutive_write_timeouts: u32 = 0;
    // Once a terminal frame for an epoch is on the wire, nothing else for
    // that epoch may follow it until the machine re-activates the gate.
    let mut last_terminal_epoch: Option<u64> = None;
    let mut last_gate_version: u64 = 0;

    loop {
        let env = tokio::select! {
            _ = shutdown.cancelled() => return sink,
            popped = outbound_q.pop_prefer(OutboundEnvelope::is_control) => match popped {
                Ok(env) => env,
                Err(_) => return sink,
            },
        };

        let gate = *gate_rx.borrow_and_update();
        if gate.version != last_gate_version {
            last_gate_version = gate.version;
            last_terminal_epoch = None;
        }

        // Gate checks for turn-bound envelopes.
        if env.epoch.is_some_and(|e| e != gate.epoch)
            || env.speak_gen.is_some_and(|g| g != gate.speak_gen)
        {
            metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, 1);
            continue;
        }

        // Belt and suspenders: never send a response chunk for the wrong
        // response_id, and never send past an epoch's terminal frame.
        if let Some(response_id) = env.msg.response_id() {
            if response_id != gate.epoch {
                metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, 1);
                continue;
            }
            if last_terminal_epoch == Some(response_id) {
                metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, 1);
                continue;
            }
        }

        if env.plane == Plane::Control {
            match send_payload(
                &mut sink,
                &env,
                &metrics,
                &inbound_q,
                &shutdown,
                &params,
                &mut consecutive_write_timeouts,
            )
            .await
            {
                SendResult::Sent => {
                    // Barge-in terminals ride the control plane.
                    if env.msg.is_terminal_response() {
                        last_terminal_epoch = env.msg.response_id();
                    }
                }
                SendResult::TimedOut => {
                    if shutdown.is_cancelled() {
                        return sink;
                    }
                }
                SendResult::SinkGone => return sink,
            }
            continue;
        }

        // Speech-plane sends abort for two reasons: the gate moved (stale), or
        // a control frame arrived and must not wait behind a stalled write.
        enum SpeechOutcome {
            Sent(SendResult),
            GateChanged,
            GateGone,
            ControlArrived,
            QueueGone,
        }

        let outcome = tokio::select! {
            res = send_payload(
                &mut sink,
                &env,
                &metrics,
                &inbound_q,
                &shutdown,
                &params,
                &mut consecutive_write_timeouts,
            ) => SpeechOutcome::Sent(res),
            changed = gate_rx.changed() => match changed {
                Ok(()) => SpeechOutcome::GateChanged,
                Err(_) => SpeechOutcome::GateGone,
            },
            waited = outbound_q.wait_for_any(OutboundEnvelope::is_control) => match waited {
                Ok(()) => SpeechOutcome::ControlArrived,
                Err(_) => SpeechOutcome::QueueGone,
            },
        };

        match outcome {
            SpeechOutcome::Sent(SendResult::Sent) => {
                if env.msg.is_terminal_response() {
                    last_terminal_epoch = env.msg.response_id();
                }
            }
            SpeechOutcome::Sent(SendResult::TimedOut) => {
                if shutdown.is_cancelled() {
                    return sink;
                }
            }
            SpeechOutcome::Sent(SendResult::SinkGone) => return sink,
            SpeechOutcome::GateChanged => {
                metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, 1);
            }
            SpeechOutcome::ControlArrived => {
                // Requeue this chunk behind the control frame; evict a
                // lower-priority speech chunk if the queue is full.
                let priority = env.priority;
                let outcome = outbound_q.push_or_evict(env, |existing| {
                    existing.plane == Plane::Speech
                        && existing.priority > priority
                        && existing.is_nonterminal_response()
                });
                if !outcome.admitted() {
                    metrics.inc(names::OUTBOUND_QUEUE_DROPPED_TOTAL, 1);
                }
            }
            // Gate owner or queue gone: the session is tearing down.
            SpeechOutcome::GateGone | SpeechOutcome::QueueGone => return sink,
        }
    }
}

async fn send_payload<S: FrameSink>(
    sink: &mut S,
    env: &OutboundEnvelope,
    metrics: &CompositeMetrics,
    inbound_q: &InboundQueue,
    shutdown: &CancellationToken,
    params: &WriterParams,
    consecutive_write_timeouts: &mut u32,
) -> SendResult {
    let is_ping = env.msg.is_ping();
    if is_ping {
        let delay_ms = env.enqueued_at.elapsed().as_millis() as u64;
        metrics.observe(names::KEEPALIVE_QUEUE_DELAY_MS, delay_ms);
        if env.deadline_ms.is_some_and(|d| delay_ms > d) {
            metrics.inc(names::KEEPALIVE_MISSED_DEADLINE_TOTAL, 1);
        }
        metrics.inc(names::KEEPALIVE_WRITE_ATTEMPT_TOTAL, 1);
    }

    let payload = encode_outbound(&env.msg);
    match timeout(
        Duration::from_millis(params.write_timeout_ms.max(1)),
        sink.send_text(payload),
    )
    .await
    {
        Ok(Ok(())) => {
            *consecutive_write_timeouts = 0;
            SendResult::Sent
        }
        Ok(Err(_)) => {
            push_closed(inbound_q, CloseReason::PeerClose);
            SendResult::SinkGone
        }
        Err(_) => {
            metrics.inc(names::WS_WRITE_TIMEOUT_TOTAL, 1);
            if is_ping {
                metrics.inc(names::KEEPALIVE_WRITE_TIMEOUT_TOTAL, 1);
            }
            *consecutive_write_timeouts += 1;
            if params.close_on_write_timeout
                && *consecutive_write_timeouts >= params.max_consecutive_write_timeouts.max(1)
            {
                warn!(
                    misses = *consecutive_write_timeouts,
                    "write deadline missed repeatedly, closing under backpressure"
                );
                push_closed(inbound_q, CloseReason::WriteTimeoutBackpressure);
                shutdown.cancel();
                sink.close(1011, CloseReason::WriteTimeoutBackpressure.as_str())
                    .await;
            }
            SendResult::TimedOut
        }
    }
}
