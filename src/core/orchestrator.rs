//! Turn-epoch machine.
//!
//! Single source of truth for one session: owns the epoch, the speak
//! generation, the conversation FSM, transcript memory, and the lifecycle of
//! turn handler tasks. Everything that mutates session state funnels through
//! this type; the reader, writer, and handlers only talk to it through the
//! bounded queues and the gate.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BrainConfig;
use crate::core::keepalive::spawn_ping_loop;
use crate::core::memory::ConversationMemory;
use crate::core::metrics::{CompositeMetrics, names};
use crate::core::producer::{ProducerReply, TurnContext, TurnProducer};
use crate::core::protocol::{
    InboundEvent, OutboundEvent, PlatformConfig, Role, TranscriptUtterance, TurnTaking,
};
use crate::core::queue::QueueClosed;
use crate::core::slots::SlotState;
use crate::core::speech::{ChunkOptions, SegmentPurpose, SpeechSegment, micro_chunk_text};
use crate::core::transport::{
    Gate, InboundItem, InboundQueue, OutboundEnvelope, OutboundQueue, Plane, Priority,
};
use crate::core::turn::{TurnHandler, TurnHandlerParams, TurnOutput, TurnOutputKind};
use crate::errors::CloseReason;

static PHONE_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3})[\s\-\)]*(\d{3})[\s\-]*(\d{4})\b").unwrap());
static BOOKING_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(book|schedule|appointment|appt)\b").unwrap());
static AFFIRMATIVE_PAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(yes|yeah|yep|yup|correct|right|that's right|that is right)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvState {
    Listening,
    Processing,
    Speaking,
    Ended,
}

struct TurnRuntime {
    epoch: u64,
    finalized_at: Instant,
    first_segment_at: Option<Instant>,
}

struct SpeculativeResult {
    transcript_key: String,
    reply: ProducerReply,
}

pub struct Orchestrator {
    call_id: String,
    config: BrainConfig,
    metrics: CompositeMetrics,
    inbound_q: InboundQueue,
    outbound_q: OutboundQueue,
    shutdown: CancellationToken,
    gate: Gate,
    producer: Arc<dyn TurnProducer>,

    conv_state: ConvState,
    close_reason: Option<CloseReason>,
    epoch: u64,
    needs_apology: bool,
    terminal_enqueued_for_epoch: Option<u64>,
    turn_rt: Option<TurnRuntime>,

    slot_state: SlotState,
    slot_backup: Option<(u64, SlotState)>,

    memory: ConversationMemory,
    transcript: Vec<TranscriptUtterance>,
    memory_summary: String,

    // Current handler: its cancellation token and the receiver slot the run
    // loop adopts. Bumping `turn_q_gen` is what triggers the swap rule.
    turn_cancel: Option<CancellationToken>,
    turn_rx_slot: Option<mpsc::Receiver<TurnOutput>>,
    turn_q_gen: u64,

    spec_tx: mpsc::Sender<SpeculativeResult>,
    spec_rx: Option<mpsc::Receiver<SpeculativeResult>>,
    spec_cancel: Option<CancellationToken>,
    spec_key: String,
    spec_result: Option<SpeculativeResult>,

    idle_deadline: Instant,
}

impl Orchestrator {
    pub fn new(
        call_id: String,
        config: BrainConfig,
        metrics: CompositeMetrics,
        inbound_q: InboundQueue,
        outbound_q: OutboundQueue,
        shutdown: CancellationToken,
        producer: Arc<dyn TurnProducer>,
    ) -> Self {
        let (spec_tx, spec_rx) = mpsc::channel(1);
        let memory = ConversationMemory::new(
            config.transcript_max_utterances,
            config.transcript_max_chars,
        );
        let idle_deadline = Instant::now() + Duration::from_millis(config.idle_timeout_ms.max(1));
        Self {
            call_id,
            config,
            metrics,
            inbound_q,
            outbound_q,
            shutdown,
            gate: Gate::new(),
            producer,
            conv_state: ConvState::Listening,
            close_reason: None,
            epoch: 0,
            needs_apology: false,
            terminal_enqueued_for_epoch: None,
            turn_rt: None,
            slot_state: SlotState::default(),
            slot_backup: None,
            memory,
            transcript: Vec::new(),
            memory_summary: String::new(),
            turn_cancel: None,
            turn_rx_slot: None,
            turn_q_gen: 0,
            spec_tx,
            spec_rx: Some(spec_rx),
            spec_cancel: None,
            spec_key: String::new(),
            spec_result: None,
            idle_deadline,
        }
    }

    /// The writer subscribes here before the machine starts.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn start(&mut self) {
        self.enqueue_outbound(OutboundEnvelope::new(
            OutboundEvent::Config {
                config: PlatformConfig {
                    auto_reconnect: self.config.auto_reconnect,
                    call_details: self.config.call_details,
                },
            },
            None,
            None,
        ));

        if self.config.auto_reconnect {
            spawn_ping_loop(
                self.outbound_q.clone(),
                self.config.ping_interval_ms,
                self.config.keepalive_ping_write_deadline_ms,
                self.shutdown.clone(),
            );
        }

        // BEGIN stream for response_id=0: a greeting, or an empty terminal
        // when the policy is to wait for the user.
        if self.config.speak_first {
            self.set_conv_state(ConvState::Speaking, "begin_greeting");
            let greeting = self.config.greeting.clone();
            let segments = micro_chunk_text(
                &greeting,
                SegmentPurpose::Content,
                true,
                &ChunkOptions::from_config(&self.config),
            );
            for seg in &segments {
                self.enqueue_segment(seg);
            }
            self.enqueue_terminal(false);
            self.set_conv_state(ConvState::Listening, "begin_complete");
        } else {
            self.enqueue_terminal(false);
        }
    }

    /// Run the machine until the session ends; returns the close reason.
    ///
    /// The loop holds three persistent waiters: the inbound queue (control
    /// frames preferred), the speculative channel, and the current turn's
    /// output channel.
    pub async fn run(mut self) -> CloseReason {
        self.start();

        enum LoopEvent {
            Inbound(Result<InboundItem, QueueClosed>),
            Spec(Option<SpeculativeResult>),
            Turn(Option<TurnOutput>),
            Idle,
        }

        let inbound_q = self.inbound_q.clone();
        let mut spec_rx = self.spec_rx.take().expect("speculative receiver");
        let mut active_turn: Option<mpsc::Receiver<TurnOutput>> = None;
        let mut active_gen = self.turn_q_gen;

        loop {
            if let Some(reason) = self.close_reason {
                return reason;
            }

            // REQUIRED: if the turn output channel was replaced, the old
            // receiver would park this loop on an orphaned queue forever.
            // Swap it before waiting, draining whatever the dead turn left.
            if self.turn_q_gen != active_gen {
                if let Some(mut old) = active_turn.take() {
                    let mut drained: u64 = 0;
                    while old.try_recv().is_ok() {
                        drained += 1;
                    }
                    if drained > 0 {
                        self.metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, drained);
                    }
                }
                active_turn = self.turn_rx_slot.take();
                active_gen = self.turn_q_gen;
            }

            let event = tokio::select! {
                item = inbound_q.pop_prefer(InboundItem::is_control) => LoopEvent::Inbound(item),
                spec = spec_rx.recv() => LoopEvent::Spec(spec),
                out = async { active_turn.as_mut().expect("armed waiter").recv().await },
                    if active_turn.is_some() => LoopEvent::Turn(out),
                _ = tokio::time::sleep_until(self.idle_deadline) => LoopEvent::Idle,
            };

            match event {
                LoopEvent::Inbound(Ok(InboundItem::TransportClosed { reason })) => {
                    return self.end_session(reason);
                }
                LoopEvent::Inbound(Ok(InboundItem::Event(ev))) => {
                    self.idle_deadline = Instant::now()
                        + Duration::from_millis(self.config.idle_timeout_ms.max(1));
                    self.handle_event(ev);
                }
                LoopEvent::Inbound(Err(_)) => {
                    return self.end_session(CloseReason::Shutdown);
                }
                LoopEvent::Spec(Some(spec)) => {
                    self.spec_result = Some(spec);
                }
                LoopEvent::Spec(None) => {}
                LoopEvent::Turn(Some(out)) => {
                    self.handle_turn_output(out);
                }
                LoopEvent::Turn(None) => {
                    // Handler finished and dropped its sender.
                    active_turn = None;
                }
                LoopEvent::Idle => {
                    return self.end_session(CloseReason::IdleTimeout);
                }
            }
        }
    }

    fn end_session(&mut self, reason: CloseReason) -> CloseReason {
        if self.conv_state == ConvState::Ended {
            return self.close_reason.unwrap_or(reason);
        }
        info!(call_id = %self.call_id, reason = %reason, "session ended");
        self.metrics.inc_close_reason(reason.as_str());
        self.conv_state = ConvState::Ended;
        self.close_reason = Some(reason);
        self.cancel_turn("session_end");
        self.cancel_speculative();
        self.inbound_q.close();
        self.outbound_q.close();
        self.shutdown.cancel();
        reason
    }

    fn set_conv_state(&mut self, new_state: ConvState, reason: &str) {
        if self.conv_state == new_state {
            return;
        }
        debug!(
            call_id = %self.call_id,
            epoch = self.epoch,
            from = ?self.conv_state,
            to = ?new_state,
            reason,
            "conversation state transition"
        );
        self.conv_state = new_state;
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, ev: InboundEvent) {
        if self.conv_state == ConvState::Ended {
            return;
        }
        match ev {
            InboundEvent::PingPong { timestamp } => {
                if self.config.auto_reconnect {
                    self.enqueue_outbound(
                        OutboundEnvelope::new(OutboundEvent::PingPong { timestamp }, None, None)
                            .with_deadline_ms(self.config.keepalive_ping_write_deadline_ms),
                    );
                }
            }
            InboundEvent::CallDetails { call } => self.ingest_call_details(&call),
            InboundEvent::Clear => {
                // Explicit interruption signal; same routing as a barge-in
                // hint but unconditional on turntaking.
                self.barge_in_cancel("clear");
            }
            InboundEvent::UpdateOnly {
                transcript,
                turntaking,
            } => {
                self.update_transcript(&transcript);
                if turntaking == Some(TurnTaking::UserTurn) && self.barge_in_cancel("barge_in_hint")
                {
                    return;
                }
                if self.config.speculative_planning_enabled
                    && turntaking != Some(TurnTaking::AgentTurn)
                {
                    self.maybe_start_speculative();
                }
            }
            InboundEvent::ResponseRequired {
                response_id,
                transcript,
            } => self.on_response_required(response_id, transcript, false),
            InboundEvent::ReminderRequired {
                response_id,
                transcript,
            } => self.on_response_required(response_id, transcript, true),
            InboundEvent::Unknown(_) => {
                // Counted at the reader; nothing to dispatch.
            }
        }
    }

    fn ingest_call_details(&mut self, call: &Value) {
        let Some(obj) = call.as_object() else { return };
        let mut absorb = |map: &serde_json::Map<String, Value>| {
            for (key, value) in map {
                let rendered = match value {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                if !rendered.is_empty() {
                    self.slot_state
                        .call_metadata
                        .insert(key.clone(), rendered);
                }
            }
        };
        absorb(obj);
        if let Some(metadata) = obj.get("metadata").and_then(|v| v.as_object()) {
            absorb(metadata);
        }
    }

    // -----------------------------------------------------------------------
    // Turn lifecycle
    // -----------------------------------------------------------------------

    fn on_response_required(
        &mut self,
        new_epoch: u64,
        transcript: Vec<TranscriptUtterance>,
        reminder: bool,
    ) {
        if new_epoch < self.epoch {
            debug!(call_id = %self.call_id, new_epoch, epoch = self.epoch, "stale turn request");
            return;
        }
        if new_epoch == self.epoch && self.turn_cancel.is_some() {
            // Same epoch re-prompt: deliver the fresher transcript to the
            // existing handler's epoch, do not respawn.
            self.update_transcript(&transcript);
            return;
        }

        self.halt_speculative_task();
        let old_epoch = self.epoch;
        let was_speaking = self.conv_state == ConvState::Speaking;

        // Slot rollback policy: keep mutations from the old epoch only if it
        // actually spoke. Interrupting before any segment means the user
        // never heard the commitment.
        if new_epoch != old_epoch {
            let spoke_any = self
                .turn_rt
                .as_ref()
                .is_some_and(|rt| rt.epoch == old_epoch && rt.first_segment_at.is_some());
            if spoke_any {
                self.commit_slots(old_epoch);
            } else {
                self.rollback_slots(old_epoch, "new_epoch");
            }
        }

        // Atomic epoch transition; no suspension points in this block, and
        // the gate publication makes it observable to the writer before any
        // new-epoch frame can be dequeued.
        self.epoch = new_epoch;
        self.terminal_enqueued_for_epoch = None;
        self.gate.set_epoch(new_epoch);
        self.turn_rt = Some(TurnRuntime {
            epoch: new_epoch,
            finalized_at: Instant::now(),
            first_segment_at: None,
        });
        self.arm_slot_backup(new_epoch);
        if was_speaking {
            self.needs_apology = true;
        }
        self.cancel_turn("new_epoch");

        let stale = self
            .outbound_q
            .drop_where(|env| env.epoch.is_some_and(|e| e != new_epoch));
        if stale > 0 {
            self.metrics
                .inc(names::STALE_SEGMENT_DROPPED_TOTAL, stale as u64);
        }

        self.update_transcript(&transcript);
        let last_user = self.last_user_utterance();

        // A reminder with no user utterance yet must not speak; complete the
        // epoch with an empty terminal to avoid overtalk.
        if reminder && last_user.trim().is_empty() {
            self.enqueue_terminal(false);
            self.commit_slots(new_epoch);
            self.set_conv_state(ConvState::Listening, "reminder_no_user_silence");
            return;
        }

        self.set_conv_state(ConvState::Processing, "response_required");
        self.apply_tentative_slots(&last_user);

        let prefetched = self.take_speculative_match();
        let needs_apology = self.needs_apology;
        self.needs_apology = false;

        let (tx, rx) = mpsc::channel(self.config.turn_queue_max);
        let token = self.shutdown.child_token();
        let handler = TurnHandler::new(
            TurnHandlerParams {
                ctx: TurnContext {
                    call_id: self.call_id.clone(),
                    turn_id: new_epoch,
                    transcript: self.transcript.clone(),
                    memory_summary: self.memory_summary.clone(),
                    slots: self.slot_state.clone(),
                    needs_apology,
                    reminder,
                },
                epoch: new_epoch,
                chunk_opts: ChunkOptions::from_config(&self.config),
                filler_threshold_ms: self.config.producer_filler_threshold_ms,
                producer_timeout_ms: self.config.producer_timeout_ms,
                prefetched,
            },
            self.producer.clone(),
            tx,
            token.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(handler.run());
        self.turn_cancel = Some(token);
        self.turn_rx_slot = Some(rx);
        self.turn_q_gen += 1;
    }

    fn cancel_turn(&mut self, reason: &str) {
        if let Some(token) = self.turn_cancel.take() {
            debug!(call_id = %self.call_id, epoch = self.epoch, reason, "turn cancelled");
            token.cancel();
        }
        self.turn_rx_slot = None;
        self.turn_q_gen += 1;
    }

    /// Stop speaking immediately and close the current epoch with an empty
    /// terminal chunk. Returns false when there was nothing to interrupt.
    fn barge_in_cancel(&mut self, reason: &str) -> bool {
        let epoch = self.epoch;
        let has_pending_speech = self.outbound_q.any_where(|env| {
            env.epoch == Some(epoch)
                && matches!(
                    env.msg,
                    OutboundEvent::Response {
                        content_complete: false,
                        ..
                    }
                )
        });
        if self.conv_state != ConvState::Speaking && !has_pending_speech {
            return false;
        }

        let started = Instant::now();

        // Invalidate already-queued chunks for this epoch.
        let new_gen = self.gate.bump_speak_gen();
        let dropped = self.outbound_q.drop_where(|env| {
            env.epoch == Some(epoch) && env.speak_gen.is_some_and(|g| g != new_gen)
        });
        if dropped > 0 {
            self.metrics
                .inc(names::STALE_SEGMENT_DROPPED_TOTAL, dropped as u64);
        }

        self.rollback_slots(epoch, reason);
        self.cancel_turn(reason);

        // The closing empty terminal rides the control plane so a stalled or
        // backed-up speech queue cannot delay it.
        let mut env = OutboundEnvelope::new(OutboundEvent::terminal(epoch), Some(epoch), Some(new_gen));
        env.priority = Priority::Control;
        env.plane = Plane::Control;
        self.enqueue_outbound(env);
        self.terminal_enqueued_for_epoch = Some(epoch);

        self.set_conv_state(ConvState::Listening, reason);
        self.needs_apology = true;
        self.metrics.observe(
            names::BARGE_IN_CANCEL_LATENCY_MS,
            started.elapsed().as_millis() as u64,
        );
        true
    }

    fn handle_turn_output(&mut self, out: TurnOutput) {
        if out.epoch != self.epoch {
            self.metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, 1);
            return;
        }
        match out.kind {
            TurnOutputKind::Plan(plan) => {
                for seg in &plan.segments {
                    self.emit_segment_tracked(seg);
                }
            }
            TurnOutputKind::Complete { end_call } => {
                self.commit_slots(self.epoch);
                if self.terminal_enqueued_for_epoch != Some(self.epoch) {
                    self.enqueue_terminal(end_call);
                }
                self.set_conv_state(ConvState::Listening, "turn_complete");
            }
        }
    }

    fn emit_segment_tracked(&mut self, seg: &SpeechSegment) {
        if self.conv_state != ConvState::Speaking {
            self.set_conv_state(ConvState::Speaking, "first_segment");
        }
        if let Some(rt) = self.turn_rt.as_mut() {
            if rt.epoch == self.epoch && rt.first_segment_at.is_none() {
                let now = Instant::now();
                rt.first_segment_at = Some(now);
                self.metrics.observe(
                    names::TURN_FINAL_TO_FIRST_SEGMENT_MS,
                    now.duration_since(rt.finalized_at).as_millis() as u64,
                );
            }
        }
        self.enqueue_segment(seg);
    }

    // -----------------------------------------------------------------------
    // Slot backup / rollback
    // -----------------------------------------------------------------------

    fn arm_slot_backup(&mut self, epoch: u64) {
        self.slot_backup = Some((epoch, self.slot_state.snapshot()));
    }

    fn commit_slots(&mut self, epoch: u64) {
        if self.slot_backup.as_ref().is_some_and(|(e, _)| *e == epoch) {
            self.slot_backup = None;
        }
    }

    fn rollback_slots(&mut self, epoch: u64, reason: &str) {
        if let Some((backup_epoch, snapshot)) = self.slot_backup.take() {
            if backup_epoch == epoch {
                debug!(call_id = %self.call_id, epoch, reason, "slot state rolled back");
                self.slot_state.restore(snapshot);
                self.metrics.inc(names::TURN_ROLLBACK_TOTAL, 1);
            } else {
                self.slot_backup = Some((backup_epoch, snapshot));
            }
        }
    }

    fn apply_tentative_slots(&mut self, last_user: &str) {
        if let Some(m) = PHONE_PAT.find(last_user) {
            if self.slot_state.phone.as_deref() != Some(m.as_str()) {
                self.slot_state.phone = Some(m.as_str().to_string());
                self.slot_state.phone_confirmed = false;
            }
        } else if self.slot_state.phone.is_some()
            && !self.slot_state.phone_confirmed
            && AFFIRMATIVE_PAT.is_match(last_user)
        {
            self.slot_state.phone_confirmed = true;
        }
        if BOOKING_PAT.is_match(last_user) && self.slot_state.intent.is_none() {
            self.slot_state.intent = Some("booking".to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Transcript memory
    // -----------------------------------------------------------------------

    fn update_transcript(&mut self, transcript: &[TranscriptUtterance]) {
        let view = self.memory.ingest_snapshot(transcript, Some(&self.slot_state));
        self.transcript = view.recent_transcript;
        self.memory_summary = view.summary_blob;
        if view.compacted {
            self.metrics.inc(names::MEMORY_COMPACTIONS_TOTAL, 1);
        }
        self.metrics
            .set_gauge(names::MEMORY_CHARS_CURRENT, view.chars_current as i64);
        self.metrics.set_gauge(
            names::MEMORY_UTTERANCES_CURRENT,
            view.utterances_current as i64,
        );
    }

    fn last_user_utterance(&self) -> String {
        self.transcript
            .iter()
            .rev()
            .find(|u| u.role == Role::User)
            .map(|u| u.content.clone())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Speculative preparation
    // -----------------------------------------------------------------------

    fn transcript_key(&self) -> String {
        use sha2::{Digest, Sha256};
        let last_user = self.last_user_utterance();
        let payload = format!("{}|{}", self.transcript.len(), last_user.trim().to_lowercase());
        format!("{:x}", Sha256::digest(payload.as_bytes()))
    }

    fn maybe_start_speculative(&mut self) {
        if self.conv_state != ConvState::Listening {
            return;
        }
        let key = self.transcript_key();
        if key == self.spec_key
            && self
                .spec_cancel
                .as_ref()
                .is_some_and(|t| !t.is_cancelled())
        {
            return;
        }
        self.spec_key = key.clone();
        self.halt_speculative_task();
        self.spec_result = None;

        let token = self.shutdown.child_token();
        self.spec_cancel = Some(token.clone());
        let producer = self.producer.clone();
        let tx = self.spec_tx.clone();
        let metrics = self.metrics.clone();
        let debounce = Duration::from_millis(self.config.speculative_debounce_ms);
        let ctx = TurnContext {
            call_id: self.call_id.clone(),
            turn_id: self.epoch + 1,
            transcript: self.transcript.clone(),
            memory_summary: self.memory_summary.clone(),
            slots: self.slot_state.clone(),
            needs_apology: false,
            reminder: false,
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            let reply = tokio::select! {
                _ = token.cancelled() => return,
                reply = producer.respond(&ctx) => reply,
            };
            if let Ok(reply) = reply {
                metrics.inc(names::SPECULATIVE_PLANS_TOTAL, 1);
                let _ = tx.try_send(SpeculativeResult {
                    transcript_key: key,
                    reply,
                });
            }
        });
    }

    fn halt_speculative_task(&mut self) {
        if let Some(token) = self.spec_cancel.take() {
            token.cancel();
        }
    }

    fn cancel_speculative(&mut self) {
        self.halt_speculative_task();
        self.spec_result = None;
    }

    fn take_speculative_match(&mut self) -> Option<ProducerReply> {
        let spec = self.spec_result.take()?;
        if spec.transcript_key == self.transcript_key() {
            self.metrics.inc(names::SPECULATIVE_USED_TOTAL, 1);
            Some(spec.reply)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    fn enqueue_segment(&mut self, seg: &SpeechSegment) {
        let gate = self.gate.snapshot();
        let mut env = OutboundEnvelope::new(
            OutboundEvent::chunk(self.epoch, seg.rendered.clone()),
            Some(self.epoch),
            Some(gate.speak_gen),
        );
        if seg.purpose == SegmentPurpose::Filler {
            env.priority = Priority::Low;
        }
        self.enqueue_outbound(env);
    }

    fn enqueue_terminal(&mut self, end_call: bool) {
        let gate = self.gate.snapshot();
        let msg = if end_call {
            OutboundEvent::Response {
                response_id: self.epoch,
                content: String::new(),
                content_complete: true,
                no_interruption_allowed: None,
                end_call: Some(true),
            }
        } else {
            OutboundEvent::terminal(self.epoch)
        };
        let env = OutboundEnvelope::new(msg, Some(self.epoch), Some(gate.speak_gen));
        self.enqueue_outbound(env);
        self.terminal_enqueued_for_epoch = Some(self.epoch);
    }

    fn enqueue_outbound(&mut self, env: OutboundEnvelope) {
        if self.shutdown.is_cancelled() {
            return;
        }
        // Refuse non-terminal speech for an epoch whose terminal is already
        // queued; producers must have stopped by then.
        if let Some(response_id) = env.msg.response_id() {
            if !env.msg.is_terminal_response()
                && self.terminal_enqueued_for_epoch == Some(response_id)
            {
                self.metrics.inc(names::STALE_SEGMENT_DROPPED_TOTAL, 1);
                return;
            }
        }

        let gate = self.gate.snapshot();
        let env_priority = env.priority;
        let env_plane = env.plane;
        let outcome = self.outbound_q.push_or_evict(env, move |existing| {
            // Terminal frames are the correctness boundary; never evict them.
            if existing.msg.is_terminal_response() {
                return false;
            }
            // Stale gates first, to keep the queue from bloating.
            if existing.epoch.is_some_and(|e| e != gate.epoch) {
                return true;
            }
            if existing.speak_gen.is_some_and(|g| g != gate.speak_gen) {
                return true;
            }
            // Control never yields to speech; speech always yields to control.
            if existing.plane == Plane::Control && env_plane != Plane::Control {
                return false;
            }
            if env_plane == Plane::Control && existing.plane != Plane::Control {
                return true;
            }
            existing.priority > env_priority
        });
        if !outcome.admitted() {
            self.metrics.inc(names::OUTBOUND_QUEUE_DROPPED_TOTAL, 1);
        }
    }
}
