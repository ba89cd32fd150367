//! Per-turn handler task.
//!
//! A `TurnHandler` produces speech plans for exactly one epoch. It emits a
//! deterministic ACK first (even when the producer has nothing yet), masks
//! producer latency with a filler phrase, then streams the planned content.
//! Cancellation is a child token fired by the machine; every await in here
//! races against it and nothing outlives it.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::metrics::{CompositeMetrics, names};
use super::producer::{ProducerReply, TurnContext, TurnProducer};
use super::speech::phrases::{ack_text, filler_text};
use super::speech::{ChunkOptions, SegmentPurpose, SpeechPlan, micro_chunk_text};
use std::sync::Arc;

/// Output of a turn handler, consumed by the machine's turn-output waiter.
#[derive(Debug)]
pub struct TurnOutput {
    pub epoch: u64,
    pub kind: TurnOutputKind,
}

#[derive(Debug)]
pub enum TurnOutputKind {
    Plan(SpeechPlan),
    Complete { end_call: bool },
}

pub struct TurnHandlerParams {
    pub ctx: TurnContext,
    pub epoch: u64,
    pub chunk_opts: ChunkOptions,
    pub filler_threshold_ms: u64,
    pub producer_timeout_ms: u64,
    /// Reply precomputed speculatively for this transcript, if still valid.
    pub prefetched: Option<ProducerReply>,
}

pub struct TurnHandler {
    params: TurnHandlerParams,
    producer: Arc<dyn TurnProducer>,
    output_tx: mpsc::Sender<TurnOutput>,
    cancel: CancellationToken,
    metrics: CompositeMetrics,
    used_phrases: HashSet<String>,
}

impl TurnHandler {
    pub fn new(
        params: TurnHandlerParams,
        producer: Arc<dyn TurnProducer>,
        output_tx: mpsc::Sender<TurnOutput>,
        cancel: CancellationToken,
        metrics: CompositeMetrics,
    ) -> Self {
        Self {
            params,
            producer,
            output_tx,
            cancel,
            metrics,
            used_phrases: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        let epoch = self.params.epoch;
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Cancelled epochs stop immediately; the machine emits the
                // empty terminal frame for them.
                debug!(epoch, "turn handler cancelled");
            }
            _ = self.run_inner() => {}
        }
    }

    async fn run_inner(&mut self) {
        let epoch = self.params.epoch;

        // ACK goes out before the producer is consulted so the caller hears
        // something inside the latency budget, tool-first turns included.
        let ack = ack_text(
            &self.params.ctx.call_id,
            self.params.ctx.turn_id,
            self.params.ctx.needs_apology,
            &mut self.used_phrases,
        );
        let ack_segments = micro_chunk_text(&ack, SegmentPurpose::Ack, true, &self.params.chunk_opts);
        if !ack_segments.is_empty()
            && !self
                .emit(TurnOutputKind::Plan(SpeechPlan::new(
                    SegmentPurpose::Ack,
                    ack_segments,
                )))
                .await
        {
            return;
        }

        let reply = match self.params.prefetched.take() {
            Some(reply) => reply,
            None => self.drive_producer().await,
        };

        let segments = micro_chunk_text(
            &reply.text,
            reply.purpose,
            true,
            &self.params.chunk_opts,
        );
        if !segments.is_empty()
            && !self
                .emit(TurnOutputKind::Plan(SpeechPlan::new(reply.purpose, segments)))
                .await
        {
            return;
        }

        let _ = self
            .emit(TurnOutputKind::Complete {
                end_call: reply.end_call,
            })
            .await;
        debug!(epoch, "turn handler complete");
    }

    /// Ask the producer for the turn's reply, emitting a filler phrase if the
    /// first payload is late and falling back deterministically on failure or
    /// deadline.
    async fn drive_producer(&mut self) -> ProducerReply {
        let ctx = self.params.ctx.clone();
        let producer = self.producer.clone();
        let respond = async move { producer.respond(&ctx).await };
        tokio::pin!(respond);

        let threshold = Duration::from_millis(self.params.filler_threshold_ms.max(1));
        let deadline = Duration::from_millis(
            self.params
                .producer_timeout_ms
                .max(self.params.filler_threshold_ms)
                .max(1),
        );

        tokio::select! {
            result = &mut respond => return self.unwrap_reply(result),
            _ = tokio::time::sleep(threshold) => {}
        }

        // Producer is late; mask the wait with a filler phrase.
        let filler = filler_text(
            &self.params.ctx.call_id,
            self.params.ctx.turn_id,
            0,
            &mut self.used_phrases,
        );
        let segments =
            micro_chunk_text(&filler, SegmentPurpose::Filler, true, &self.params.chunk_opts);
        if !segments.is_empty()
            && !self
                .emit(TurnOutputKind::Plan(SpeechPlan::new(
                    SegmentPurpose::Filler,
                    segments,
                )))
                .await
        {
            // Machine stopped consuming; the reply no longer matters.
            return fallback_reply();
        }

        let remaining = deadline.saturating_sub(threshold);
        tokio::select! {
            result = &mut respond => self.unwrap_reply(result),
            _ = tokio::time::sleep(remaining) => {
                self.metrics.inc(names::PRODUCER_FAILURES_TOTAL, 1);
                fallback_reply()
            }
        }
    }

    fn unwrap_reply(
        &self,
        result: Result<ProducerReply, super::producer::ProducerError>,
    ) -> ProducerReply {
        match result {
            Ok(reply) => reply,
            Err(err) => {
                debug!(error = %err, "producer failed, using fallback");
                self.metrics.inc(names::PRODUCER_FAILURES_TOTAL, 1);
                fallback_reply()
            }
        }
    }

    /// Send one output to the machine. Returns false when the machine stopped
    /// consuming (cancellation or teardown); callers must bail out.
    async fn emit(&self, kind: TurnOutputKind) -> bool {
        let out = TurnOutput {
            epoch: self.params.epoch,
            kind,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.output_tx.send(out) => sent.is_ok(),
        }
    }
}

fn fallback_reply() -> ProducerReply {
    ProducerReply {
        text: "Sorry, I hit a snag. Can you say that one more time?".to_string(),
        purpose: SegmentPurpose::Error,
        end_call: false,
    }
}
