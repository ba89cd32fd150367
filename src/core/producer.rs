//! The producer seam.
//!
//! Text generation (LLM, dialogue policy, tools) lives outside the session
//! core. The core hands a producer the full bounded transcript plus the slot
//! snapshot and gets back one reply per turn; cancellation is expressed by
//! dropping the in-flight future, so implementations must not shield it.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::protocol::{Role, TranscriptUtterance};
use super::slots::SlotState;
use super::speech::SegmentPurpose;

/// Everything a producer may observe about one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub call_id: String,
    pub turn_id: u64,
    pub transcript: Vec<TranscriptUtterance>,
    /// Compaction summary of transcript that aged out of the ring.
    pub memory_summary: String,
    pub slots: SlotState,
    pub needs_apology: bool,
    pub reminder: bool,
}

impl TurnContext {
    pub fn last_user_utterance(&self) -> &str {
        self.transcript
            .iter()
            .rev()
            .find(|u| u.role == Role::User)
            .map(|u| u.content.as_str())
            .unwrap_or("")
    }
}

/// One turn's worth of reply text, before speech planning.
#[derive(Debug, Clone)]
pub struct ProducerReply {
    pub text: String,
    pub purpose: SegmentPurpose,
    pub end_call: bool,
}

impl ProducerReply {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            purpose: SegmentPurpose::Content,
            end_call: false,
        }
    }
}

#[derive(Debug, Error)]
#[error("producer failed: {0}")]
pub struct ProducerError(pub String);

#[async_trait]
pub trait TurnProducer: Send + Sync {
    async fn respond(&self, ctx: &TurnContext) -> Result<ProducerReply, ProducerError>;
}

static PHONE_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3})[\s\-\)]*(\d{3})[\s\-]*(\d{4})\b").unwrap());
static GOODBYE_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(bye|goodbye|hang up|that's all|that is all)\b").unwrap());
static PRICING_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(price|pricing|cost|how much)\b").unwrap());
static BOOKING_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(book|schedule|appointment|appt)\b").unwrap());
static HOURS_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(hours|open|close|closing|opening)\b").unwrap());

/// Deterministic rule-based producer.
///
/// The default runtime producer and the one every test runs against: no I/O,
/// no randomness, a pure function of the turn context.
#[derive(Debug, Default, Clone)]
pub struct ScriptedProducer;

#[async_trait]
impl TurnProducer for ScriptedProducer {
    async fn respond(&self, ctx: &TurnContext) -> Result<ProducerReply, ProducerError> {
        let last_user = ctx.last_user_utterance().trim().to_string();

        if last_user.is_empty() {
            if ctx.reminder {
                return Ok(ProducerReply {
                    text: "Are you still there?".to_string(),
                    purpose: SegmentPurpose::Repair,
                    end_call: false,
                });
            }
            return Ok(ProducerReply {
                text: "Sorry, I didn't catch that. Could you say it again?".to_string(),
                purpose: SegmentPurpose::Repair,
                end_call: false,
            });
        }

        if GOODBYE_PAT.is_match(&last_user) {
            return Ok(ProducerReply {
                text: "Thanks for calling. Have a great day!".to_string(),
                purpose: SegmentPurpose::Content,
                end_call: true,
            });
        }

        // Confirm a captured callback number before anything else.
        if let Some(phone) = ctx.slots.phone.as_deref() {
            if !ctx.slots.phone_confirmed {
                return Ok(ProducerReply {
                    text: format!("Just to confirm, your number is {phone}. Is that right?"),
                    purpose: SegmentPurpose::Confirm,
                    end_call: false,
                });
            }
        }

        if let Some(m) = PHONE_PAT.find(&last_user) {
            return Ok(ProducerReply {
                text: format!("Just to confirm, your number is {}. Is that right?", m.as_str()),
                purpose: SegmentPurpose::Confirm,
                end_call: false,
            });
        }

        if PRICING_PAT.is_match(&last_user) {
            return Ok(ProducerReply::content(
                "Pricing depends on the service, and most visits start at $75. \
                 Want me to check a specific treatment?",
            ));
        }

        if BOOKING_PAT.is_match(&last_user) {
            return Ok(ProducerReply::content(
                "I can help with that. What day works best for you?",
            ));
        }

        if HOURS_PAT.is_match(&last_user) {
            return Ok(ProducerReply::content(
                "We're open nine to five on weekdays, and ten to two on Saturdays.",
            ));
        }

        Ok(ProducerReply::content(
            "I can help with booking, pricing, or hours. Which would you like?",
        ))
    }
}
