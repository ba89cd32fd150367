//! Wire protocol codec for the custom-LLM WebSocket contract.
//!
//! Inbound frames are discriminated by `interaction_type`, outbound frames by
//! `response_type`. Schema drift at the remote end must never close the
//! session: an unrecognized `interaction_type` (or a known one with an invalid
//! shape) decodes into [`InboundEvent::Unknown`] carrying the raw object. Only
//! hard structural failures (frame size, malformed JSON) are fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One utterance of the platform-maintained transcript snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptUtterance {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTaking {
    AgentTurn,
    UserTurn,
}

/// Decoded inbound frame.
///
/// Extra fields on known variants are ignored, not rejected.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "interaction_type", rename_all = "snake_case")]
pub enum InboundEvent {
    PingPong {
        timestamp: i64,
    },
    CallDetails {
        #[serde(default)]
        call: Value,
    },
    UpdateOnly {
        #[serde(default)]
        transcript: Vec<TranscriptUtterance>,
        #[serde(default)]
        turntaking: Option<TurnTaking>,
    },
    ResponseRequired {
        response_id: u64,
        #[serde(default)]
        transcript: Vec<TranscriptUtterance>,
    },
    ReminderRequired {
        response_id: u64,
        #[serde(default)]
        transcript: Vec<TranscriptUtterance>,
    },
    Clear,
    /// Forward-compat catch-all; carries the raw object for counting/logging.
    #[serde(skip)]
    Unknown(Value),
}

/// Priority class of an inbound frame for queue admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InboundClass {
    /// ping_pong, clear: delivered before any backlog.
    Control,
    /// response_required / reminder_required.
    Turn,
    /// update_only snapshots.
    Update,
    /// call_details, unknown variants.
    Info,
}

impl InboundEvent {
    pub fn class(&self) -> InboundClass {
        match self {
            InboundEvent::PingPong { .. } | InboundEvent::Clear => InboundClass::Control,
            InboundEvent::ResponseRequired { .. } | InboundEvent::ReminderRequired { .. } => {
                InboundClass::Turn
            }
            InboundEvent::UpdateOnly { .. } => InboundClass::Update,
            InboundEvent::CallDetails { .. } | InboundEvent::Unknown(_) => InboundClass::Info,
        }
    }

    pub fn response_id(&self) -> Option<u64> {
        match self {
            InboundEvent::ResponseRequired { response_id, .. }
            | InboundEvent::ReminderRequired { response_id, .. } => Some(*response_id),
            _ => None,
        }
    }
}

/// The one-shot configuration the brain sends at session open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub auto_reconnect: bool,
    pub call_details: bool,
}

/// Encoded outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Config {
        config: PlatformConfig,
    },
    PingPong {
        timestamp: i64,
    },
    Response {
        response_id: u64,
        content: String,
        content_complete: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        no_interruption_allowed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_call: Option<bool>,
    },
    /// Reserved; disabled by default.
    AgentInterrupt {
        interrupt_id: u64,
        content: String,
        content_complete: bool,
    },
}

impl OutboundEvent {
    /// Plain non-terminal speech chunk.
    pub fn chunk(response_id: u64, content: impl Into<String>) -> Self {
        OutboundEvent::Response {
            response_id,
            content: content.into(),
            content_complete: false,
            no_interruption_allowed: None,
            end_call: None,
        }
    }

    /// Empty terminal frame closing the epoch.
    pub fn terminal(response_id: u64) -> Self {
        OutboundEvent::Response {
            response_id,
            content: String::new(),
            content_complete: true,
            no_interruption_allowed: None,
            end_call: None,
        }
    }

    pub fn is_ping(&self) -> bool {
        matches!(self, OutboundEvent::PingPong { .. })
    }

    pub fn response_id(&self) -> Option<u64> {
        match self {
            OutboundEvent::Response { response_id, .. } => Some(*response_id),
            _ => None,
        }
    }

    pub fn is_terminal_response(&self) -> bool {
        matches!(
            self,
            OutboundEvent::Response {
                content_complete: true,
                ..
            }
        )
    }
}

/// Hard structural decode failures. Anything softer becomes
/// [`InboundEvent::Unknown`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(usize),
    #[error("frame is not valid JSON")]
    BadJson,
}

/// Decode one inbound text frame.
///
/// `max_frame_bytes == 0` disables the size cap. A frame of exactly the cap is
/// accepted; one byte over is rejected.
pub fn decode_inbound(raw: &str, max_frame_bytes: usize) -> Result<InboundEvent, DecodeError> {
    if max_frame_bytes > 0 && raw.len() > max_frame_bytes {
        return Err(DecodeError::FrameTooLarge(raw.len()));
    }
    let value: Value = serde_json::from_str(raw).map_err(|_| DecodeError::BadJson)?;
    match serde_json::from_value::<InboundEvent>(value.clone()) {
        Ok(ev) => Ok(ev),
        Err(_) => Ok(InboundEvent::Unknown(value)),
    }
}

/// Encode one outbound frame as minimal JSON.
pub fn encode_outbound(ev: &OutboundEvent) -> String {
    // Serialization of these variants cannot fail.
    serde_json::to_string(ev).expect("outbound frame serialization")
}
