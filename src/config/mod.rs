//! Configuration module for the brain server.
//!
//! Configuration comes from environment variables (with `.env` support via
//! dotenvy) on top of production defaults. See `env.rs` for the loader and
//! `utils.rs` for parsing helpers.

mod env;
pub mod utils;

/// How reply text is marked up for the platform's TTS pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechMarkupMode {
    /// Spaced dashes (" - ") are the pause primitive. Platform-accurate default.
    DashPause,
    /// No pause markup inserted.
    RawText,
    /// Experimental: `<break time="..ms"/>` tags.
    Ssml,
}

impl SpeechMarkupMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RAW_TEXT" => SpeechMarkupMode::RawText,
            "SSML" => SpeechMarkupMode::Ssml,
            _ => SpeechMarkupMode::DashPause,
        }
    }
}

/// Where dash-pause markup is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashPauseScope {
    /// Only inside protected spans (phone numbers, digit confirmation).
    ProtectedOnly,
    /// Also between segment boundaries.
    SegmentBoundary,
}

impl DashPauseScope {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SEGMENT_BOUNDARY" => DashPauseScope::SegmentBoundary,
            _ => DashPauseScope::ProtectedOnly,
        }
    }
}

/// Immutable per-process configuration, shared by every session.
#[derive(Debug, Clone)]
pub struct BrainConfig {
    // Server bind
    pub host: String,
    pub port: u16,

    // WebSocket route policy
    pub websocket_enforce_canonical_route: bool,

    // Platform config frame
    pub auto_reconnect: bool,
    pub call_details: bool,

    // Session behavior
    pub speak_first: bool,
    pub greeting: String,
    pub inbound_queue_max: usize,
    pub outbound_queue_max: usize,
    pub turn_queue_max: usize,
    pub idle_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub keepalive_ping_write_deadline_ms: u64,
    pub ws_write_timeout_ms: u64,
    pub ws_close_on_write_timeout: bool,
    pub ws_max_consecutive_write_timeouts: u32,
    pub ws_max_frame_bytes: usize,
    pub transcript_max_utterances: usize,
    pub transcript_max_chars: usize,

    // Speech markup / pacing
    pub speech_markup_mode: SpeechMarkupMode,
    pub dash_pause_scope: DashPauseScope,
    pub dash_pause_unit_ms: u64,
    pub digit_dash_pause_unit_ms: u64,
    pub pace_ms_per_char: u64,
    pub max_segment_expected_ms: u64,

    // Producer timing
    pub producer_filler_threshold_ms: u64,
    pub producer_timeout_ms: u64,

    // Speculative preparation
    pub speculative_planning_enabled: bool,
    pub speculative_debounce_ms: u64,

    // WS handshake hardening (prefer enforcing at the reverse proxy)
    pub ws_allowlist_enabled: bool,
    pub ws_allowlist_cidrs: String,
    pub ws_trusted_proxy_enabled: bool,
    pub ws_trusted_proxy_cidrs: String,
    pub ws_shared_secret_enabled: bool,
    pub ws_shared_secret: String,
    pub ws_shared_secret_header: String,
    pub ws_query_token: String,
    pub ws_query_token_param: String,
}

impl BrainConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            websocket_enforce_canonical_route: true,
            auto_reconnect: true,
            call_details: true,
            speak_first: true,
            greeting: "Hi! Thanks for calling. This is the virtual assistant. How can I help today?"
                .to_string(),
            inbound_queue_max: 256,
            outbound_queue_max: 256,
            turn_queue_max: 64,
            idle_timeout_ms: 5_000,
            ping_interval_ms: 2_000,
            keepalive_ping_write_deadline_ms: 100,
            ws_write_timeout_ms: 400,
            ws_close_on_write_timeout: true,
            ws_max_consecutive_write_timeouts: 2,
            ws_max_frame_bytes: 262_144,
            transcript_max_utterances: 200,
            transcript_max_chars: 50_000,
            speech_markup_mode: SpeechMarkupMode::DashPause,
            dash_pause_scope: DashPauseScope::ProtectedOnly,
            dash_pause_unit_ms: 200,
            digit_dash_pause_unit_ms: 150,
            pace_ms_per_char: 12,
            max_segment_expected_ms: 650,
            producer_filler_threshold_ms: 800,
            producer_timeout_ms: 3_800,
            speculative_planning_enabled: true,
            speculative_debounce_ms: 0,
            ws_allowlist_enabled: false,
            ws_allowlist_cidrs: String::new(),
            ws_trusted_proxy_enabled: false,
            ws_trusted_proxy_cidrs: String::new(),
            ws_shared_secret_enabled: false,
            ws_shared_secret: String::new(),
            ws_shared_secret_header: "X-BRAIN-SIGNATURE".to_string(),
            ws_query_token: String::new(),
            ws_query_token_param: "token".to_string(),
        }
    }
}
