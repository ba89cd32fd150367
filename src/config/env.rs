use std::env;

use super::utils::parse_bool;
use super::{BrainConfig, DashPauseScope, SpeechMarkupMode};

fn env_str(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

impl BrainConfig {
    /// Load configuration from environment variables.
    ///
    /// Also loads from a `.env` file if present. Malformed values fall back to
    /// the defaults rather than failing startup; only a malformed `PORT` is an
    /// error because a wrong bind address is never recoverable.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let _ = dotenvy::dotenv();

        let defaults = BrainConfig::default();

        let host = env_str("HOST", &defaults.host);
        let port = env::var("PORT")
            .unwrap_or_else(|_| defaults.port.to_string())
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;

        Ok(BrainConfig {
            host,
            port,
            websocket_enforce_canonical_route: env_bool(
                "WEBSOCKET_ENFORCE_CANONICAL_ROUTE",
                defaults.websocket_enforce_canonical_route,
            ),
            auto_reconnect: env_bool("BRAIN_AUTO_RECONNECT", defaults.auto_reconnect),
            call_details: env_bool("BRAIN_CALL_DETAILS", defaults.call_details),
            speak_first: env_bool("BRAIN_SPEAK_FIRST", defaults.speak_first),
            greeting: env_str("BRAIN_GREETING", &defaults.greeting),
            inbound_queue_max: env_usize("BRAIN_INBOUND_QUEUE_MAX", defaults.inbound_queue_max)
                .max(1),
            outbound_queue_max: env_usize("BRAIN_OUTBOUND_QUEUE_MAX", defaults.outbound_queue_max)
                .max(1),
            turn_queue_max: env_usize("BRAIN_TURN_QUEUE_MAX", defaults.turn_queue_max).max(1),
            idle_timeout_ms: env_u64("BRAIN_IDLE_TIMEOUT_MS", defaults.idle_timeout_ms),
            ping_interval_ms: env_u64("BRAIN_PING_INTERVAL_MS", defaults.ping_interval_ms),
            keepalive_ping_write_deadline_ms: env_u64(
                "KEEPALIVE_PING_WRITE_DEADLINE_MS",
                defaults.keepalive_ping_write_deadline_ms,
            ),
            ws_write_timeout_ms: env_u64("WS_WRITE_TIMEOUT_MS", defaults.ws_write_timeout_ms)
                .max(1),
            ws_close_on_write_timeout: env_bool(
                "WS_CLOSE_ON_WRITE_TIMEOUT",
                defaults.ws_close_on_write_timeout,
            ),
            ws_max_consecutive_write_timeouts: env_u64(
                "WS_MAX_CONSECUTIVE_WRITE_TIMEOUTS",
                defaults.ws_max_consecutive_write_timeouts as u64,
            )
            .max(1) as u32,
            ws_max_frame_bytes: env_usize("WS_MAX_FRAME_BYTES", defaults.ws_max_frame_bytes),
            transcript_max_utterances: env_usize(
                "TRANSCRIPT_MAX_UTTERANCES",
                defaults.transcript_max_utterances,
            )
            .max(1),
            transcript_max_chars: env_usize("TRANSCRIPT_MAX_CHARS", defaults.transcript_max_chars)
                .max(1),
            speech_markup_mode: SpeechMarkupMode::parse(&env_str(
                "SPEECH_MARKUP_MODE",
                "DASH_PAUSE",
            )),
            dash_pause_scope: DashPauseScope::parse(&env_str("DASH_PAUSE_SCOPE", "PROTECTED_ONLY")),
            dash_pause_unit_ms: env_u64("DASH_PAUSE_UNIT_MS", defaults.dash_pause_unit_ms),
            digit_dash_pause_unit_ms: env_u64(
                "DIGIT_DASH_PAUSE_UNIT_MS",
                defaults.digit_dash_pause_unit_ms,
            ),
            pace_ms_per_char: env_u64("PACE_MS_PER_CHAR", defaults.pace_ms_per_char),
            max_segment_expected_ms: env_u64(
                "MAX_SEGMENT_EXPECTED_MS",
                defaults.max_segment_expected_ms,
            ),
            producer_filler_threshold_ms: env_u64(
                "PRODUCER_FILLER_THRESHOLD_MS",
                defaults.producer_filler_threshold_ms,
            ),
            producer_timeout_ms: env_u64("PRODUCER_TIMEOUT_MS", defaults.producer_timeout_ms),
            speculative_planning_enabled: env_bool(
                "SPECULATIVE_PLANNING_ENABLED",
                defaults.speculative_planning_enabled,
            ),
            speculative_debounce_ms: env_u64(
                "SPECULATIVE_DEBOUNCE_MS",
                defaults.speculative_debounce_ms,
            ),
            ws_allowlist_enabled: env_bool("WS_ALLOWLIST_ENABLED", defaults.ws_allowlist_enabled),
            ws_allowlist_cidrs: env_str("WS_ALLOWLIST_CIDRS", ""),
            ws_trusted_proxy_enabled: env_bool(
                "WS_TRUSTED_PROXY_ENABLED",
                defaults.ws_trusted_proxy_enabled,
            ),
            ws_trusted_proxy_cidrs: env_str("WS_TRUSTED_PROXY_CIDRS", ""),
            ws_shared_secret_enabled: env_bool(
                "WS_SHARED_SECRET_ENABLED",
                defaults.ws_shared_secret_enabled,
            ),
            ws_shared_secret: env_str("WS_SHARED_SECRET", ""),
            ws_shared_secret_header: env_str(
                "WS_SHARED_SECRET_HEADER",
                &defaults.ws_shared_secret_header,
            ),
            ws_query_token: env_str("WS_QUERY_TOKEN", ""),
            ws_query_token_param: env_str("WS_QUERY_TOKEN_PARAM", &defaults.ws_query_token_param),
        })
    }
}
