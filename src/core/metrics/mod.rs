//! Session metrics: counters, millisecond histograms, and gauges.
//!
//! Every error path in the session core terminates in a counter increment, so
//! metric names double as the observable error taxonomy. Names are dotted
//! (`inbound.bad_schema_total`); the Prometheus exporter rewrites dots to
//! underscores at render time.

mod prom;

pub use prom::{GLOBAL_PROM, PromExporter};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Metric names used across the session core.
pub mod names {
    pub const INBOUND_BAD_SCHEMA_TOTAL: &str = "inbound.bad_schema_total";
    pub const INBOUND_QUEUE_EVICTIONS_TOTAL: &str = "inbound.queue_evictions_total";
    pub const INBOUND_QUEUE_DROPPED_TOTAL: &str = "inbound.queue_dropped_total";
    pub const OUTBOUND_QUEUE_DROPPED_TOTAL: &str = "outbound.queue_dropped_total";
    pub const STALE_SEGMENT_DROPPED_TOTAL: &str = "stale_segment_dropped_total";
    pub const WS_WRITE_TIMEOUT_TOTAL: &str = "ws.write_timeout_total";
    pub const WS_CLOSE_REASON_TOTAL: &str = "ws.close_reason_total";
    pub const KEEPALIVE_QUEUE_DELAY_MS: &str = "keepalive.ping_pong_queue_delay_ms";
    pub const KEEPALIVE_MISSED_DEADLINE_TOTAL: &str = "keepalive.ping_pong_missed_deadline_total";
    pub const KEEPALIVE_WRITE_ATTEMPT_TOTAL: &str = "keepalive.ping_pong_write_attempt_total";
    pub const KEEPALIVE_WRITE_TIMEOUT_TOTAL: &str = "keepalive.ping_pong_write_timeout_total";
    pub const MEMORY_COMPACTIONS_TOTAL: &str = "memory.transcript_compactions_total";
    pub const MEMORY_CHARS_CURRENT: &str = "memory.transcript_chars_current";
    pub const MEMORY_UTTERANCES_CURRENT: &str = "memory.transcript_utterances_current";
    pub const TURN_ROLLBACK_TOTAL: &str = "turn.rollback_total";
    pub const TURN_FINAL_TO_FIRST_SEGMENT_MS: &str = "turn.final_to_first_segment_ms";
    pub const BARGE_IN_CANCEL_LATENCY_MS: &str = "turn.barge_in_cancel_latency_ms";
    pub const SPECULATIVE_PLANS_TOTAL: &str = "speculative.plans_total";
    pub const SPECULATIVE_USED_TOTAL: &str = "speculative.used_total";
    pub const PRODUCER_FAILURES_TOTAL: &str = "producer.failures_total";
}

/// Write side of a metrics pipeline. Implemented by both the per-session
/// [`Metrics`] store and the process-global [`PromExporter`].
pub trait MetricsSink: Send + Sync {
    fn inc(&self, name: &str, value: u64);
    fn observe(&self, name: &str, value_ms: u64);
    fn set_gauge(&self, name: &str, value: i64);
}

#[derive(Default)]
struct MetricsInner {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, Vec<u64>>,
    gauges: HashMap<String, i64>,
}

/// Per-session metrics store with full sample retention, readable in tests.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn get_hist(&self, name: &str) -> Vec<u64> {
        self.inner
            .lock()
            .histograms
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.inner.lock().gauges.get(name).copied().unwrap_or(0)
    }

    pub fn percentile(&self, name: &str, p: f64) -> Option<u64> {
        let inner = self.inner.lock();
        let mut values = inner.histograms.get(name)?.clone();
        if values.is_empty() {
            return None;
        }
        values.sort_unstable();
        let p = p.clamp(0.0, 100.0);
        let k = ((p / 100.0) * (values.len() - 1) as f64).round() as usize;
        Some(values[k])
    }
}

impl MetricsSink for Metrics {
    fn inc(&self, name: &str, value: u64) {
        *self
            .inner
            .lock()
            .counters
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    fn observe(&self, name: &str, value_ms: u64) {
        self.inner
            .lock()
            .histograms
            .entry(name.to_string())
            .or_default()
            .push(value_ms);
    }

    fn set_gauge(&self, name: &str, value: i64) {
        self.inner.lock().gauges.insert(name.to_string(), value);
    }
}

/// Write-only fanout: feeds the per-session store and the process exporter
/// without the session code knowing about either.
#[derive(Clone)]
pub struct CompositeMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeMetrics {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    pub fn inc(&self, name: &str, value: u64) {
        for s in &self.sinks {
            s.inc(name, value);
        }
    }

    pub fn observe(&self, name: &str, value_ms: u64) {
        for s in &self.sinks {
            s.observe(name, value_ms);
        }
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        for s in &self.sinks {
            s.set_gauge(name, value);
        }
    }

    /// Counter keyed by close reason, e.g. `ws.close_reason_total.BAD_JSON`.
    pub fn inc_close_reason(&self, reason: &str) {
        let safe: String = reason
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.inc(&format!("{}.{safe}", names::WS_CLOSE_REASON_TOTAL), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.inc("a.b_total", 1);
        m.inc("a.b_total", 2);
        assert_eq!(m.get("a.b_total"), 3);
        assert_eq!(m.get("missing"), 0);
    }

    #[test]
    fn percentile_is_order_insensitive() {
        let m = Metrics::new();
        for v in [40_u64, 10, 30, 20] {
            m.observe("lat_ms", v);
        }
        assert_eq!(m.percentile("lat_ms", 0.0), Some(10));
        assert_eq!(m.percentile("lat_ms", 100.0), Some(40));
        assert_eq!(m.percentile("lat_ms", 50.0), Some(30));
    }

    #[test]
    fn composite_fans_out_and_sanitizes_close_reason() {
        let a = Arc::new(Metrics::new());
        let b = Arc::new(Metrics::new());
        let c = CompositeMetrics::new(vec![a.clone(), b.clone()]);
        c.inc_close_reason("BAD JSON?");
        assert_eq!(a.get("ws.close_reason_total.BAD_JSON_"), 1);
        assert_eq!(b.get("ws.close_reason_total.BAD_JSON_"), 1);
    }
}
