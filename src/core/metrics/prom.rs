//! Minimal Prometheus text exporter for counters, gauges, and bucketed
//! millisecond histograms.
//!
//! Raw samples are never stored; histograms keep per-bucket counts only so the
//! process-global registry stays bounded regardless of call volume.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::MetricsSink;

const DEFAULT_MS_BUCKETS: [u64; 15] = [
    25, 50, 100, 150, 200, 250, 300, 400, 500, 800, 1000, 1500, 2000, 5000, 10000,
];

/// Process-global exporter. Initialized on first use, never torn down.
pub static GLOBAL_PROM: Lazy<Arc<PromExporter>> = Lazy::new(|| Arc::new(PromExporter::new()));

fn prom_name(name: &str) -> String {
    name.replace('.', "_")
}

struct BucketHistogram {
    buckets: &'static [u64],
    // Non-cumulative per-bucket counts, plus a trailing +Inf slot.
    counts: Vec<u64>,
    sum: u64,
    count: u64,
}

impl BucketHistogram {
    fn new(buckets: &'static [u64]) -> Self {
        Self {
            buckets,
            counts: vec![0; buckets.len() + 1],
            sum: 0,
            count: 0,
        }
    }

    fn observe(&mut self, v: u64) {
        self.sum += v;
        self.count += 1;
        let idx = self
            .buckets
            .iter()
            .position(|&b| v <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
    }
}

#[derive(Default)]
struct PromInner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, i64>,
    hists: BTreeMap<String, BucketHistogram>,
}

pub struct PromExporter {
    inner: Mutex<PromInner>,
}

impl PromExporter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PromInner::default()),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();

        for (name, value) in &inner.counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        for (name, value) in &inner.gauges {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        for (name, hist) in &inner.hists {
            out.push_str(&format!("# TYPE {name} histogram\n"));
            let mut running = 0u64;
            for (i, b) in hist.buckets.iter().enumerate() {
                running += hist.counts[i];
                out.push_str(&format!("{name}_bucket{{le=\"{b}\"}} {running}\n"));
            }
            running += hist.counts[hist.buckets.len()];
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {running}\n"));
            out.push_str(&format!("{name}_sum {}\n", hist.sum));
            out.push_str(&format!("{name}_count {}\n", hist.count));
        }
        out
    }
}

impl Default for PromExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PromExporter {
    fn inc(&self, name: &str, value: u64) {
        let key = prom_name(name);
        *self.inner.lock().counters.entry(key).or_insert(0) += value;
    }

    fn observe(&self, name: &str, value_ms: u64) {
        let key = prom_name(name);
        self.inner
            .lock()
            .hists
            .entry(key)
            .or_insert_with(|| BucketHistogram::new(&DEFAULT_MS_BUCKETS))
            .observe(value_ms);
    }

    fn set_gauge(&self, name: &str, value: i64) {
        let key = prom_name(name);
        self.inner.lock().gauges.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_rewrites_dots_and_accumulates() {
        let p = PromExporter::new();
        p.inc("inbound.bad_schema_total", 2);
        p.set_gauge("memory.transcript_chars_current", 41);
        let text = p.render();
        assert!(text.contains("inbound_bad_schema_total 2"));
        assert!(text.contains("memory_transcript_chars_current 41"));
        assert!(!text.contains('.'), "dotted names must not leak: {text}");
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let p = PromExporter::new();
        p.observe("keepalive.ping_pong_queue_delay_ms", 30);
        p.observe("keepalive.ping_pong_queue_delay_ms", 120);
        p.observe("keepalive.ping_pong_queue_delay_ms", 99_999);
        let text = p.render();
        assert!(text.contains("keepalive_ping_pong_queue_delay_ms_bucket{le=\"50\"} 1"));
        assert!(text.contains("keepalive_ping_pong_queue_delay_ms_bucket{le=\"150\"} 2"));
        assert!(text.contains("keepalive_ping_pong_queue_delay_ms_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("keepalive_ping_pong_queue_delay_ms_count 3"));
    }
}
