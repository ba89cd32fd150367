//! Deterministic speech planning.
//!
//! Reply text is split into breath-group segments bounded by an expected
//! speaking duration, protected spans (phone numbers, prices, times, digits)
//! are rendered in a read-slowly format, and pause markup is inserted per the
//! configured mode. Everything here is a pure function of its inputs so a
//! replayed turn produces byte-identical chunks.

pub mod phrases;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::{BrainConfig, DashPauseScope, SpeechMarkupMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPurpose {
    Ack,
    Filler,
    Content,
    Confirm,
    Repair,
    Error,
}

impl SegmentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentPurpose::Ack => "ACK",
            SegmentPurpose::Filler => "FILLER",
            SegmentPurpose::Content => "CONTENT",
            SegmentPurpose::Confirm => "CONFIRM",
            SegmentPurpose::Repair => "REPAIR",
            SegmentPurpose::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectedSpanKind {
    Phone,
    Price,
    Time,
    Digits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedSpan {
    pub kind: ProtectedSpanKind,
    pub start: usize,
    pub end: usize,
}

/// One outbound speech chunk, pre-markup and post-markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechSegment {
    pub segment_index: usize,
    pub purpose: SegmentPurpose,
    /// Rendered text as sent on the wire (pause markup applied).
    pub rendered: String,
    pub plain_text: String,
    pub interruptible: bool,
    pub expected_duration_ms: u64,
    pub contains_protected_span: bool,
}

/// A full per-turn utterance plan with a content-addressed id.
#[derive(Debug, Clone)]
pub struct SpeechPlan {
    pub plan_id: String,
    pub purpose: SegmentPurpose,
    pub segments: Vec<SpeechSegment>,
}

impl SpeechPlan {
    pub fn new(purpose: SegmentPurpose, segments: Vec<SpeechSegment>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(purpose.as_str().as_bytes());
        for seg in &segments {
            hasher.update([0u8]);
            hasher.update(seg.rendered.as_bytes());
        }
        Self {
            plan_id: format!("{:x}", hasher.finalize()),
            purpose,
            segments,
        }
    }
}

/// Chunking knobs, lifted from config once per session.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub max_expected_ms: u64,
    pub pace_ms_per_char: u64,
    pub markup_mode: SpeechMarkupMode,
    pub dash_pause_scope: DashPauseScope,
    pub dash_pause_unit_ms: u64,
    pub digit_dash_pause_unit_ms: u64,
}

impl ChunkOptions {
    pub fn from_config(config: &BrainConfig) -> Self {
        Self {
            max_expected_ms: config.max_segment_expected_ms,
            pace_ms_per_char: config.pace_ms_per_char,
            markup_mode: config.speech_markup_mode,
            dash_pause_scope: config.dash_pause_scope,
            dash_pause_unit_ms: config.dash_pause_unit_ms,
            digit_dash_pause_unit_ms: config.digit_dash_pause_unit_ms,
        }
    }
}

static PHONE_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3})[\s\-\)]*(\d{3})[\s\-]*(\d{4})\b").unwrap());
static PRICE_PAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\s*\d+(?:\.\d+)?").unwrap());
static TIME_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").unwrap());
static DIGITS_PAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static WHITESPACE_PAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static CLAUSE_PAT: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s+|\s+(?:and|but|so)\s+").unwrap());

/// Deterministic pseudo-random break length in [150, 400] ms.
fn det_break_ms(segment_index: usize) -> u64 {
    150 + ((segment_index as u64 * 77) % 251)
}

/// Platform pause primitive: each unit is exactly " - " (spaces required).
pub fn dash_pause(units: u64) -> String {
    " - ".repeat(units as usize)
}

fn dash_pause_units_for_break(break_ms: u64, unit_ms: u64) -> u64 {
    if unit_ms == 0 {
        return 0;
    }
    // Round to the nearest unit, but never emit zero units at a boundary.
    ((break_ms + unit_ms / 2) / unit_ms).max(1)
}

pub fn find_protected_spans(text: &str) -> Vec<ProtectedSpan> {
    let mut spans: Vec<ProtectedSpan> = Vec::new();
    for m in PHONE_PAT.find_iter(text) {
        spans.push(ProtectedSpan {
            kind: ProtectedSpanKind::Phone,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in PRICE_PAT.find_iter(text) {
        spans.push(ProtectedSpan {
            kind: ProtectedSpanKind::Price,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in TIME_PAT.find_iter(text) {
        spans.push(ProtectedSpan {
            kind: ProtectedSpanKind::Time,
            start: m.start(),
            end: m.end(),
        });
    }

    // Generic digit runs, skipping ones already covered by a typed span.
    let mut covered = vec![false; text.len()];
    for s in &spans {
        for flag in covered[s.start..s.end].iter_mut() {
            *flag = true;
        }
    }
    for m in DIGITS_PAT.find_iter(text) {
        if covered[m.start()..m.end()].iter().any(|&c| c) {
            continue;
        }
        spans.push(ProtectedSpan {
            kind: ProtectedSpanKind::Digits,
            start: m.start(),
            end: m.end(),
        });
    }

    spans.sort_by_key(|s| (s.start, s.end));
    spans
}

fn spells_out_digits(kind: ProtectedSpanKind, purpose: SegmentPurpose) -> bool {
    kind == ProtectedSpanKind::Phone
        || (kind == ProtectedSpanKind::Digits
            && matches!(purpose, SegmentPurpose::Confirm | SegmentPurpose::Repair))
}

/// Render protected spans into the read-slowly format.
///
/// Phone spans are always rendered as `d - d - d`; bare digit runs only for
/// CONFIRM/REPAIR purposes so ordinary numbers stay natural.
fn apply_protected_span_formatting(
    text: &str,
    spans: &[ProtectedSpan],
    purpose: SegmentPurpose,
) -> String {
    if spans.is_empty() {
        return text.to_string();
    }
    let mut out = String::new();
    let mut cur = 0usize;
    for sp in spans {
        out.push_str(&text[cur..sp.start]);
        let chunk = &text[sp.start..sp.end];
        if spells_out_digits(sp.kind, purpose) {
            let digits: Vec<String> = chunk
                .chars()
                .filter(|c| c.is_ascii_digit())
                .map(|c| c.to_string())
                .collect();
            if digits.is_empty() {
                out.push_str(chunk);
            } else {
                out.push_str(&digits.join(" - "));
            }
        } else {
            out.push_str(chunk);
        }
        cur = sp.end;
    }
    out.push_str(&text[cur..]);
    out
}

/// Extra expected milliseconds contributed by spelled-out digit spans.
fn digit_pause_ms(text: &str, spans: &[ProtectedSpan], purpose: SegmentPurpose, unit_ms: u64) -> u64 {
    let mut extra = 0u64;
    for sp in spans {
        if spells_out_digits(sp.kind, purpose) {
            let digits = text[sp.start..sp.end]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .count() as u64;
            if digits > 1 {
                extra += (digits - 1) * unit_ms;
            }
        }
    }
    extra
}

/// Returns (suffix_text, pause_ms) for a segment boundary.
fn boundary_pause(opts: &ChunkOptions, break_ms: u64) -> (String, u64) {
    match opts.markup_mode {
        SpeechMarkupMode::RawText => (String::new(), 0),
        SpeechMarkupMode::Ssml => (format!("<break time=\"{break_ms}ms\"/>"), break_ms),
        SpeechMarkupMode::DashPause => {
            let units = dash_pause_units_for_break(break_ms, opts.dash_pause_unit_ms);
            (dash_pause(units), units * opts.dash_pause_unit_ms)
        }
    }
}

fn boundary_pause_applies(opts: &ChunkOptions) -> bool {
    match opts.markup_mode {
        SpeechMarkupMode::RawText => false,
        SpeechMarkupMode::Ssml => true,
        SpeechMarkupMode::DashPause => opts.dash_pause_scope == DashPauseScope::SegmentBoundary,
    }
}

fn estimate_expected_ms(
    plain: &str,
    purpose: SegmentPurpose,
    opts: &ChunkOptions,
    break_ms: u64,
    include_boundary: bool,
) -> u64 {
    let spans = find_protected_spans(plain);
    let base = plain.chars().count() as u64 * opts.pace_ms_per_char;
    let digit_extra = digit_pause_ms(plain, &spans, purpose, opts.digit_dash_pause_unit_ms);
    let boundary_ms = if include_boundary && boundary_pause_applies(opts) {
        boundary_pause(opts, break_ms).1
    } else {
        0
    };
    base + digit_extra + boundary_ms
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        cur.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?' | ';')
            && chars.get(i + 1).is_none_or(|n| n.is_whitespace());
        if at_boundary {
            let trimmed = cur.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
            cur.clear();
        }
    }
    let trimmed = cur.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
    parts
}

fn split_clauses(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for sentence in split_sentences(text) {
        for clause in CLAUSE_PAT.split(&sentence) {
            let clause = clause.trim();
            if !clause.is_empty() {
                out.push(clause.to_string());
            }
        }
    }
    out
}

/// Split text into breath-group segments under `max_expected_ms`.
pub fn micro_chunk_text(
    text: &str,
    purpose: SegmentPurpose,
    interruptible: bool,
    opts: &ChunkOptions,
) -> Vec<SpeechSegment> {
    let cleaned = WHITESPACE_PAT.replace_all(text.trim(), " ").to_string();
    if cleaned.is_empty() {
        return Vec::new();
    }

    let mut drafts: Vec<String> = Vec::new();
    let mut buf: Vec<String> = Vec::new();

    let estimate = |plain: &str, next_index: usize| {
        estimate_expected_ms(plain, purpose, opts, det_break_ms(next_index), true)
    };

    let flush = |buf: &mut Vec<String>, drafts: &mut Vec<String>| {
        if buf.is_empty() {
            return;
        }
        let plain = buf.join(" ").trim().to_string();
        if !plain.is_empty() {
            drafts.push(plain);
        }
        buf.clear();
    };

    for part in split_clauses(&cleaned) {
        if buf.is_empty() {
            // A single clause over budget is split by words deterministically.
            if estimate(&part, drafts.len()) > opts.max_expected_ms {
                let mut wbuf: Vec<String> = Vec::new();
                for w in part.split(' ').filter(|w| !w.is_empty()) {
                    let cand = if wbuf.is_empty() {
                        w.to_string()
                    } else {
                        format!("{} {w}", wbuf.join(" "))
                    };
                    if !wbuf.is_empty() && estimate(&cand, drafts.len()) > opts.max_expected_ms {
                        buf = std::mem::take(&mut wbuf);
                        flush(&mut buf, &mut drafts);
                        wbuf.push(w.to_string());
                    } else {
                        wbuf.push(w.to_string());
                    }
                }
                if !wbuf.is_empty() {
                    buf = wbuf;
                    flush(&mut buf, &mut drafts);
                }
                continue;
            }
            buf.push(part);
            continue;
        }

        let cand = format!("{} {part}", buf.join(" "));
        if estimate(&cand, drafts.len()) > opts.max_expected_ms {
            flush(&mut buf, &mut drafts);
        }
        buf.push(part);
    }
    flush(&mut buf, &mut drafts);

    let last_index = drafts.len().saturating_sub(1);
    let mut segments = Vec::with_capacity(drafts.len());
    for (i, plain) in drafts.iter().enumerate() {
        let spans = find_protected_spans(plain);
        let body = apply_protected_span_formatting(plain, &spans, purpose);
        let break_ms = det_break_ms(i);
        let include_pause = i < last_index && boundary_pause_applies(opts);
        let (suffix, boundary_ms) = if include_pause {
            boundary_pause(opts, break_ms)
        } else {
            (String::new(), 0)
        };

        // The platform concatenates streaming chunks exactly as sent, so
        // non-final segments must keep the word boundary to the next chunk
        // ("thisor" is what happens otherwise). SSML mode is left untouched.
        let mut rendered = format!("{body}{suffix}");
        if opts.markup_mode != SpeechMarkupMode::Ssml && i < last_index {
            if let Some(next0) = drafts[i + 1].trim_start().chars().next() {
                let needs_space = rendered
                    .chars()
                    .next_back()
                    .is_some_and(|last| !last.is_whitespace())
                    && (next0.is_alphanumeric() || matches!(next0, '$' | '(' | '[' | '"' | '\''));
                if needs_space {
                    rendered.push(' ');
                }
            }
        }

        let digit_extra = digit_pause_ms(plain, &spans, purpose, opts.digit_dash_pause_unit_ms);
        let expected =
            plain.chars().count() as u64 * opts.pace_ms_per_char + digit_extra + boundary_ms;

        segments.push(SpeechSegment {
            segment_index: i,
            purpose,
            rendered,
            plain_text: plain.clone(),
            interruptible,
            expected_duration_ms: expected,
            contains_protected_span: !spans.is_empty(),
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ChunkOptions {
        ChunkOptions {
            max_expected_ms: 650,
            pace_ms_per_char: 12,
            markup_mode: SpeechMarkupMode::DashPause,
            dash_pause_scope: DashPauseScope::ProtectedOnly,
            dash_pause_unit_ms: 200,
            digit_dash_pause_unit_ms: 150,
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Thanks for calling. We are open Monday through Friday, and we also take walk-ins on weekends.";
        let a = micro_chunk_text(text, SegmentPurpose::Content, true, &opts());
        let b = micro_chunk_text(text, SegmentPurpose::Content, true, &opts());
        assert!(!a.is_empty());
        assert_eq!(a, b);
        for (i, seg) in a.iter().enumerate() {
            assert_eq!(seg.segment_index, i);
            assert!(seg.expected_duration_ms <= 650, "segment over budget: {seg:?}");
        }
    }

    #[test]
    fn phone_numbers_are_spelled_with_dashes() {
        let segs = micro_chunk_text(
            "Your callback number is 469 599 8571.",
            SegmentPurpose::Content,
            true,
            &opts(),
        );
        let joined: String = segs.iter().map(|s| s.rendered.as_str()).collect();
        assert!(joined.contains("4 - 6 - 9 - 5 - 9 - 9 - 8 - 5 - 7 - 1"), "{joined}");
        assert!(segs.iter().any(|s| s.contains_protected_span));
    }

    #[test]
    fn bare_digits_spell_out_only_for_confirm() {
        let content = micro_chunk_text("I have 42 here.", SegmentPurpose::Content, true, &opts());
        assert!(content[0].rendered.contains("42"));

        let confirm = micro_chunk_text("I have 42 here.", SegmentPurpose::Confirm, true, &opts());
        assert!(confirm[0].rendered.contains("4 - 2"), "{:?}", confirm[0]);
        // Spelled digits stretch the expected duration.
        assert!(confirm[0].expected_duration_ms > content[0].expected_duration_ms);
    }

    #[test]
    fn segment_boundary_scope_inserts_dash_pauses() {
        let mut o = opts();
        o.dash_pause_scope = DashPauseScope::SegmentBoundary;
        let segs = micro_chunk_text(
            "First point here. Second point follows after that one.",
            SegmentPurpose::Content,
            true,
            &o,
        );
        assert!(segs.len() >= 2);
        assert!(segs[0].rendered.contains(" - "), "{:?}", segs[0]);
        assert!(!segs.last().unwrap().rendered.ends_with(" - "));
    }

    #[test]
    fn ssml_mode_emits_break_tags() {
        let mut o = opts();
        o.markup_mode = SpeechMarkupMode::Ssml;
        let segs = micro_chunk_text(
            "First point here. Second point follows after that one.",
            SegmentPurpose::Content,
            true,
            &o,
        );
        assert!(segs[0].rendered.contains("<break time=\""), "{:?}", segs[0]);
    }

    #[test]
    fn raw_text_mode_has_no_markup() {
        let mut o = opts();
        o.markup_mode = SpeechMarkupMode::RawText;
        let segs = micro_chunk_text(
            "Call 469 599 8571 now. Second sentence.",
            SegmentPurpose::Content,
            true,
            &o,
        );
        // Protected-span rendering still applies; boundary pauses do not.
        let joined: String = segs.iter().map(|s| s.rendered.as_str()).collect();
        assert!(joined.contains("4 - 6 - 9"));
        assert!(!segs[0].rendered.contains("<break"));
    }

    #[test]
    fn word_boundary_preserved_between_chunks() {
        let segs = micro_chunk_text(
            "This is a fairly long first clause that keeps going, and this continues it.",
            SegmentPurpose::Content,
            true,
            &opts(),
        );
        if segs.len() >= 2 {
            let first = &segs[0].rendered;
            assert!(first.ends_with(' '), "chunk must keep the word boundary: {first:?}");
        }
    }

    #[test]
    fn empty_input_yields_no_segments() {
        assert!(micro_chunk_text("   ", SegmentPurpose::Content, true, &opts()).is_empty());
    }

    #[test]
    fn plan_id_is_content_addressed() {
        let segs = micro_chunk_text("Okay.", SegmentPurpose::Ack, true, &opts());
        let a = SpeechPlan::new(SegmentPurpose::Ack, segs.clone());
        let b = SpeechPlan::new(SegmentPurpose::Ack, segs);
        assert_eq!(a.plan_id, b.plan_id);
    }
}
