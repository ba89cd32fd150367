//! Bounded transcript memory with deterministic compaction.
//!
//! The platform resends the whole transcript snapshot on every event, so this
//! ring ingests snapshots rather than appending. When the snapshot exceeds the
//! utterance or character bounds, the oldest prefix is compacted into a stable
//! summary record. PII is minimized aggressively: phone numbers survive only
//! as their last four digits.

use once_cell::sync::Lazy;
use regex::Regex;

use super::protocol::TranscriptUtterance;
use super::slots::SlotState;

static PHONE_PAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d[\d\s\-\(\)]{8,}\d").unwrap());
static NON_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D+").unwrap());

static TOPIC_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("availability", Regex::new(r"(?i)\b(available|availability|opening|slot)\b").unwrap()),
        ("booking", Regex::new(r"(?i)\b(book|schedule|appointment|appt)\b").unwrap()),
        ("eligibility", Regex::new(r"(?i)\b(eligible|eligibility|qualify)\b").unwrap()),
        ("policy", Regex::new(r"(?i)\b(policy|policies|hours|location|insurance)\b").unwrap()),
        ("pricing", Regex::new(r"(?i)\b(price|pricing|cost|how much)\b").unwrap()),
    ]
});

static PREFERENCE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("afternoon", Regex::new(r"(?i)\b(afternoon|after 12|after noon)\b").unwrap()),
        ("evening", Regex::new(r"(?i)\b(evening|after work)\b").unwrap()),
        ("morning", Regex::new(r"(?i)\b(morning|before 12|before noon)\b").unwrap()),
    ]
});

/// Result of ingesting one transcript snapshot.
#[derive(Debug, Clone)]
pub struct MemoryView {
    pub recent_transcript: Vec<TranscriptUtterance>,
    pub summary_blob: String,
    pub utterances_current: usize,
    pub chars_current: usize,
    pub compacted: bool,
}

pub struct ConversationMemory {
    max_utterances: usize,
    max_chars: usize,
    recent_transcript: Vec<TranscriptUtterance>,
    summary_blob: String,
}

impl ConversationMemory {
    pub fn new(max_utterances: usize, max_chars: usize) -> Self {
        Self {
            max_utterances: max_utterances.max(1),
            max_chars: max_chars.max(1),
            recent_transcript: Vec::new(),
            summary_blob: String::new(),
        }
    }

    pub fn recent(&self) -> &[TranscriptUtterance] {
        &self.recent_transcript
    }

    pub fn summary(&self) -> &str {
        &self.summary_blob
    }

    pub fn ingest_snapshot(
        &mut self,
        transcript: &[TranscriptUtterance],
        slot_state: Option<&SlotState>,
    ) -> MemoryView {
        let mut older: Vec<TranscriptUtterance> = Vec::new();
        let mut recent: Vec<TranscriptUtterance> = transcript.to_vec();
        let mut compacted = false;

        if recent.len() > self.max_utterances {
            let cut = recent.len() - self.max_utterances;
            older.extend(recent.drain(..cut));
            compacted = true;
        }

        while chars_of(&recent) > self.max_chars && !recent.is_empty() {
            older.push(recent.remove(0));
            compacted = true;
        }

        let summary = if compacted {
            build_summary(&older, slot_state)
        } else {
            String::new()
        };
        let chars_current = chars_of(&recent);

        self.recent_transcript = recent.clone();
        self.summary_blob = summary.clone();

        MemoryView {
            recent_transcript: recent,
            summary_blob: summary,
            utterances_current: self.recent_transcript.len(),
            chars_current,
            compacted,
        }
    }
}

fn chars_of(transcript: &[TranscriptUtterance]) -> usize {
    transcript.iter().map(|u| u.content.chars().count()).sum()
}

fn phone_last4(older: &[TranscriptUtterance], slot_state: Option<&SlotState>) -> String {
    if let Some(phone) = slot_state.and_then(|s| s.phone.as_deref()) {
        let digits = NON_DIGIT.replace_all(phone, "");
        if digits.len() >= 4 {
            return digits[digits.len() - 4..].to_string();
        }
    }
    for utt in older.iter().rev() {
        if let Some(m) = PHONE_PAT.find(&utt.content) {
            let digits = NON_DIGIT.replace_all(m.as_str(), "");
            if digits.len() >= 4 {
                return digits[digits.len() - 4..].to_string();
            }
        }
    }
    String::new()
}

fn build_summary(older: &[TranscriptUtterance], slot_state: Option<&SlotState>) -> String {
    let joined = older
        .iter()
        .map(|u| u.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let topics: Vec<&str> = TOPIC_PATTERNS
        .iter()
        .filter(|(_, pat)| pat.is_match(&joined))
        .map(|(name, _)| *name)
        .collect();
    let prefs: Vec<&str> = PREFERENCE_PATTERNS
        .iter()
        .filter(|(_, pat)| pat.is_match(&joined))
        .map(|(name, _)| *name)
        .collect();

    let mut parts: Vec<String> = Vec::new();
    if let Some(intent) = slot_state.and_then(|s| s.intent.as_deref()) {
        parts.push(format!("intent={intent}"));
    }
    if !topics.is_empty() {
        parts.push(format!("topics={}", topics.join(",")));
    }
    let last4 = phone_last4(older, slot_state);
    if !last4.is_empty() {
        parts.push(format!("phone_last4={last4}"));
    }
    if !prefs.is_empty() {
        parts.push(format!("preference={}", prefs.join(",")));
    }

    if parts.is_empty() {
        "Earlier context compacted.".to_string()
    } else {
        format!("Earlier context: {}.", parts.join("; "))
    }
}
