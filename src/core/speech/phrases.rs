//! Deterministic phrase variation.
//!
//! Phrase choice must be a pure function of `(call_id, turn_id, segment_kind,
//! segment_index)` so replays of the same call reproduce the same audio.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

pub const ACK_STANDARD: &[&str] = &["Okay."];
pub const ACK_APOLOGY: &[&str] = &["Sorry about that."];

pub const FILLER_FIRST: &[&str] = &[
    "Okay, one sec.",
    "Give me a second.",
    "Checking that now.",
    "One moment.",
    "Hang on one sec.",
    "Let me check that.",
];
pub const FILLER_SECOND: &[&str] = &[
    "Still pulling that up.",
    "Almost there.",
    "Just a bit longer.",
    "Still on it.",
];

/// Deterministic phrase selection for realism without randomness.
pub fn select_phrase(
    options: &[&str],
    call_id: &str,
    turn_id: u64,
    segment_kind: &str,
    segment_index: usize,
) -> String {
    assert!(!options.is_empty(), "options must be non-empty");
    let seed = format!("{call_id}|{turn_id}|{segment_kind}|{segment_index}");
    let digest = Sha256::digest(seed.as_bytes());
    let idx = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes")) as usize % options.len();
    options[idx].to_string()
}

/// Like [`select_phrase`], but rotates away from phrases already used this
/// turn so back-to-back segments do not repeat themselves.
pub fn pick_phrase(
    options: &[&str],
    call_id: &str,
    turn_id: u64,
    segment_kind: &str,
    segment_index: usize,
    used: &mut HashSet<String>,
) -> String {
    let chosen = select_phrase(options, call_id, turn_id, segment_kind, segment_index);
    if used.insert(chosen.clone()) {
        return chosen;
    }
    if options.len() <= 1 {
        return chosen;
    }
    let start = options
        .iter()
        .position(|&o| o == chosen)
        .unwrap_or_default();
    for off in 1..options.len() {
        let cand = options[(start + off) % options.len()];
        if used.insert(cand.to_string()) {
            return cand.to_string();
        }
    }
    chosen
}

pub fn ack_text(
    call_id: &str,
    turn_id: u64,
    needs_apology: bool,
    used: &mut HashSet<String>,
) -> String {
    let options = if needs_apology {
        ACK_APOLOGY
    } else {
        ACK_STANDARD
    };
    pick_phrase(options, call_id, turn_id, "ACK", 0, used)
}

pub fn filler_text(
    call_id: &str,
    turn_id: u64,
    filler_index: usize,
    used: &mut HashSet<String>,
) -> String {
    let options = if filler_index == 0 {
        FILLER_FIRST
    } else {
        FILLER_SECOND
    };
    pick_phrase(options, call_id, turn_id, "FILLER", filler_index, used)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_stable_per_inputs() {
        let a = select_phrase(FILLER_FIRST, "call_1", 3, "FILLER", 0);
        let b = select_phrase(FILLER_FIRST, "call_1", 3, "FILLER", 0);
        assert_eq!(a, b);
        assert!(FILLER_FIRST.contains(&a.as_str()));
    }

    #[test]
    fn different_turns_can_differ() {
        let picks: HashSet<String> = (0..16)
            .map(|turn| select_phrase(FILLER_FIRST, "call_1", turn, "FILLER", 0))
            .collect();
        assert!(picks.len() > 1, "expected variation across turns");
    }

    #[test]
    fn pick_phrase_avoids_repeats_within_a_turn() {
        let mut used = HashSet::new();
        let first = pick_phrase(FILLER_FIRST, "call_1", 5, "FILLER", 0, &mut used);
        let second = pick_phrase(FILLER_FIRST, "call_1", 5, "FILLER", 0, &mut used);
        assert_ne!(first, second);
    }

    #[test]
    fn ack_swaps_to_apology_after_interruption() {
        let mut used = HashSet::new();
        assert_eq!(ack_text("c", 1, false, &mut used), "Okay.");
        let mut used = HashSet::new();
        assert_eq!(ack_text("c", 1, true, &mut used), "Sorry about that.");
    }
}
