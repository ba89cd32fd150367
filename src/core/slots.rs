//! Tentative dialogue slot state.
//!
//! Slots are mutated while a turn is in flight and are only durable once the
//! turn has spoken. The orchestrator snapshots this state per epoch and rolls
//! back on preemption when no segment was emitted, so confirmation flows keep
//! their progress while silent miscarriages leave no trace.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotState {
    pub intent: Option<String>,
    pub phone: Option<String>,
    pub phone_confirmed: bool,
    pub reprompts: HashMap<String, u32>,
    /// Opaque call metadata from the one-shot `call_details` frame.
    pub call_metadata: HashMap<String, String>,
}

impl SlotState {
    pub fn snapshot(&self) -> SlotState {
        self.clone()
    }

    pub fn restore(&mut self, snap: SlotState) {
        *self = snap;
    }

    pub fn bump_reprompt(&mut self, key: &str) -> u32 {
        let count = self.reprompts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_restore_round_trip() {
        let mut state = SlotState::default();
        state.intent = Some("booking".into());
        state.phone = Some("469-599-8571".into());
        let snap = state.snapshot();

        state.phone_confirmed = true;
        state.bump_reprompt("phone");
        assert_ne!(state, snap);

        state.restore(snap.clone());
        assert_eq!(state, snap);
        assert!(!state.phone_confirmed);
        assert!(state.reprompts.is_empty());
    }
}
