//! Command-station extension, attached to a [`crate::node::Node`] whose
//! unique id reports a DCC drive generator.
//!
//! Kept deliberately dumb: it tracks `actual`/`desired` state and builds
//! wire messages, but never sends anything itself — [`crate::node::Node`]
//! owns the address and sequence counter a send needs, matching the split
//! already used between [`crate::node::Node`] and its timers.

use bidib_proto::{Address, CsState, Message, SequenceNumber};

use crate::node::NodeAction;

/// Command-station state tracked on behalf of its owning node.
#[derive(Debug, Clone, Default)]
pub struct CommandStation {
    actual_state: Option<CsState>,
    desired_state: Option<CsState>,
}

impl CommandStation {
    /// Creates a command station with no state observed yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last state reported by the node via `CS_STATE`.
    #[must_use]
    pub fn actual_state(&self) -> Option<CsState> {
        self.actual_state
    }

    /// Last state requested by the host.
    #[must_use]
    pub fn desired_state(&self) -> Option<CsState> {
        self.desired_state
    }

    /// Records the desired state and builds the `CS_SET_STATE` command.
    pub fn request_state(
        &mut self,
        state: CsState,
        addr: &Address,
        seq: &mut SequenceNumber,
    ) -> Vec<NodeAction> {
        self.desired_state = Some(state);
        let message = Message::CsSetState { state: state as u8 };
        let send = NodeAction::Send { addr: *addr, seq: *seq, message };
        *seq = seq.next();
        vec![send]
    }

    /// Updates `actual_state` from an inbound `CS_STATE`. Returns `true` if
    /// the state actually changed (callers use this to decide whether to
    /// fan out a node-changed event).
    pub fn on_state(&mut self, raw_state: u8) -> bool {
        let new_state = CsState::from_u8(raw_state);
        if new_state == self.actual_state {
            false
        } else {
            self.actual_state = new_state;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_state_advances_sequence_and_sets_desired() {
        let mut cs = CommandStation::new();
        let mut seq = SequenceNumber::from(5);
        let actions = cs.request_state(CsState::Go, &Address::INTERFACE, &mut seq);
        assert_eq!(cs.desired_state(), Some(CsState::Go));
        assert_eq!(seq.value(), 6);
        assert!(matches!(
            actions.as_slice(),
            [NodeAction::Send { message: Message::CsSetState { state: 0x03 }, seq, .. }]
                if seq.value() == 5
        ));
    }

    #[test]
    fn on_state_reports_change_only_once() {
        let mut cs = CommandStation::new();
        assert!(cs.on_state(0x03));
        assert!(!cs.on_state(0x03));
        assert!(cs.on_state(0x00));
    }

    #[test]
    fn on_state_tolerates_unknown_raw_values() {
        let mut cs = CommandStation::new();
        assert!(cs.on_state(0x7F));
        assert_eq!(cs.actual_state(), None);
    }
}
