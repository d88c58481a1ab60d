//! Error types for the BiDiB protocol core.
//!
//! Node/command-station logic and wire-codec errors are kept in separate
//! variants so callers can tell a malformed frame (log and drop) apart from
//! a state-machine misuse (a caller bug worth surfacing loudly).

use thiserror::Error;

use crate::node::NodeState;

/// Errors raised by node and command-station state machines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An operation was attempted from a state that does not allow it.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// State the node was in.
        state: NodeState,
        /// Operation that was attempted.
        operation: String,
    },

    /// A message's address did not resolve to any known node.
    #[error("no node at address {0}")]
    UnknownNode(bidib_proto::Address),

    /// The node table reported more entries than [`crate::node::MAX_NODES`]
    /// allows.
    #[error("node table overflow: {0} entries exceeds the cap")]
    NodeTableOverflow(usize),

    /// A downstream command was issued while the command station was not in
    /// a state that accepts it.
    #[error("command station refused {operation}: state is {state:?}")]
    CommandStationBusy {
        /// Current command-station state.
        state: bidib_proto::CsState,
        /// Operation that was attempted.
        operation: String,
    },

    /// Wire codec error, bridged in at the transport boundary.
    #[error("protocol error: {0}")]
    Protocol(#[from] bidib_proto::ProtoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_bridge_in() {
        let err: CoreError = bidib_proto::ProtoError::FrameCrc.into();
        assert!(matches!(err, CoreError::Protocol(bidib_proto::ProtoError::FrameCrc)));
    }
}
