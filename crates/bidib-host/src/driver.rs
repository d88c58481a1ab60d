//! Pure dispatcher logic: message routing, interface gating, and the
//! startup sequence. No tokio dependency here — [`crate::host::Host`] is the
//! only thing that owns a runtime, a transport, or a queue.

use std::time::Duration;

use bidib_core::{
    node::{NodeAction, NodeTimer},
    CoreError, Node,
};
use bidib_proto::{Address, Message, ParsedMessage};
use tracing::warn;

/// An effect the dispatcher asks its caller (the executor in
/// [`crate::host`]) to perform. Generalizes [`NodeAction`] with the address
/// of the node a `PostDelayed` timer belongs to, since `NodeAction` itself
/// doesn't carry it.
#[derive(Debug, Clone, PartialEq)]
pub enum HostAction {
    /// Send a message downstream.
    Send {
        /// Target node address.
        addr: Address,
        /// Sequence number this send consumes.
        seq: bidib_proto::SequenceNumber,
        /// Message to send.
        message: Message,
    },
    /// Fire `timer` against the node at `addr` again after `delay`.
    PostDelayed {
        /// Node the timer belongs to.
        addr: Address,
        /// How long to wait.
        delay: Duration,
        /// What to do when the delay elapses.
        timer: NodeTimer,
    },
    /// The node tree changed; fan out a node-changed event.
    NodeChanged,
}

fn convert(addr: Address, action: NodeAction) -> HostAction {
    match action {
        NodeAction::Send { addr, seq, message } => HostAction::Send { addr, seq, message },
        NodeAction::PostDelayed { delay, timer } => HostAction::PostDelayed { addr, delay, timer },
        NodeAction::NodeChanged => HostAction::NodeChanged,
    }
}

fn convert_all(addr: Address, actions: Vec<NodeAction>) -> Vec<HostAction> {
    actions.into_iter().map(|action| convert(addr, action)).collect()
}

/// Whether the interface's `SYS_DISABLE`/`SYS_ENABLE` have been sent, so the
/// gating hooks below never repeat a send the interface already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterfaceGate {
    Unknown,
    Disabled,
    Enabled,
}

/// Owns the node tree root and the interface gating state. Every method is
/// synchronous and side-effect free beyond mutating `self`; all I/O is
/// described by the returned [`HostAction`]s.
pub struct HostDriver {
    root: Node,
    interface_gate: InterfaceGate,
}

impl HostDriver {
    /// A driver with a fresh, undiscovered interface node at the root.
    #[must_use]
    pub fn new() -> Self {
        Self { root: Node::new(Address::INTERFACE), interface_gate: InterfaceGate::Unknown }
    }

    /// The interface node and its discovered sub-tree.
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Finds the node at `addr`, if discovered.
    #[must_use]
    pub fn get_node(&self, addr: &Address) -> Option<&Node> {
        self.root.find(addr)
    }

    /// Mutable counterpart of [`Self::get_node`], for command-station
    /// operations issued by callers outside the node tree.
    pub fn find_mut(&mut self, addr: &Address) -> Option<&mut Node> {
        self.root.find_mut(addr)
    }

    /// `SYS_RESET` followed by the interface node's own property read,
    /// starting both at sequence 0.
    pub fn startup(&mut self) -> Vec<HostAction> {
        let addr = *self.root.address();
        let mut actions = vec![self.root.send_system(Message::SysReset)];
        self.root.reset_sequence();
        actions.extend(self.root.read_node_properties());
        convert_all(addr, actions)
    }

    /// Routes one inbound message to its target node and runs the interface
    /// gating hooks on the resulting actions.
    ///
    /// # Errors
    ///
    /// Propagates [`CoreError`] from [`Node::process`] (e.g. a child table
    /// larger than the node tree will track).
    pub fn process_ingress(&mut self, parsed: ParsedMessage) -> Result<Vec<HostAction>, CoreError> {
        let ParsedMessage { addr, message, .. } = parsed;

        let Some(node) = self.root.find_mut(&addr) else {
            warn!(addr = %addr, "ingress message for unknown node, dropping");
            return Ok(Vec::new());
        };
        let node_actions = node.process(&message)?;
        let saw_node_tab_count = matches!(message, Message::NodeTabCount { .. });

        let mut actions = convert_all(addr, node_actions);

        if saw_node_tab_count && self.interface_gate != InterfaceGate::Disabled {
            self.interface_gate = InterfaceGate::Disabled;
            actions.push(convert(
                *self.root.address(),
                self.root.send_system(Message::SysDisable),
            ));
        }

        // Re-checked on every ingress message, not just `NodeTab`: a child's
        // own completion (e.g. its `FEATURE_COUNT`/`FEATURE` exchange
        // settling) can be the event that finally makes the root's
        // complete-recursive predicate hold, not only the table entry that
        // first created it.
        if self.interface_gate != InterfaceGate::Enabled && self.root.complete_recursive() {
            self.interface_gate = InterfaceGate::Enabled;
            actions.push(convert(*self.root.address(), self.root.send_system(Message::SysEnable)));
            actions.push(HostAction::NodeChanged);
        }

        Ok(actions)
    }

    /// Fires a previously scheduled timer against the node at `addr`.
    pub fn process_timer(&mut self, addr: Address, timer: NodeTimer) -> Vec<HostAction> {
        let Some(node) = self.root.find_mut(&addr) else {
            warn!(addr = %addr, ?timer, "timer for unknown node, dropping");
            return Vec::new();
        };
        convert_all(addr, node.on_timer(timer))
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}
