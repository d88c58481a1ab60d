//! Per-node state: discovery, feature inventory, and inbound message
//! dispatch.
//!
//! Uses the action pattern: [`Node::process`] and friends take no I/O and
//! return a list of [`NodeAction`]s for the dispatcher (C7) to execute. This
//! keeps discovery and the command-station keepalive logic pure and
//! unit-testable without a real transport.

use std::{collections::BTreeMap, time::Duration};

use bidib_proto::{Address, CsState, FeatureId, Message, SequenceNumber, UniqueId};
use tracing::{debug, warn};

use crate::{cs::CommandStation, error::CoreError};

/// Upper bound on how many child-table entries a node may report before the
/// dispatcher treats the table as corrupt rather than slow to arrive.
pub const MAX_NODES: usize = 128;

/// Delay before retrying `NodeTabGetAll` after a `NodeTabCount(0)`.
pub const NODE_TAB_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Coarse discovery phase, used only for diagnostics and error messages —
/// the authoritative completeness check is [`Node::complete_recursive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Child table and properties are still being read.
    Discovering,
    /// Complete-recursive holds for this node and its sub-tree.
    Ready,
}

/// A one-shot timer token a node asked the dispatcher to fire later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTimer {
    /// Retry `NodeTabGetAll` after an empty `NodeTabCount`.
    RetryNodeTabGetAll,
    /// Command-station watchdog keepalive re-send.
    CsRepeatGo,
}

/// An effect a [`Node`] asks its caller to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    /// Send a message downstream to the given address with the given
    /// sequence number (already assigned by the node that owns it).
    Send {
        /// Target node address.
        addr: Address,
        /// Sequence number this send consumes.
        seq: SequenceNumber,
        /// Message to send.
        message: Message,
    },
    /// Ask the dispatcher to fire `timer` again after `delay`.
    PostDelayed {
        /// How long to wait.
        delay: Duration,
        /// What to do when the delay elapses.
        timer: NodeTimer,
    },
    /// This node's externally visible state changed; fan out a
    /// node-changed event.
    NodeChanged,
}

/// A single BiDiB node (the interface itself, or one of its descendants).
#[derive(Debug, Clone)]
pub struct Node {
    address: Address,
    seq: SequenceNumber,
    magic: Option<u16>,
    sw_version: Option<Vec<(u8, u8, u8)>>,
    unique_id: Option<UniqueId>,
    fingerprint: Option<u32>,
    table_version: Option<u8>,
    expected_count: Option<usize>,
    table_entries: usize,
    children: Vec<Node>,
    features: BTreeMap<u8, u8>,
    expected_feature_count: Option<usize>,
    feature_streaming: bool,
    cs: Option<CommandStation>,
    pom_mid: u8,
    last_error: Option<u8>,
}

impl Node {
    /// Creates a freshly discovered node at `address` with no properties
    /// known yet.
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            seq: SequenceNumber::RESET,
            magic: None,
            sw_version: None,
            unique_id: None,
            fingerprint: None,
            table_version: None,
            expected_count: None,
            table_entries: 0,
            children: Vec::new(),
            features: BTreeMap::new(),
            expected_feature_count: None,
            feature_streaming: false,
            cs: None,
            pom_mid: 0,
            last_error: None,
        }
    }

    /// This node's address.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Direct children discovered so far.
    #[must_use]
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Reported unique id, if `SYS_UNIQUE_ID` has been seen.
    #[must_use]
    pub fn unique_id(&self) -> Option<UniqueId> {
        self.unique_id
    }

    /// Current feature value, if known.
    #[must_use]
    pub fn feature(&self, id: u8) -> Option<u8> {
        self.features.get(&id).copied()
    }

    /// The attached command-station extension, if this node's class has a
    /// DCC drive generator.
    #[must_use]
    pub fn command_station(&self) -> Option<&CommandStation> {
        self.cs.as_ref()
    }

    /// Whether `FEATURE_COUNT`'s advertised count has been satisfied by
    /// `FEATURE` replies seen so far. `None` (no `FEATURE_COUNT` seen yet)
    /// is never complete.
    #[must_use]
    fn features_complete(&self) -> bool {
        self.expected_feature_count.is_some_and(|expected| self.features.len() >= expected)
    }

    /// A node whose class has no sub-nodes is complete once its unique id
    /// and feature inventory are both known. A node with sub-nodes is
    /// complete once its child table has reached the expected size and
    /// every child is itself complete — its own feature inventory doesn't
    /// gate this, only its children's.
    #[must_use]
    pub fn complete_recursive(&self) -> bool {
        let Some(uid) = self.unique_id else { return false };
        if uid.class.has_sub_nodes() {
            match self.expected_count {
                Some(expected) => {
                    self.children.len() == expected
                        && self.children.iter().all(Node::complete_recursive)
                },
                None => false,
            }
        } else {
            self.features_complete()
        }
    }

    /// Coarse discovery phase, derived from [`Self::complete_recursive`].
    #[must_use]
    pub fn state(&self) -> NodeState {
        if self.complete_recursive() { NodeState::Ready } else { NodeState::Discovering }
    }

    /// Finds the node whose address matches `addr` exactly, searching this
    /// node and its descendants.
    #[must_use]
    pub fn find(&self, addr: &Address) -> Option<&Node> {
        if &self.address == addr {
            return Some(self);
        }
        self.children.iter().find_map(|child| {
            if child.address.contains_or_equals(addr) { child.find(addr) } else { None }
        })
    }

    /// Mutable counterpart of [`Self::find`].
    pub fn find_mut(&mut self, addr: &Address) -> Option<&mut Node> {
        if &self.address == addr {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| {
            if child.address.contains_or_equals(addr) { child.find_mut(addr) } else { None }
        })
    }

    fn send(&mut self, message: Message) -> NodeAction {
        let seq = self.seq;
        self.seq = self.seq.next();
        NodeAction::Send { addr: self.address, seq, message }
    }

    /// Builds a send of a bare system-common message (`SYS_RESET`,
    /// `SYS_ENABLE`, `SYS_DISABLE`, ...) on this node's behalf, advancing its
    /// sequence counter. Used by the dispatcher's interface-gating hooks,
    /// which live above per-node discovery logic and have no other way to
    /// reach a node's private sequence counter.
    pub fn send_system(&mut self, message: Message) -> NodeAction {
        self.send(message)
    }

    /// Resets the downstream sequence counter to 0, mirroring `SYS_RESET`.
    pub fn reset_sequence(&mut self) {
        self.seq = SequenceNumber::RESET;
    }

    /// Emits the batch of queries used to (re)discover a node's identity:
    /// magic, software version, unique id, and the full feature set.
    pub fn read_node_properties(&mut self) -> Vec<NodeAction> {
        vec![
            self.send(Message::SysGetMagic),
            self.send(Message::SysGetSwVersion),
            self.send(Message::SysGetUniqueId),
            self.send(Message::FeatureGetAll { streaming: false }),
        ]
    }

    /// Processes one inbound message addressed to this node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NodeTableOverflow`] if a `NODETAB_COUNT` reports
    /// more entries than [`MAX_NODES`].
    pub fn process(&mut self, message: &Message) -> Result<Vec<NodeAction>, CoreError> {
        let mut actions = Vec::new();
        match message {
            Message::SysMagic { magic } => {
                self.magic = Some(*magic);
                actions.push(NodeAction::NodeChanged);
            },
            Message::SysSwVersion { versions } => {
                self.sw_version = Some(versions.clone());
                actions.push(NodeAction::NodeChanged);
            },
            Message::SysUniqueId { uid, fingerprint } => {
                self.unique_id = Some(*uid);
                self.fingerprint = *fingerprint;
                if uid.class.has_dcc_drive_generator() && self.cs.is_none() {
                    self.cs = Some(CommandStation::new());
                }
                if uid.class.has_sub_nodes() {
                    actions.push(self.send(Message::NodeTabGetAll));
                }
                actions.push(NodeAction::NodeChanged);
            },
            Message::NodeTabCount { length } => {
                if *length as usize > MAX_NODES {
                    return Err(CoreError::NodeTableOverflow(*length as usize));
                }
                self.children.clear();
                self.table_entries = 0;
                self.expected_count = Some(*length as usize);
                if *length == 0 {
                    actions.push(NodeAction::PostDelayed {
                        delay: NODE_TAB_RETRY_DELAY,
                        timer: NodeTimer::RetryNodeTabGetAll,
                    });
                } else {
                    actions.push(self.send(Message::NodeTabGetNext));
                }
            },
            Message::NodeTab { version, local, uid } => {
                self.table_version = Some(*version);
                if *local != 0 {
                    let child_addr = self
                        .address
                        .append(*local)
                        .map_err(|_| CoreError::NodeTableOverflow(self.table_entries + 1))?;
                    let mut child = Node::new(child_addr);
                    let mut child_actions = Vec::new();
                    if uid.class.has_dcc_drive_generator() {
                        child.cs = Some(CommandStation::new());
                    }
                    child_actions.extend(child.read_node_properties());
                    self.children.push(child);
                    actions.extend(child_actions);
                }
                self.table_entries += 1;
                if self.table_entries < self.expected_count.unwrap_or(usize::MAX) {
                    actions.push(self.send(Message::NodeTabGetNext));
                } else {
                    actions.push(NodeAction::NodeChanged);
                }
            },
            Message::NodeNew { .. } => {
                self.children.clear();
                self.table_entries = 0;
                self.expected_count = None;
                actions.push(self.send(Message::NodeTabGetAll));
            },
            Message::FeatureCount { count, streaming } => {
                self.features.clear();
                self.feature_streaming = *streaming;
                self.expected_feature_count = Some(*count as usize);
                if !streaming && !self.features_complete() {
                    actions.push(self.send(Message::FeatureGetNext));
                }
                if self.features_complete() {
                    actions.push(NodeAction::NodeChanged);
                }
            },
            Message::Feature { id, value } => {
                self.features.insert(*id, *value);
                if !self.feature_streaming && !self.features_complete() {
                    actions.push(self.send(Message::FeatureGetNext));
                }
                if self.features_complete() {
                    actions.push(NodeAction::NodeChanged);
                }
            },
            Message::CsState { state } => {
                if let Some(cs) = self.cs.as_mut() {
                    if cs.on_state(*state) {
                        actions.push(NodeAction::NodeChanged);
                    }
                }
            },
            Message::BmCv { addr, cv, data } => {
                debug!(addr = %addr, cv = cv + 1, data, "POM read response");
                actions.push(NodeAction::NodeChanged);
            },
            Message::SysError { code, detail } => {
                warn!(kind = "SYS_ERROR", code = format!("{code:#04x}"), ?detail, "node reported error");
                self.last_error = Some(*code);
                actions.push(NodeAction::NodeChanged);
            },
            Message::Unknown { kind, .. } => {
                warn!(kind = format!("{kind:#04x}"), "dropping message of unrecognized kind");
            },
            _ => {},
        }
        Ok(actions)
    }

    /// Fires a previously scheduled [`NodeTimer`].
    pub fn on_timer(&mut self, timer: NodeTimer) -> Vec<NodeAction> {
        match timer {
            NodeTimer::RetryNodeTabGetAll => vec![self.send(Message::NodeTabGetAll)],
            NodeTimer::CsRepeatGo => self.repeat_go(),
        }
    }

    fn watchdog_delay(&self) -> Option<Duration> {
        let wd = self.features.get(&FeatureId::GEN_WATCHDOG).copied().unwrap_or(0);
        if wd == 0 { None } else { Some(Duration::from_millis(100 * u64::from(wd) / 2)) }
    }

    /// Commands track power on; schedules the watchdog keepalive if the
    /// node reports a non-zero `GEN_WATCHDOG` period.
    pub fn go(&mut self) -> Vec<NodeAction> {
        let Some(cs) = self.cs.as_mut() else { return Vec::new() };
        let mut actions = cs.request_state(CsState::Go, &self.address, &mut self.seq);
        if let Some(delay) = self.watchdog_delay() {
            actions.push(NodeAction::PostDelayed { delay, timer: NodeTimer::CsRepeatGo });
        }
        actions
    }

    /// Re-sends `GO` and reschedules itself, as long as the desired state
    /// is still `GO` — self-cancelling once `off`/`stop` changes it.
    fn repeat_go(&mut self) -> Vec<NodeAction> {
        match &self.cs {
            Some(cs) if cs.desired_state() == Some(CsState::Go) => self.go(),
            _ => Vec::new(),
        }
    }

    /// Commands a normal stop (no track power loss).
    pub fn stop(&mut self) -> Vec<NodeAction> {
        let Some(cs) = self.cs.as_mut() else { return Vec::new() };
        cs.request_state(CsState::Stop, &self.address, &mut self.seq)
    }

    /// Commands track power off.
    pub fn off(&mut self) -> Vec<NodeAction> {
        let Some(cs) = self.cs.as_mut() else { return Vec::new() };
        cs.request_state(CsState::Off, &self.address, &mut self.seq)
    }

    /// Sends a `CS_DRIVE` command built by the caller (see
    /// [`bidib_proto::CsDriveOptions`] for the exact wire layout).
    pub fn drive(&mut self, options: bidib_proto::CsDriveOptions) -> Vec<NodeAction> {
        vec![self.send(Message::CsDrive(options))]
    }

    /// Issues a programming-on-main request. `cv` is the host-facing
    /// 1-based CV number; the wire field is `cv - 1`.
    pub fn program_on_main(
        &mut self,
        loco_addr: u16,
        op: bidib_proto::CsPomOpCode,
        cv: u16,
        data: [u8; 4],
    ) -> Vec<NodeAction> {
        let mid = self.pom_mid;
        self.pom_mid = self.pom_mid.wrapping_add(1);
        let opts = bidib_proto::CsPomOptions {
            addr: loco_addr,
            addrx: 0,
            mid,
            op: op as u8,
            cv: cv.saturating_sub(1),
            cvx: 0,
            data,
        };
        vec![self.send(Message::CsPom(opts))]
    }

    /// Issues a service-mode programming request. Sets the command-station
    /// state to `PROG` first, then sends `CS_PROG`. `cv` is the host-facing
    /// 1-based CV number.
    pub fn program(
        &mut self,
        op: bidib_proto::CsProgOpCode,
        cv: u16,
        data: [u8; 4],
        data_len: u8,
    ) -> Vec<NodeAction> {
        let mut actions = match self.cs.as_mut() {
            Some(cs) => cs.request_state(CsState::Prog, &self.address, &mut self.seq),
            None => Vec::new(),
        };
        let opts = bidib_proto::CsProgOptions { op: op as u8, cv: cv.saturating_sub(1), data, data_len };
        actions.push(self.send(Message::CsProg(opts)));
        actions
    }
}

#[cfg(test)]
mod tests {
    use bidib_proto::ClassId;

    use super::*;

    fn cs_capable_uid() -> UniqueId {
        UniqueId { class: ClassId(0x10), class_ext: 0, vendor: 0x0D, product: [1, 0, 0, 0] }
    }

    fn sub_node_uid() -> UniqueId {
        UniqueId { class: ClassId(0x80), class_ext: 0, vendor: 0x0D, product: [2, 0, 0, 0] }
    }

    #[test]
    fn read_node_properties_uses_consecutive_sequence_numbers() {
        let mut node = Node::new(Address::INTERFACE);
        let actions = node.read_node_properties();
        let seqs: Vec<u8> = actions
            .iter()
            .map(|a| match a {
                NodeAction::Send { seq, .. } => seq.value(),
                _ => panic!("expected Send action"),
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn leaf_node_without_sub_nodes_is_complete_immediately() {
        let mut node = Node::new(Address::INTERFACE);
        node.process(&Message::SysUniqueId { uid: cs_capable_uid(), fingerprint: None }).unwrap();
        assert!(!node.complete_recursive(), "feature inventory not yet collected");
        node.process(&Message::FeatureCount { count: 0, streaming: false }).unwrap();
        assert!(node.complete_recursive());
        assert!(node.command_station().is_some());
    }

    #[test]
    fn d1_discovery_completes_after_full_child_table() {
        let mut node = Node::new(Address::INTERFACE);
        node.process(&Message::SysUniqueId { uid: sub_node_uid(), fingerprint: None }).unwrap();
        assert!(!node.complete_recursive());

        node.process(&Message::NodeTabCount { length: 2 }).unwrap();
        assert!(!node.complete_recursive());

        node.process(&Message::NodeTab { version: 1, local: 0, uid: sub_node_uid() }).unwrap();
        assert!(!node.complete_recursive());

        let leaf = UniqueId { class: ClassId(0), class_ext: 0, vendor: 0, product: [9, 0, 0, 0] };
        node.process(&Message::NodeTab { version: 1, local: 1, uid: leaf }).unwrap();
        assert!(!node.complete_recursive(), "leaf has not reported its own unique id or features yet");

        let child_addr = Address::new(&[1]).unwrap();
        let child = node.find_mut(&child_addr).unwrap();
        child.process(&Message::SysUniqueId { uid: leaf, fingerprint: None }).unwrap();
        child.process(&Message::FeatureCount { count: 0, streaming: false }).unwrap();

        assert!(node.complete_recursive());
        assert_eq!(node.children().len(), 1);
    }

    #[test]
    fn d2_empty_node_tab_count_schedules_retry() {
        let mut node = Node::new(Address::INTERFACE);
        let actions = node.process(&Message::NodeTabCount { length: 0 }).unwrap();
        assert_eq!(
            actions,
            vec![NodeAction::PostDelayed {
                delay: NODE_TAB_RETRY_DELAY,
                timer: NodeTimer::RetryNodeTabGetAll
            }]
        );
        let retry = node.on_timer(NodeTimer::RetryNodeTabGetAll);
        assert!(matches!(
            retry.as_slice(),
            [NodeAction::Send { message: Message::NodeTabGetAll, .. }]
        ));
    }

    #[test]
    fn node_table_overflow_is_an_error() {
        let mut node = Node::new(Address::INTERFACE);
        let err = node.process(&Message::NodeTabCount { length: 255 }).unwrap_err();
        assert!(matches!(err, CoreError::NodeTableOverflow(255)));
    }

    #[test]
    fn feature_inventory_polls_until_complete() {
        let mut node = Node::new(Address::INTERFACE);
        let actions = node.process(&Message::FeatureCount { count: 2, streaming: false }).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [NodeAction::Send { message: Message::FeatureGetNext, .. }]
        ));
        node.process(&Message::Feature { id: FeatureId::GEN_WATCHDOG, value: 10 }).unwrap();
        assert_eq!(node.feature(FeatureId::GEN_WATCHDOG), Some(10));
    }

    #[test]
    fn c1_go_schedules_watchdog_keepalive_when_nonzero() {
        let mut node = Node::new(Address::INTERFACE);
        node.process(&Message::SysUniqueId { uid: cs_capable_uid(), fingerprint: None }).unwrap();
        node.process(&Message::Feature { id: FeatureId::GEN_WATCHDOG, value: 10 }).unwrap();

        let actions = node.go();
        assert!(matches!(actions[0], NodeAction::Send { message: Message::CsSetState { state: 0x03 }, .. }));
        assert!(matches!(
            actions[1],
            NodeAction::PostDelayed { timer: NodeTimer::CsRepeatGo, delay }
                if delay == Duration::from_millis(500)
        ));
    }

    #[test]
    fn c1_repeat_go_stops_once_desired_state_changes() {
        let mut node = Node::new(Address::INTERFACE);
        node.process(&Message::SysUniqueId { uid: cs_capable_uid(), fingerprint: None }).unwrap();
        node.process(&Message::Feature { id: FeatureId::GEN_WATCHDOG, value: 4 }).unwrap();
        node.go();

        node.off();
        let actions = node.on_timer(NodeTimer::CsRepeatGo);
        assert!(actions.is_empty());
    }

    #[test]
    fn c2_program_on_main_subtracts_one_from_cv() {
        let mut node = Node::new(Address::INTERFACE);
        node.process(&Message::SysUniqueId { uid: cs_capable_uid(), fingerprint: None }).unwrap();
        let actions = node.program_on_main(3, bidib_proto::CsPomOpCode::ReadByte, 29, [0; 4]);
        let NodeAction::Send { message: Message::CsPom(opts), .. } = &actions[0] else {
            panic!("expected CsPom send");
        };
        assert_eq!(opts.cv, 28);
    }

    #[test]
    fn find_locates_descendant_by_address() {
        let mut root = Node::new(Address::INTERFACE);
        root.process(&Message::SysUniqueId { uid: sub_node_uid(), fingerprint: None }).unwrap();
        root.process(&Message::NodeTabCount { length: 1 }).unwrap();
        let leaf = UniqueId { class: ClassId(0), class_ext: 0, vendor: 0, product: [1, 0, 0, 0] };
        root.process(&Message::NodeTab { version: 1, local: 3, uid: leaf }).unwrap();

        let child_addr = Address::new(&[3]).unwrap();
        assert!(root.find(&child_addr).is_some());
        assert!(root.find(&Address::new(&[9]).unwrap()).is_none());
    }
}
