//! Node tree, discovery state machine, and command-station logic for BiDiB.
//!
//! Pure protocol logic with no direct I/O: methods take inbound messages or
//! timer firings and return [`node::NodeAction`]s for a transport-owning
//! caller (see `bidib-host`) to execute. This mirrors the action pattern
//! used throughout this codebase's connection/session layers, generalized
//! from a single session state machine to a recursive node tree.

pub mod cs;
pub mod env;
pub mod error;
pub mod event;
pub mod node;

pub use cs::CommandStation;
pub use env::{Environment, SystemEnv, TestEnv};
pub use error::CoreError;
pub use event::{CancelHandle, Event};
pub use node::{Node, NodeAction, NodeState, NodeTimer, MAX_NODES};
