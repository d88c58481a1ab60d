//! Serial transport and scheduling dispatcher for a BiDiB host.
//!
//! Wires `bidib-core`'s pure node-tree logic to a real `tokio-serial` port:
//! a reader task owns the frame state machine, a single scheduler task owns
//! all node state, and callers reach the scheduler only through a bounded
//! queue (see [`host::Host`]).

pub mod config;
pub mod driver;
pub mod error;
pub mod host;
pub mod transport;

pub use config::HostConfig;
pub use driver::{HostAction, HostDriver};
pub use error::HostError;
pub use host::Host;
pub use transport::Transport;
