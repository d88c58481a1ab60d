//! Errors raised by the serial transport and host dispatcher.
//!
//! Mirrors the layering in `bidib-proto`/`bidib-core`: a wire-codec error is
//! recoverable (drop and log), a transport error is session-fatal, and an
//! enqueue timeout is a lost-message event the protocol's own retry
//! machinery tolerates.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors at the transport/dispatcher boundary.
#[derive(Error, Debug)]
pub enum HostError {
    /// No candidate baud rate produced a `SYS_MAGIC` reply; terminal for
    /// [`crate::transport::Transport::open`].
    #[error("failed to open serial transport on {port}: {source}")]
    TransportOpen {
        /// Device path that was probed.
        port: String,
        /// Underlying I/O failure from the last attempt.
        #[source]
        source: io::Error,
    },

    /// A read or write failed after the transport was already open; the
    /// caller should treat the session as closed.
    #[error("serial transport I/O error: {0}")]
    TransportIo(#[from] io::Error),

    /// An enqueue onto the ingress queue, or a posted callback, did not
    /// complete within its budget. The message is dropped, not retried here.
    #[error("enqueue timed out after {0:?}")]
    QueueTimeout(Duration),

    /// A node/command-station state machine rejected the operation.
    #[error("dispatcher error: {0}")]
    Core(#[from] bidib_core::CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_bridge_in() {
        let err: HostError = bidib_core::CoreError::NodeTableOverflow(200).into();
        assert!(matches!(err, HostError::Core(bidib_core::CoreError::NodeTableOverflow(200))));
    }

    #[test]
    fn io_errors_bridge_in() {
        let err: HostError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, HostError::TransportIo(_)));
    }
}
