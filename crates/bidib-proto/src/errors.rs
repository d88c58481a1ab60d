//! Errors raised while framing and parsing BiDiB wire data.

use thiserror::Error;

/// Errors at the frame/message codec boundary.
///
/// Everything here is recoverable at the protocol level: a bad frame or
/// message is dropped and logged by the caller, never treated as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// A frame's CRC-8 did not validate.
    #[error("frame failed CRC check")]
    FrameCrc,

    /// A frame's `len`/address layout was structurally invalid.
    #[error("malformed frame shape")]
    FrameShape,

    /// A message kind saw a payload of the wrong length.
    #[error("message payload has unexpected shape for kind {kind:#04x}: {detail}")]
    ParseShape {
        /// The message type byte.
        kind: u8,
        /// What was wrong with the payload.
        detail: &'static str,
    },

    /// A message type byte fell outside every in-scope kind.
    #[error("unrecognized message kind {0:#04x}")]
    UnknownKind(u8),

    /// An address had more than four non-zero bytes, or no terminator.
    #[error("malformed address")]
    BadAddress,
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
