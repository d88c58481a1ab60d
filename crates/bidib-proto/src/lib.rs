//! Wire framing and message codec for the BiDiB model-railway control
//! protocol.
//!
//! This crate has no I/O of its own: [`frame`] turns a byte stream into
//! length-delimited, CRC-checked frames, and [`message`] turns a frame's
//! payload into typed [`message::Message`] values. Transport and dispatch
//! live one layer up.

pub mod address;
pub mod constants;
pub mod errors;
pub mod frame;
pub mod message;
pub mod sequence;

pub use address::Address;
pub use constants::{ClassId, CsPomOpCode, CsProgOpCode, CsState, DccFormat, FeatureId, SysErrorCode, UniqueId};
pub use errors::{ProtoError, Result};
pub use frame::{encode_frame, FrameReader, ESC, MAGIC};
pub use message::{
    encode_one, parse_all, parse_one, CsDriveOptions, CsPomOptions, CsProgOptions, Message, ParsedMessage,
};
pub use sequence::SequenceNumber;
