//! Octet-stuffed serial framing and CRC-8 integrity.
//!
//! A frame on the wire is `MAGIC <escaped payload> MAGIC`. Any `MAGIC` or
//! `ESC` byte inside the payload (which includes the trailing CRC byte) is
//! escaped as `ESC (byte ^ 0x20)`. The payload is one or more concatenated
//! messages (see [`crate::message`]).

use crate::errors::ProtoError;

/// Frame delimiter.
pub const MAGIC: u8 = 0xFE;
/// Escape byte.
pub const ESC: u8 = 0xFD;

fn crc8_update(crc: u8, byte: u8) -> u8 {
    let mut c = crc ^ byte;
    for _ in 0..8 {
        c = if c & 1 != 0 { (c >> 1) ^ 0x8C } else { c >> 1 };
    }
    c
}

/// CRC-8 (poly 0x8C, initial 0) over a byte slice.
#[must_use]
pub fn crc8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |c, &b| crc8_update(c, b))
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == MAGIC || byte == ESC {
        out.push(ESC);
        out.push(byte ^ 0x20);
    } else {
        out.push(byte);
    }
}

/// Encodes `payload` (one or more concatenated messages) into a full frame,
/// including the opening/closing `MAGIC` bytes and the trailing CRC.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(MAGIC);
    let mut crc = 0u8;
    for &b in payload {
        crc = crc8_update(crc, b);
        push_escaped(&mut out, b);
    }
    push_escaped(&mut out, crc);
    out.push(MAGIC);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeforeFirstMagic,
    InFrame,
    Escaped,
}

/// Incremental frame reassembler fed one byte at a time from the serial
/// link.
///
/// Bytes received before the first `MAGIC` are discarded. A `MAGIC` seen
/// while the in-progress payload is empty is idle padding and is absorbed
/// without closing a frame. Any other `MAGIC` closes the frame currently
/// being assembled and simultaneously opens the next one.
#[derive(Debug)]
pub struct FrameReader {
    state: State,
    buf: Vec<u8>,
    crc: u8,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Creates a reader with no bytes buffered.
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::BeforeFirstMagic, buf: Vec::new(), crc: 0 }
    }

    /// Feeds one byte. Returns `Some` when a frame boundary is reached: `Ok`
    /// with the validated, unescaped payload (CRC byte stripped), or `Err`
    /// if the CRC did not validate. Frame-internal bytes return `None`.
    pub fn feed(&mut self, byte: u8) -> Option<Result<Vec<u8>, ProtoError>> {
        match self.state {
            State::BeforeFirstMagic => {
                if byte == MAGIC {
                    self.state = State::InFrame;
                    self.buf.clear();
                    self.crc = 0;
                }
                None
            },
            State::Escaped => {
                let actual = byte ^ 0x20;
                self.crc = crc8_update(self.crc, actual);
                self.buf.push(actual);
                self.state = State::InFrame;
                None
            },
            State::InFrame if byte == ESC => {
                self.state = State::Escaped;
                None
            },
            State::InFrame if byte == MAGIC => {
                if self.buf.is_empty() {
                    None
                } else {
                    let crc_ok = self.crc == 0;
                    let mut payload = std::mem::take(&mut self.buf);
                    self.crc = 0;
                    payload.pop();
                    Some(if crc_ok { Ok(payload) } else { Err(ProtoError::FrameCrc) })
                }
            },
            State::InFrame => {
                self.crc = crc8_update(self.crc, byte);
                self.buf.push(byte);
                None
            },
        }
    }

    /// Feeds a byte slice, collecting every frame boundary reached.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, ProtoError>> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scenario_1_magic_exchange() {
        // SYS_GET_MAGIC, address empty, seq 1, type 0x01
        let msg = [0x03, 0x00, 0x01, 0x01];
        let frame = encode_frame(&msg);
        assert_eq!(frame.first(), Some(&MAGIC));
        assert_eq!(frame.last(), Some(&MAGIC));

        let mut reader = FrameReader::new();
        let results = reader.feed_all(&frame);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &msg);
    }

    #[test]
    fn p2_split_multiple_messages_in_one_frame() {
        let m1 = [0x03, 0x00, 0x01, 0x01];
        let m2 = [0x03, 0x00, 0x02, 0x02];
        let mut payload = Vec::new();
        payload.extend_from_slice(&m1);
        payload.extend_from_slice(&m2);
        let frame = encode_frame(&payload);

        let mut reader = FrameReader::new();
        let results = reader.feed_all(&frame);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &payload);
    }

    #[test]
    fn consecutive_magics_are_idle_padding() {
        let msg = [0x03, 0x00, 0x01, 0x01];
        let frame = encode_frame(&msg);
        let mut padded = vec![MAGIC, MAGIC, MAGIC];
        padded.extend_from_slice(&frame);

        let mut reader = FrameReader::new();
        let results = reader.feed_all(&padded);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &msg);
    }

    #[test]
    fn p4_crc_rejection_on_bit_flip() {
        let msg = [0x03, 0x00, 0x01, 0x01];
        let mut frame = encode_frame(&msg);
        let crc_index = frame.len() - 2;
        frame[crc_index] ^= 0x01;

        let mut reader = FrameReader::new();
        let results = reader.feed_all(&frame);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(ProtoError::FrameCrc));
    }

    #[test]
    fn escapes_magic_and_esc_bytes_in_payload() {
        let msg = [0x02, MAGIC, ESC];
        let frame = encode_frame(&msg);
        // the two payload bytes must each have been escaped to two wire bytes
        assert!(frame.len() > msg.len() + 3);

        let mut reader = FrameReader::new();
        let results = reader.feed_all(&frame);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &msg);
    }

    proptest! {
        #[test]
        fn p2_framing_round_trip(payload in prop::collection::vec(any::<u8>(), 1..64)) {
            let frame = encode_frame(&payload);
            let mut reader = FrameReader::new();
            let results = reader.feed_all(&frame);
            prop_assert_eq!(results.len(), 1);
            prop_assert_eq!(results[0].as_ref().unwrap(), &payload);
        }

        #[test]
        fn p3_escape_invariance(payload in prop::collection::vec(any::<u8>(), 0..64)) {
            let frame = encode_frame(&payload);
            // No MAGIC byte may appear unescaped except the two frame delimiters.
            let inner = &frame[1..frame.len() - 1];
            let mut i = 0;
            while i < inner.len() {
                if inner[i] == ESC {
                    i += 2;
                } else {
                    prop_assert_ne!(inner[i], MAGIC);
                    i += 1;
                }
            }
        }

        #[test]
        fn p4_single_bit_flip_detected(
            payload in prop::collection::vec(any::<u8>(), 1..32),
            flip_byte in any::<u8>(),
        ) {
            let frame = encode_frame(&payload);
            let crc_index = frame.len() - 2;
            let mut corrupted = frame.clone();
            corrupted[crc_index] ^= 1 << (flip_byte % 8);
            if corrupted[crc_index] == MAGIC || corrupted[crc_index] == ESC {
                return Ok(()); // would change framing shape, not a pure CRC test
            }
            let mut reader = FrameReader::new();
            let results = reader.feed_all(&corrupted);
            prop_assert_eq!(results.len(), 1);
            prop_assert!(results[0].is_err());
        }
    }
}
