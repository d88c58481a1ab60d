//! Hierarchical node addresses.
//!
//! A BiDiB address is up to four non-zero bytes, terminated on the wire by a
//! single zero byte. The empty address denotes the interface (the node
//! directly attached to the host).

use std::fmt;

use crate::errors::ProtoError;

/// Maximum number of non-zero address bytes.
pub const MAX_LEN: usize = 4;

/// A hierarchical, up-to-4-byte node address.
///
/// Addresses nest: a child's address is its parent's address with one more
/// non-zero byte appended. The empty address is the interface and
/// [`Address::contains_or_equals`] treats it as containing every address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl Address {
    /// The empty (interface) address.
    pub const INTERFACE: Self = Self { bytes: [0; MAX_LEN], len: 0 };

    /// Builds an address from its leading non-zero bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAddress`] if `bytes` is longer than
    /// [`MAX_LEN`] or contains a zero byte before its end.
    pub fn new(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() > MAX_LEN {
            return Err(ProtoError::BadAddress);
        }
        if bytes.iter().any(|&b| b == 0) {
            return Err(ProtoError::BadAddress);
        }
        let mut buf = [0u8; MAX_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { bytes: buf, len: bytes.len() as u8 })
    }

    /// Number of leading non-zero bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.len as usize
    }

    /// Leading non-zero bytes, in order.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.length()]
    }

    /// `true` for the empty (interface) address.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.len == 0
    }

    /// Appends one more non-zero byte, returning the child address.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAddress`] if `byte` is zero or this address
    /// is already at [`MAX_LEN`].
    pub fn append(&self, byte: u8) -> Result<Self, ProtoError> {
        if byte == 0 || self.length() == MAX_LEN {
            return Err(ProtoError::BadAddress);
        }
        let mut bytes = self.bytes;
        bytes[self.length()] = byte;
        Ok(Self { bytes, len: self.len + 1 })
    }

    /// `true` if `self` is a prefix of (or equal to) `other`.
    ///
    /// The interface address contains every address, including itself.
    #[must_use]
    pub fn contains_or_equals(&self, other: &Self) -> bool {
        self.length() <= other.length() && self.bytes() == &other.bytes()[..self.length()]
    }

    /// Parses the wire form: up to four non-zero bytes followed by a
    /// terminating zero, returning the address and the number of bytes
    /// consumed (including the terminator).
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAddress`] if no terminator is found within
    /// [`MAX_LEN`] + 1 bytes.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ProtoError> {
        let mut len = 0;
        while len < MAX_LEN {
            match data.get(len) {
                Some(0) => break,
                Some(_) => len += 1,
                None => return Err(ProtoError::BadAddress),
            }
        }
        match data.get(len) {
            Some(0) => Ok((Self::new(&data[..len])?, len + 1)),
            _ => Err(ProtoError::BadAddress),
        }
    }

    /// Encodes the wire form: leading non-zero bytes followed by the
    /// terminating zero.
    pub fn write_wire(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.bytes());
        out.push(0);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(")?;
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{b}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_interface() {
            return write!(f, "interface");
        }
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{b}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn interface_is_empty() {
        assert_eq!(Address::INTERFACE.length(), 0);
        assert!(Address::INTERFACE.is_interface());
    }

    #[test]
    fn append_extends_length() {
        let a = Address::INTERFACE.append(3).unwrap();
        assert_eq!(a.length(), 1);
        assert_eq!(a.bytes(), &[3]);
        let b = a.append(7).unwrap();
        assert_eq!(b.length(), 2);
        assert_eq!(b.bytes(), &[3, 7]);
    }

    #[test]
    fn append_rejects_zero_and_overflow() {
        assert!(Address::INTERFACE.append(0).is_err());
        let mut a = Address::INTERFACE;
        for b in 1..=4u8 {
            a = a.append(b).unwrap();
        }
        assert!(a.append(5).is_err());
    }

    #[test]
    fn interface_contains_everything() {
        let child = Address::new(&[1, 2]).unwrap();
        assert!(Address::INTERFACE.contains_or_equals(&child));
        assert!(Address::INTERFACE.contains_or_equals(&Address::INTERFACE));
    }

    #[test]
    fn prefix_contains_child() {
        let parent = Address::new(&[1]).unwrap();
        let child = parent.append(2).unwrap();
        assert!(parent.contains_or_equals(&child));
        assert!(!child.contains_or_equals(&parent));
    }

    #[test]
    fn wire_round_trip() {
        let a = Address::new(&[4, 1]).unwrap();
        let mut buf = Vec::new();
        a.write_wire(&mut buf);
        assert_eq!(buf, vec![4, 1, 0]);
        let (parsed, consumed) = Address::parse(&buf).unwrap();
        assert_eq!(parsed, a);
        assert_eq!(consumed, 3);
    }

    #[test]
    fn wire_round_trip_interface() {
        let mut buf = Vec::new();
        Address::INTERFACE.write_wire(&mut buf);
        assert_eq!(buf, vec![0]);
        let (parsed, consumed) = Address::parse(&buf).unwrap();
        assert_eq!(parsed, Address::INTERFACE);
        assert_eq!(consumed, 1);
    }

    proptest! {
        #[test]
        fn a1_length_matches_append_count(n in 0usize..=4) {
            let mut a = Address::INTERFACE;
            for i in 0..n {
                a = a.append((i + 1) as u8).unwrap();
            }
            prop_assert_eq!(a.length(), n);
        }

        #[test]
        fn a2_interface_contains_any(bytes in prop::collection::vec(1u8..=255, 0..=4)) {
            let addr = Address::new(&bytes).unwrap();
            prop_assert!(Address::INTERFACE.contains_or_equals(&addr));
        }

        #[test]
        fn a3_parent_contains_appended_child(
            bytes in prop::collection::vec(1u8..=255, 0..=3),
            extra in 1u8..=255,
        ) {
            let parent = Address::new(&bytes).unwrap();
            let child = parent.append(extra).unwrap();
            prop_assert!(parent.contains_or_equals(&child));
        }

        #[test]
        fn wire_round_trip_arbitrary(bytes in prop::collection::vec(1u8..=255, 0..=4)) {
            let addr = Address::new(&bytes).unwrap();
            let mut buf = Vec::new();
            addr.write_wire(&mut buf);
            let (parsed, consumed) = Address::parse(&buf).unwrap();
            prop_assert_eq!(parsed, addr);
            prop_assert_eq!(consumed, buf.len());
        }
    }
}
