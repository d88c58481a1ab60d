//! Downstream message sequence numbers.
//!
//! Sequence 0 is reserved to mean "unsequenced" (sent right after a reset).
//! The counter advances 1, 2, … 255, then wraps back to 1 — it never
//! revisits 0 once traffic has begun.

/// A downstream sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceNumber(u8);

impl SequenceNumber {
    /// The reset value (unsequenced).
    pub const RESET: Self = Self(0);

    /// Current value.
    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    /// Advances to the next sequence number, wrapping 255 back to 1 (never
    /// back to 0 — 0 only ever follows an explicit [`SequenceNumber::reset`]).
    #[must_use]
    pub fn next(self) -> Self {
        Self(if self.0 == 255 { 1 } else { self.0 + 1 })
    }

    /// Resets to the unsequenced value.
    #[must_use]
    pub fn reset() -> Self {
        Self::RESET
    }
}

impl From<u8> for SequenceNumber {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u8 {
    fn from(value: SequenceNumber) -> Self {
        value.0
    }
}
