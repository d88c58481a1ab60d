//! Protocol constants: class bitfield, unique id, and the small value enums
//! used throughout the message layer.
//!
//! Numeric assignments are taken directly from the BiDiB reference constant
//! tables (see SPEC_FULL.md §6.3) and must not be renumbered.

use std::fmt;

/// The `class` byte of a [`UniqueId`]: a bitfield of node capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u8);

impl ClassId {
    const HAS_SUB_NODES: u8 = 0x80;
    const HAS_OCCUPANCY_DETECTION: u8 = 0x40;
    const HAS_DCC_DRIVE_GENERATOR: u8 = 0x10;
    const HAS_DCC_PROGRAMMING_GENERATOR: u8 = 0x08;
    const HAS_ACCESSORY_CONTROL: u8 = 0x04;
    const HAS_BOOSTER: u8 = 0x02;
    const HAS_SWITCHING: u8 = 0x01;

    /// Node has sub-nodes reachable via `NODETAB_*`.
    #[must_use]
    pub fn has_sub_nodes(self) -> bool {
        self.0 & Self::HAS_SUB_NODES != 0
    }

    /// Node reports occupancy detection (`BM_*`).
    #[must_use]
    pub fn has_occupancy_detection(self) -> bool {
        self.0 & Self::HAS_OCCUPANCY_DETECTION != 0
    }

    /// Node drives DCC track signal (command station).
    #[must_use]
    pub fn has_dcc_drive_generator(self) -> bool {
        self.0 & Self::HAS_DCC_DRIVE_GENERATOR != 0
    }

    /// Node generates DCC for service-mode programming.
    #[must_use]
    pub fn has_dcc_programming_generator(self) -> bool {
        self.0 & Self::HAS_DCC_PROGRAMMING_GENERATOR != 0
    }

    /// Node controls accessories (turnouts, signals).
    #[must_use]
    pub fn has_accessory_control(self) -> bool {
        self.0 & Self::HAS_ACCESSORY_CONTROL != 0
    }

    /// Node is a booster.
    #[must_use]
    pub fn has_booster(self) -> bool {
        self.0 & Self::HAS_BOOSTER != 0
    }

    /// Node has switching (port control) functions.
    #[must_use]
    pub fn has_switching(self) -> bool {
        self.0 & Self::HAS_SWITCHING != 0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.has_sub_nodes() {
            names.push("sub-nodes");
        }
        if self.has_occupancy_detection() {
            names.push("occupancy");
        }
        if self.has_dcc_drive_generator() {
            names.push("dcc-drive");
        }
        if self.has_dcc_programming_generator() {
            names.push("dcc-programming");
        }
        if self.has_accessory_control() {
            names.push("accessory");
        }
        if self.has_booster() {
            names.push("booster");
        }
        if self.has_switching() {
            names.push("switching");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Seven-byte node identity, optionally followed by a four-byte fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId {
    /// Capability bitfield.
    pub class: ClassId,
    /// Vendor-specific class extension.
    pub class_ext: u8,
    /// Vendor id (BiDiB vendor registry).
    pub vendor: u8,
    /// Little-endian product/serial bytes.
    pub product: [u8; 4],
}

impl UniqueId {
    /// Parses the seven raw bytes of a unique id (class, class_ext, vendor,
    /// then four little-endian product bytes).
    #[must_use]
    pub fn from_bytes(b: [u8; 7]) -> Self {
        Self {
            class: ClassId(b[0]),
            class_ext: b[1],
            vendor: b[2],
            product: [b[3], b[4], b[5], b[6]],
        }
    }

    /// Serializes back to the seven raw bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 7] {
        [
            self.class.0,
            self.class_ext,
            self.vendor,
            self.product[0],
            self.product[1],
            self.product[2],
            self.product[3],
        ]
    }

    /// Product/serial field as a little-endian `u32`.
    #[must_use]
    pub fn product_id(self) -> u32 {
        u32::from_le_bytes(self.product)
    }
}

/// Command-station track power state (`CS_STATE`/`CS_SET_STATE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CsState {
    /// Track power off.
    Off = 0x00,
    /// Stop, normal deceleration.
    Stop = 0x01,
    /// Soft stop.
    SoftStop = 0x02,
    /// Track power on, normal operation.
    Go = 0x03,
    /// Track power on, ignoring watchdog.
    GoIgnoreWatchdog = 0x04,
    /// Service-mode programming.
    Prog = 0x08,
    /// Service-mode programming, busy.
    ProgBusy = 0x09,
    /// Generic busy.
    Busy = 0x0D,
    /// State query in flight.
    Query = 0xFF,
}

impl CsState {
    /// Maps a raw wire byte to a known state.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Off,
            0x01 => Self::Stop,
            0x02 => Self::SoftStop,
            0x03 => Self::Go,
            0x04 => Self::GoIgnoreWatchdog,
            0x08 => Self::Prog,
            0x09 => Self::ProgBusy,
            0x0D => Self::Busy,
            0xFF => Self::Query,
            _ => return None,
        })
    }
}

/// DCC packet format used by [`crate::message::CsDriveOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DccFormat {
    /// 14 speed steps.
    Dcc14 = 0,
    /// 28 speed steps.
    Dcc28 = 2,
    /// 128 speed steps.
    Dcc128 = 3,
}

impl DccFormat {
    /// Maps a raw wire byte to a known format.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Dcc14,
            2 => Self::Dcc28,
            3 => Self::Dcc128,
            _ => return None,
        })
    }
}

/// POM (programming-on-main) sub-opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CsPomOpCode {
    /// Read a block of CVs.
    ReadBlock = 0x00,
    /// Read a single CV byte.
    ReadByte = 0x01,
    /// Write one bit of a CV.
    WriteBit = 0x02,
    /// Write a whole CV byte.
    WriteByte = 0x03,
}

impl CsPomOpCode {
    /// Maps a raw wire byte to a known opcode.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::ReadBlock,
            0x01 => Self::ReadByte,
            0x02 => Self::WriteBit,
            0x03 => Self::WriteByte,
            _ => return None,
        })
    }
}

/// Service-mode programming sub-opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CsProgOpCode {
    /// Abort programming.
    Break = 0x00,
    /// Query current programming status.
    Query = 0x01,
    /// Read a CV byte.
    ReadByte = 0x02,
    /// Read/write a single CV bit.
    ReadWriteBit = 0x03,
    /// Write a CV byte.
    WriteByte = 0x04,
}

impl CsProgOpCode {
    /// Maps a raw wire byte to a known opcode.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Break,
            0x01 => Self::Query,
            0x02 => Self::ReadByte,
            0x03 => Self::ReadWriteBit,
            0x04 => Self::WriteByte,
            _ => return None,
        })
    }
}

/// `SYS_ERROR` wire payload code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SysErrorCode {
    /// No error.
    None = 0x00,
    /// Generic text error follows.
    Text = 0x01,
    /// CRC error.
    Crc = 0x02,
    /// Size/length error.
    Size = 0x03,
    /// Sequence number error.
    Sequence = 0x04,
    /// Bad parameter.
    Parameter = 0x05,
    /// Bus error.
    Bus = 0x10,
    /// Address stack error.
    AddrStack = 0x11,
    /// Duplicate unique id on the bus.
    IdDouble = 0x12,
    /// Sub-bus CRC error.
    SubCrc = 0x13,
    /// Sub-bus timing error.
    SubTime = 0x14,
    /// Sub-bus packet error.
    SubPaket = 0x15,
    /// Buffer overrun.
    Overrun = 0x16,
    /// Hardware error.
    Hw = 0x20,
    /// Node requires a reset.
    ResetRequired = 0x21,
    /// Host did not acknowledge in time.
    NoSecAckByHost = 0x30,
}

impl SysErrorCode {
    /// Maps a raw wire byte to a known code; unrecognized codes are treated
    /// as [`SysErrorCode::Text`] by callers rather than rejected, per the
    /// "never treat an unfamiliar but legitimate type byte as corruption"
    /// rule applied throughout this codec.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::None,
            0x01 => Self::Text,
            0x02 => Self::Crc,
            0x03 => Self::Size,
            0x04 => Self::Sequence,
            0x05 => Self::Parameter,
            0x10 => Self::Bus,
            0x11 => Self::AddrStack,
            0x12 => Self::IdDouble,
            0x13 => Self::SubCrc,
            0x14 => Self::SubTime,
            0x15 => Self::SubPaket,
            0x16 => Self::Overrun,
            0x20 => Self::Hw,
            0x21 => Self::ResetRequired,
            0x30 => Self::NoSecAckByHost,
            _ => return None,
        })
    }
}

/// A feature id (`FEATURE_GET`/`FEATURE_SET` key space).
///
/// Only the ids this implementation reasons about directly are named; the
/// rest are carried as [`FeatureId::Other`] since feature polling must accept
/// any id a node reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureId {
    /// Command-station watchdog period in units of 100ms (0 = disabled).
    GenWatchdog,
    /// Any other feature id, carried verbatim.
    Other(u8),
}

impl FeatureId {
    /// Wire value for the command-station watchdog feature.
    pub const GEN_WATCHDOG: u8 = 101;

    /// Maps a raw wire byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        if v == Self::GEN_WATCHDOG { Self::GenWatchdog } else { Self::Other(v) }
    }

    /// Raw wire byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::GenWatchdog => Self::GEN_WATCHDOG,
            Self::Other(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_id_bits() {
        let c = ClassId(0x80 | 0x10 | 0x01);
        assert!(c.has_sub_nodes());
        assert!(c.has_dcc_drive_generator());
        assert!(c.has_switching());
        assert!(!c.has_booster());
    }

    #[test]
    fn unique_id_round_trip() {
        let raw = [0x90, 0x00, 0x0D, 0x78, 0x56, 0x34, 0x12];
        let uid = UniqueId::from_bytes(raw);
        assert_eq!(uid.to_bytes(), raw);
        assert_eq!(uid.product_id(), 0x1234_5678);
    }

    #[test]
    fn cs_state_known_values() {
        assert_eq!(CsState::from_u8(0x03), Some(CsState::Go));
        assert_eq!(CsState::from_u8(0xFE), None);
    }

    #[test]
    fn feature_id_watchdog() {
        assert_eq!(FeatureId::from_u8(101), FeatureId::GenWatchdog);
        assert_eq!(FeatureId::GenWatchdog.to_u8(), 101);
        assert_eq!(FeatureId::from_u8(5), FeatureId::Other(5));
    }
}
