//! Message envelope and the typed payload kinds of interest (system common,
//! system bus management, feature inventory, vendor/user config, occupancy,
//! booster, accessory control, and command-station downstream/upstream).
//!
//! Message kinds outside these groups (port/macro control, `RailcomPlus`,
//! firmware update, xPOM/M4) are not given typed variants; they decode to
//! [`Message::Unknown`] rather than a parse error, since a real node may
//! legitimately emit them.

use crate::{
    address::Address,
    constants::UniqueId,
    errors::ProtoError,
    sequence::SequenceNumber,
};

fn read_u16_le(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn write_u16_le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_lv_string(b: &[u8]) -> Result<(String, usize), ProtoError> {
    let len = *b.first().ok_or(ProtoError::ParseShape { kind: 0, detail: "truncated string" })?
        as usize;
    let bytes = b
        .get(1..1 + len)
        .ok_or(ProtoError::ParseShape { kind: 0, detail: "truncated string body" })?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), 1 + len))
}

fn write_lv_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(255) as u8;
    out.push(len);
    out.extend_from_slice(&bytes[..len as usize]);
}

/// Drive command payload, shared by `CS_DRIVE` (downstream) and
/// `CS_DRIVE_MANUAL` (upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsDriveOptions {
    /// DCC loco address.
    pub addr: u16,
    /// Packet format (raw wire byte; use [`crate::constants::DccFormat::from_u8`]).
    pub format: u8,
    /// Bitmask of which fields below are valid: bit0=speed, bit1=F1-F4,
    /// bit2=F5-F8, bit3=F9-F12, bit4=F13-F20, bit5=F21-F28.
    pub active_bits: u8,
    /// Bit7 = direction (1 = forward), bits0-6 = speed step (1 = e-stop).
    pub speed: u8,
    /// High nibble = light (F0), low nibble = F4..F1.
    pub f4_f0: u8,
    /// F12..F5.
    pub f12_f5: u8,
    /// F20..F13.
    pub f20_f13: u8,
    /// F28..F21.
    pub f28_f21: u8,
}

impl CsDriveOptions {
    /// `true` if the headlight (F0) bit is set.
    ///
    /// Packed as `light:bit4 | f4_f1:bits0-3` in [`Self::f4_f0`]. This is
    /// deliberately not `data[5] & 0x10` read against the unpacked byte
    /// offset used in some field implementations — both encoder and decoder
    /// here agree on the nibble layout, so round-trips hold.
    #[must_use]
    pub fn light(self) -> bool {
        self.f4_f0 & 0x10 != 0
    }

    /// `true` if the speed step is a forward direction.
    #[must_use]
    pub fn forward(self) -> bool {
        self.speed & 0x80 != 0
    }

    fn encode(self, out: &mut Vec<u8>) {
        write_u16_le(out, self.addr);
        out.push(self.format);
        out.push(self.active_bits);
        out.push(self.speed);
        out.push(self.f4_f0);
        out.push(self.f12_f5);
        out.push(self.f20_f13);
        out.push(self.f28_f21);
    }

    fn decode(kind: u8, b: &[u8]) -> Result<Self, ProtoError> {
        if b.len() != 9 {
            return Err(ProtoError::ParseShape { kind, detail: "CS_DRIVE payload must be 9 bytes" });
        }
        Ok(Self {
            addr: read_u16_le(&b[0..2]),
            format: b[2],
            active_bits: b[3],
            speed: b[4],
            f4_f0: b[5],
            f12_f5: b[6],
            f20_f13: b[7],
            f28_f21: b[8],
        })
    }
}

/// `CS_POM` (programming-on-main) downstream payload. `cv` is the wire
/// value: host-facing CVs are 1-based, the wire field is 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsPomOptions {
    /// DCC loco/accessory address.
    pub addr: u16,
    /// Extended address (accessory decoders); 0 when unused.
    pub addrx: u16,
    /// Message id echoed back in `CS_POM_ACK`.
    pub mid: u8,
    /// POM sub-opcode (raw wire byte; use [`crate::constants::CsPomOpCode::from_u8`]).
    pub op: u8,
    /// Wire CV value (host CV minus one).
    pub cv: u16,
    /// Extended CV index for block operations.
    pub cvx: u8,
    /// Data bytes (meaning depends on `op`).
    pub data: [u8; 4],
}

impl CsPomOptions {
    fn encode(self, out: &mut Vec<u8>) {
        write_u16_le(out, self.addr);
        write_u16_le(out, self.addrx);
        out.push(self.mid);
        out.push(self.op);
        out.extend_from_slice(&self.cv.to_le_bytes());
        out.push(self.cvx);
        out.extend_from_slice(&self.data);
    }

    fn decode(kind: u8, b: &[u8]) -> Result<Self, ProtoError> {
        if b.len() != 13 {
            return Err(ProtoError::ParseShape { kind, detail: "CS_POM payload must be 13 bytes" });
        }
        Ok(Self {
            addr: read_u16_le(&b[0..2]),
            addrx: read_u16_le(&b[2..4]),
            mid: b[4],
            op: b[5],
            cv: read_u16_le(&b[6..8]),
            cvx: b[8],
            data: [b[9], b[10], b[11], b[12]],
        })
    }
}

/// Service-mode programming (`CS_PROG`) downstream payload. `cv` is the wire
/// value: host CV minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsProgOptions {
    /// Sub-opcode (raw wire byte; use [`crate::constants::CsProgOpCode::from_u8`]).
    pub op: u8,
    /// Wire CV value (host CV minus one).
    pub cv: u16,
    /// Up to 4 data bytes; the last is only meaningful for multi-byte ops.
    pub data: [u8; 4],
    /// Number of trailing data bytes actually present on the wire (3 or 4).
    pub data_len: u8,
}

impl CsProgOptions {
    fn encode(self, out: &mut Vec<u8>) {
        out.push(self.op);
        out.extend_from_slice(&self.cv.to_le_bytes());
        out.extend_from_slice(&self.data[..self.data_len as usize]);
    }

    fn decode(kind: u8, b: &[u8]) -> Result<Self, ProtoError> {
        if b.len() != 6 && b.len() != 7 {
            return Err(ProtoError::ParseShape {
                kind,
                detail: "CS_PROG payload must be 6 or 7 bytes",
            });
        }
        let data_len = (b.len() - 3) as u8;
        let mut data = [0u8; 4];
        data[..data_len as usize].copy_from_slice(&b[3..]);
        Ok(Self { op: b[0], cv: read_u16_le(&b[1..3]), data, data_len })
    }
}

/// A decoded message payload.
///
/// Variant names follow the protocol's own kind names rather than Rust
/// naming conventions (e.g. `SysGetMagic`), since that is the vocabulary
/// this wire format is documented and discussed in.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // --- system common (downstream) ---
    /// `SYS_GET_MAGIC`
    SysGetMagic,
    /// `SYS_GET_P_VERSION`
    SysGetPVersion,
    /// `SYS_ENABLE`
    SysEnable,
    /// `SYS_DISABLE`
    SysDisable,
    /// `SYS_GET_UNIQUE_ID`
    SysGetUniqueId,
    /// `SYS_GET_SW_VERSION`
    SysGetSwVersion,
    /// `SYS_PING`
    SysPing {
        /// Echoed back in `SYS_PONG`.
        dat: u8,
    },
    /// `SYS_IDENTIFY`
    SysIdentify {
        /// Requested identify state.
        id_state: u8,
    },
    /// `SYS_RESET`
    SysReset,
    /// `GET_PKT_CAPACITY`
    GetPktCapacity,
    /// `SYS_GET_ERROR`
    SysGetError,
    /// `SYS_CLOCK`
    SysClock {
        /// Four model-time fields.
        tcode: [u8; 4],
    },

    // --- system bus management (downstream) ---
    /// `NODETAB_GETALL`
    NodeTabGetAll,
    /// `NODETAB_GETNEXT`
    NodeTabGetNext,
    /// `NODE_CHANGED_ACK`
    NodeChangedAck {
        /// Node-table version the host has now applied.
        version: u8,
    },

    // --- feature inventory (downstream) ---
    /// `FEATURE_GETALL`
    FeatureGetAll {
        /// `true` requests streaming delivery rather than poll/response.
        streaming: bool,
    },
    /// `FEATURE_GETNEXT`
    FeatureGetNext,
    /// `FEATURE_GET`
    FeatureGet {
        /// Feature id to read.
        id: u8,
    },
    /// `FEATURE_SET`
    FeatureSet {
        /// Feature id to write.
        id: u8,
        /// New value.
        value: u8,
    },

    // --- vendor / user config (downstream) ---
    /// `VENDOR_ENABLE`
    VendorEnable {
        /// Unique id the enable is addressed to.
        uid: UniqueId,
    },
    /// `VENDOR_DISABLE`
    VendorDisable,
    /// `VENDOR_SET`
    VendorSet {
        /// Vendor CV name.
        name: String,
        /// New value.
        value: String,
    },
    /// `VENDOR_GET`
    VendorGet {
        /// Vendor CV name.
        name: String,
    },

    // --- occupancy (downstream) ---
    /// `BM_GET_RANGE`
    BmGetRange {
        /// First module number (inclusive).
        start: u8,
        /// Last module number (inclusive).
        end: u8,
    },
    /// `BM_GET_CONFIDENCE`
    BmGetConfidence,

    // --- booster (downstream) ---
    /// `BOOST_OFF`
    BoostOff {
        /// Non-zero restricts the command to a single booster.
        unicast: u8,
    },
    /// `BOOST_ON`
    BoostOn {
        /// Non-zero restricts the command to a single booster.
        unicast: u8,
    },
    /// `BOOST_QUERY`
    BoostQuery,

    // --- accessory control (downstream) ---
    /// `ACCESSORY_SET`
    AccessorySet {
        /// Accessory number.
        anum: u8,
        /// Requested aspect.
        aspect: u8,
    },
    /// `ACCESSORY_GET`
    AccessoryGet {
        /// Accessory number.
        anum: u8,
    },

    // --- command station downstream ---
    /// `CS_SET_STATE`
    CsSetState {
        /// Requested state (raw wire byte; use [`crate::constants::CsState::from_u8`]).
        state: u8,
    },
    /// `CS_DRIVE`
    CsDrive(CsDriveOptions),
    /// `CS_ACCESSORY`
    CsAccessory {
        /// Accessory decoder address.
        addr: u16,
        /// Requested aspect.
        aspect: u8,
        /// Switch time in ms (0 = decoder default).
        time: u16,
    },
    /// `CS_POM`
    CsPom(CsPomOptions),
    /// `CS_PROG`
    CsProg(CsProgOptions),

    // --- system common (upstream) ---
    /// `SYS_MAGIC`
    SysMagic {
        /// Protocol magic word (0xAFFE full node, 0xB00D bootloader).
        magic: u16,
    },
    /// `SYS_PONG`
    SysPong {
        /// Echo of the `SYS_PING` payload.
        dat: u8,
    },
    /// `SYS_P_VERSION`
    SysPVersion {
        /// BiDiB protocol version.
        version: u16,
    },
    /// `SYS_UNIQUE_ID`
    SysUniqueId {
        /// Node identity.
        uid: UniqueId,
        /// Optional configuration fingerprint.
        fingerprint: Option<u32>,
    },
    /// `SYS_SW_VERSION`
    SysSwVersion {
        /// 1 to 16 `(patch, minor, major)` triples.
        versions: Vec<(u8, u8, u8)>,
    },
    /// `SYS_ERROR`
    SysError {
        /// Raw wire error code (use [`crate::constants::SysErrorCode::from_u8`]).
        code: u8,
        /// Code-dependent trailing detail bytes.
        detail: Vec<u8>,
    },
    /// `SYS_IDENTIFY_STATE`
    SysIdentifyState {
        /// Current identify state.
        state: u8,
    },

    // --- system bus management (upstream) ---
    /// `NODETAB_COUNT`
    NodeTabCount {
        /// Number of entries the node will enumerate.
        length: u8,
    },
    /// `NODETAB`
    NodeTab {
        /// Node-table version.
        version: u8,
        /// Local address byte (0 means "self").
        local: u8,
        /// Child node's unique id.
        uid: UniqueId,
    },
    /// `PKT_CAPACITY`
    PktCapacity {
        /// Maximum frame payload size this node supports.
        capacity: u8,
    },
    /// `NODE_NA`
    NodeNa {
        /// Local address byte that no longer resolves.
        node: u8,
    },
    /// `NODE_LOST`
    NodeLost {
        /// Local address byte of the node that disappeared.
        node_addr: u8,
        /// Its unique id.
        uid: UniqueId,
    },
    /// `NODE_NEW`
    NodeNew {
        /// Node-table version after this addition.
        version: u8,
        /// Local address byte assigned to the new node.
        node_addr: u8,
        /// Its unique id.
        uid: UniqueId,
    },
    /// `STALL`
    Stall {
        /// Non-zero while the node cannot accept further downstream traffic.
        state: u8,
    },

    // --- feature inventory (upstream) ---
    /// `FEATURE`
    Feature {
        /// Feature id.
        id: u8,
        /// Current value.
        value: u8,
    },
    /// `FEATURE_NA`
    FeatureNa {
        /// Feature id the node does not support.
        id: u8,
    },
    /// `FEATURE_COUNT`
    FeatureCount {
        /// Number of features the node will enumerate.
        count: u8,
        /// `true` if the node will stream features unprompted.
        streaming: bool,
    },

    // --- vendor / user config (upstream) ---
    /// `VENDOR`
    Vendor {
        /// Vendor CV name.
        name: String,
        /// Current value.
        value: String,
    },
    /// `VENDOR_ACK`
    VendorAck {
        /// Acknowledged mode.
        mode: u8,
    },

    // --- occupancy (upstream) ---
    /// `BM_OCC`
    BmOcc {
        /// Module number now occupied.
        mnum: u8,
        /// Optional bidi timestamp.
        timestamp: Option<u16>,
    },
    /// `BM_FREE`
    BmFree {
        /// Module number now free.
        mnum: u8,
    },
    /// `BM_MULTIPLE`
    BmMultiple {
        /// First module number in the bitmap.
        base: u8,
        /// One bit per module, `base..base+8*data.len()`.
        data: Vec<u8>,
    },
    /// `BM_ADDRESS`
    BmAddress {
        /// Module number.
        mnum: u8,
        /// Detected loco address, if any.
        addr: Option<u16>,
    },
    /// `BM_CV`
    BmCv {
        /// Detected loco address.
        addr: u16,
        /// Wire CV value (host CV minus one).
        cv: u16,
        /// CV content.
        data: u8,
    },
    /// `BM_SPEED`
    BmSpeed {
        /// Detected loco address.
        addr: u16,
        /// Measured speed.
        speed: u16,
    },
    /// `BM_CURRENT`
    BmCurrent {
        /// Module number.
        mnum: u8,
        /// Current reading.
        current: u8,
    },
    /// `BM_CONFIDENCE`
    BmConfidence {
        /// Void (undetectable) fraction indicator.
        void: u8,
        /// Freeze indicator.
        freeze: u8,
        /// No-signal indicator.
        nosignal: u8,
    },
    /// `BM_DYN_STATE`
    BmDynState {
        /// Module number.
        mnum: u8,
        /// Detected loco address.
        addr: u16,
        /// Dynamic state variable number.
        dyn_num: u8,
        /// Value.
        value: u8,
    },

    // --- booster (upstream) ---
    /// `BOOST_STAT`
    BoostStat {
        /// Raw booster state.
        state: u8,
    },
    /// `BOOST_DIAGNOSTIC`
    BoostDiagnostic {
        /// `(enum, value)` diagnostic entries.
        entries: Vec<(u8, u8)>,
    },

    // --- accessory control (upstream) ---
    /// `ACCESSORY_STATE`
    AccessoryState {
        /// Accessory number.
        anum: u8,
        /// Current aspect.
        aspect: u8,
        /// Total aspects supported.
        total: u8,
        /// Currently executing aspect, if mid-transition.
        execute: u8,
        /// Remaining wait time.
        wait: u8,
        /// Optional trailing detail bytes.
        details: Vec<u8>,
    },
    /// `ACCESSORY_PARA`
    AccessoryPara {
        /// Accessory number.
        anum: u8,
        /// Parameter number.
        para_num: u8,
        /// Parameter data.
        data: Vec<u8>,
    },
    /// `ACCESSORY_NOTIFY`
    AccessoryNotify {
        /// Accessory number.
        anum: u8,
        /// Current aspect.
        aspect: u8,
        /// Total aspects supported.
        total: u8,
        /// Currently executing aspect, if mid-transition.
        execute: u8,
        /// Remaining wait time.
        wait: u8,
        /// Optional trailing detail bytes.
        details: Vec<u8>,
    },

    // --- command station upstream ---
    /// `CS_STATE`
    CsState {
        /// Raw wire state (use [`crate::constants::CsState::from_u8`]).
        state: u8,
    },
    /// `CS_DRIVE_ACK`
    CsDriveAck {
        /// Loco address acknowledged.
        addr: u16,
        /// Acknowledgement code.
        ack: u8,
    },
    /// `CS_ACCESSORY_ACK`
    CsAccessoryAck {
        /// Accessory address acknowledged.
        addr: u16,
        /// Acknowledgement code.
        ack: u8,
    },
    /// `CS_POM_ACK`
    CsPomAck {
        /// Loco/accessory address.
        addr: u16,
        /// Extended address.
        addrx: u16,
        /// Echoed message id.
        mid: u8,
        /// Acknowledgement code.
        ack: u8,
    },
    /// `CS_DRIVE_MANUAL`
    CsDriveManual(CsDriveOptions),
    /// `CS_ACCESSORY_MANUAL`
    CsAccessoryManual {
        /// Accessory address.
        addr: u16,
        /// Acknowledgement code.
        ack: u8,
    },
    /// `CS_PROG_STATE`
    CsProgState {
        /// Raw programming state.
        state: u8,
        /// Elapsed time indicator.
        time: u8,
        /// Wire CV value (host CV minus one).
        cv: u16,
        /// Read/verified data.
        data: u8,
    },

    /// Any message kind not covered above, carried verbatim so the caller
    /// can at least see it in logs rather than lose it to a parse error.
    Unknown {
        /// Raw message type byte.
        kind: u8,
        /// Raw payload bytes.
        data: Vec<u8>,
    },
}

impl Message {
    /// The wire type byte for this message.
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::SysGetMagic => 0x01,
            Self::SysGetPVersion => 0x02,
            Self::SysEnable => 0x03,
            Self::SysDisable => 0x04,
            Self::SysGetUniqueId => 0x05,
            Self::SysGetSwVersion => 0x06,
            Self::SysPing { .. } => 0x07,
            Self::SysIdentify { .. } => 0x08,
            Self::SysReset => 0x09,
            Self::GetPktCapacity => 0x0A,
            Self::NodeTabGetAll => 0x0B,
            Self::NodeTabGetNext => 0x0C,
            Self::NodeChangedAck { .. } => 0x0D,
            Self::SysGetError => 0x0E,
            Self::FeatureGetAll { .. } => 0x10,
            Self::FeatureGetNext => 0x11,
            Self::FeatureGet { .. } => 0x12,
            Self::FeatureSet { .. } => 0x13,
            Self::VendorEnable { .. } => 0x14,
            Self::VendorDisable => 0x15,
            Self::VendorSet { .. } => 0x16,
            Self::VendorGet { .. } => 0x17,
            Self::SysClock { .. } => 0x18,
            Self::BmGetRange { .. } => 0x20,
            Self::BmGetConfidence => 0x25,
            Self::BoostOff { .. } => 0x30,
            Self::BoostOn { .. } => 0x31,
            Self::BoostQuery => 0x32,
            Self::AccessorySet { .. } => 0x38,
            Self::AccessoryGet { .. } => 0x39,
            Self::CsSetState { .. } => 0x62,
            Self::CsDrive(_) => 0x64,
            Self::CsAccessory { .. } => 0x65,
            Self::CsPom(_) => 0x67,
            Self::CsProg(_) => 0x6F,
            Self::SysMagic { .. } => 0x81,
            Self::SysPong { .. } => 0x82,
            Self::SysPVersion { .. } => 0x83,
            Self::SysUniqueId { .. } => 0x84,
            Self::SysSwVersion { .. } => 0x85,
            Self::SysError { .. } => 0x86,
            Self::SysIdentifyState { .. } => 0x87,
            Self::NodeTabCount { .. } => 0x88,
            Self::NodeTab { .. } => 0x89,
            Self::PktCapacity { .. } => 0x8A,
            Self::NodeNa { .. } => 0x8B,
            Self::NodeLost { .. } => 0x8C,
            Self::NodeNew { .. } => 0x8D,
            Self::Stall { .. } => 0x8E,
            Self::Feature { .. } => 0x90,
            Self::FeatureNa { .. } => 0x91,
            Self::FeatureCount { .. } => 0x92,
            Self::Vendor { .. } => 0x93,
            Self::VendorAck { .. } => 0x94,
            Self::BmOcc { .. } => 0xA0,
            Self::BmFree { .. } => 0xA1,
            Self::BmMultiple { .. } => 0xA2,
            Self::BmAddress { .. } => 0xA3,
            Self::BmCv { .. } => 0xA5,
            Self::BmSpeed { .. } => 0xA6,
            Self::BmCurrent { .. } => 0xA7,
            Self::BmConfidence { .. } => 0xA9,
            Self::BmDynState { .. } => 0xAA,
            Self::BoostStat { .. } => 0xB0,
            Self::BoostDiagnostic { .. } => 0xB2,
            Self::AccessoryState { .. } => 0xB8,
            Self::AccessoryPara { .. } => 0xB9,
            Self::AccessoryNotify { .. } => 0xBA,
            Self::CsState { .. } => 0xE1,
            Self::CsDriveAck { .. } => 0xE2,
            Self::CsAccessoryAck { .. } => 0xE3,
            Self::CsPomAck { .. } => 0xE4,
            Self::CsDriveManual(_) => 0xE5,
            Self::CsAccessoryManual { .. } => 0xE7,
            Self::CsProgState { .. } => 0xEF,
            Self::Unknown { kind, .. } => *kind,
        }
    }

    /// `true` if this kind's high bit marks it as node-to-host (upstream).
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        self.kind() & 0x80 != 0
    }

    /// Encodes the payload bytes (not including type byte, address, or
    /// sequence number).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::SysGetMagic
            | Self::SysGetPVersion
            | Self::SysEnable
            | Self::SysDisable
            | Self::SysGetUniqueId
            | Self::SysGetSwVersion
            | Self::SysReset
            | Self::GetPktCapacity
            | Self::NodeTabGetAll
            | Self::NodeTabGetNext
            | Self::SysGetError
            | Self::FeatureGetNext
            | Self::VendorDisable
            | Self::BmGetConfidence
            | Self::BoostQuery => {},
            Self::SysPing { dat } | Self::SysPong { dat } => out.push(*dat),
            Self::SysIdentify { id_state } => out.push(*id_state),
            Self::NodeChangedAck { version } => out.push(*version),
            Self::SysClock { tcode } => out.extend_from_slice(tcode),
            Self::FeatureGetAll { streaming } => out.push(u8::from(*streaming)),
            Self::FeatureGet { id } | Self::FeatureNa { id } => out.push(*id),
            Self::FeatureSet { id, value } | Self::Feature { id, value } => {
                out.push(*id);
                out.push(*value);
            },
            Self::VendorEnable { uid } => out.extend_from_slice(&uid.to_bytes()),
            Self::VendorSet { name, value } | Self::Vendor { name, value } => {
                write_lv_string(&mut out, name);
                write_lv_string(&mut out, value);
            },
            Self::VendorGet { name } => write_lv_string(&mut out, name),
            Self::BmGetRange { start, end } => {
                out.push(*start);
                out.push(*end);
            },
            Self::BoostOff { unicast } | Self::BoostOn { unicast } => out.push(*unicast),
            Self::AccessorySet { anum, aspect } => {
                out.push(*anum);
                out.push(*aspect);
            },
            Self::AccessoryGet { anum } | Self::NodeNa { node: anum } => out.push(*anum),
            Self::CsSetState { state } | Self::CsState { state } | Self::BoostStat { state } => {
                out.push(*state);
            },
            Self::CsDrive(opts) | Self::CsDriveManual(opts) => opts.encode(&mut out),
            Self::CsAccessory { addr, aspect, time } => {
                write_u16_le(&mut out, *addr);
                out.push(*aspect);
                write_u16_le(&mut out, *time);
            },
            Self::CsPom(opts) => opts.encode(&mut out),
            Self::CsProg(opts) => opts.encode(&mut out),
            Self::SysMagic { magic } => write_u16_le(&mut out, *magic),
            Self::SysPVersion { version } => write_u16_le(&mut out, *version),
            Self::SysUniqueId { uid, fingerprint } => {
                out.extend_from_slice(&uid.to_bytes());
                if let Some(fp) = fingerprint {
                    out.extend_from_slice(&fp.to_le_bytes());
                }
            },
            Self::SysSwVersion { versions } => {
                for (patch, minor, major) in versions {
                    out.push(*patch);
                    out.push(*minor);
                    out.push(*major);
                }
            },
            Self::SysError { code, detail } => {
                out.push(*code);
                out.extend_from_slice(detail);
            },
            Self::SysIdentifyState { state } => out.push(*state),
            Self::NodeTabCount { length } => out.push(*length),
            Self::NodeTab { version, local, uid } => {
                out.push(*version);
                out.push(*local);
                out.extend_from_slice(&uid.to_bytes());
            },
            Self::PktCapacity { capacity } => out.push(*capacity),
            Self::NodeLost { node_addr, uid } => {
                out.push(*node_addr);
                out.extend_from_slice(&uid.to_bytes());
            },
            Self::NodeNew { version, node_addr, uid } => {
                out.push(*version);
                out.push(*node_addr);
                out.extend_from_slice(&uid.to_bytes());
            },
            Self::Stall { state } => out.push(*state),
            Self::FeatureCount { count, streaming } => {
                out.push(*count);
                out.push(u8::from(*streaming));
            },
            Self::VendorAck { mode } => out.push(*mode),
            Self::BmOcc { mnum, timestamp } => {
                out.push(*mnum);
                if let Some(ts) = timestamp {
                    write_u16_le(&mut out, *ts);
                }
            },
            Self::BmFree { mnum } => out.push(*mnum),
            Self::BmMultiple { base, data } => {
                out.push(*base);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            },
            Self::BmAddress { mnum, addr } => {
                out.push(*mnum);
                if let Some(a) = addr {
                    write_u16_le(&mut out, *a);
                }
            },
            Self::BmCv { addr, cv, data } => {
                write_u16_le(&mut out, *addr);
                write_u16_le(&mut out, *cv);
                out.push(*data);
            },
            Self::BmSpeed { addr, speed } => {
                write_u16_le(&mut out, *addr);
                write_u16_le(&mut out, *speed);
            },
            Self::BmCurrent { mnum, current } => {
                out.push(*mnum);
                out.push(*current);
            },
            Self::BmConfidence { void, freeze, nosignal } => {
                out.push(*void);
                out.push(*freeze);
                out.push(*nosignal);
            },
            Self::BmDynState { mnum, addr, dyn_num, value } => {
                out.push(*mnum);
                write_u16_le(&mut out, *addr);
                out.push(*dyn_num);
                out.push(*value);
            },
            Self::BoostDiagnostic { entries } => {
                for (e, v) in entries {
                    out.push(*e);
                    out.push(*v);
                }
            },
            Self::AccessoryState { anum, aspect, total, execute, wait, details }
            | Self::AccessoryNotify { anum, aspect, total, execute, wait, details } => {
                out.push(*anum);
                out.push(*aspect);
                out.push(*total);
                out.push(*execute);
                out.push(*wait);
                out.extend_from_slice(details);
            },
            Self::AccessoryPara { anum, para_num, data } => {
                out.push(*anum);
                out.push(*para_num);
                out.extend_from_slice(data);
            },
            Self::CsDriveAck { addr, ack }
            | Self::CsAccessoryAck { addr, ack }
            | Self::CsAccessoryManual { addr, ack } => {
                write_u16_le(&mut out, *addr);
                out.push(*ack);
            },
            Self::CsPomAck { addr, addrx, mid, ack } => {
                write_u16_le(&mut out, *addr);
                write_u16_le(&mut out, *addrx);
                out.push(*mid);
                out.push(*ack);
            },
            Self::CsProgState { state, time, cv, data } => {
                out.push(*state);
                out.push(*time);
                write_u16_le(&mut out, *cv);
                out.push(*data);
            },
            Self::Unknown { data, .. } => out.extend_from_slice(data),
        }
        out
    }

    /// Decodes a message payload given its type byte.
    pub fn decode(kind: u8, data: &[u8]) -> Result<Self, ProtoError> {
        let shape_err = |detail: &'static str| ProtoError::ParseShape { kind, detail };
        Ok(match kind {
            0x01 => Self::SysGetMagic,
            0x02 => Self::SysGetPVersion,
            0x03 => Self::SysEnable,
            0x04 => Self::SysDisable,
            0x05 => Self::SysGetUniqueId,
            0x06 => Self::SysGetSwVersion,
            0x07 => Self::SysPing { dat: *data.first().ok_or_else(|| shape_err("missing dat"))? },
            0x08 => Self::SysIdentify {
                id_state: *data.first().ok_or_else(|| shape_err("missing id_state"))?,
            },
            0x09 => Self::SysReset,
            0x0A => Self::GetPktCapacity,
            0x0B => Self::NodeTabGetAll,
            0x0C => Self::NodeTabGetNext,
            0x0D => Self::NodeChangedAck {
                version: *data.first().ok_or_else(|| shape_err("missing version"))?,
            },
            0x0E => Self::SysGetError,
            0x10 => Self::FeatureGetAll {
                streaming: data.first().copied().unwrap_or(0) != 0,
            },
            0x11 => Self::FeatureGetNext,
            0x12 => Self::FeatureGet { id: *data.first().ok_or_else(|| shape_err("missing id"))? },
            0x13 => {
                if data.len() != 2 {
                    return Err(shape_err("FEATURE_SET needs id+value"));
                }
                Self::FeatureSet { id: data[0], value: data[1] }
            },
            0x14 => {
                if data.len() != 7 {
                    return Err(shape_err("VENDOR_ENABLE needs a 7-byte unique id"));
                }
                let mut raw = [0u8; 7];
                raw.copy_from_slice(data);
                Self::VendorEnable { uid: UniqueId::from_bytes(raw) }
            },
            0x15 => Self::VendorDisable,
            0x16 => {
                let (name, consumed) = read_lv_string(data)?;
                let (value, _) = read_lv_string(&data[consumed..])?;
                Self::VendorSet { name, value }
            },
            0x17 => Self::VendorGet { name: read_lv_string(data)?.0 },
            0x18 => {
                if data.len() != 4 {
                    return Err(shape_err("SYS_CLOCK needs 4 bytes"));
                }
                Self::SysClock { tcode: [data[0], data[1], data[2], data[3]] }
            },
            0x20 => {
                if data.len() != 2 {
                    return Err(shape_err("BM_GET_RANGE needs start+end"));
                }
                Self::BmGetRange { start: data[0], end: data[1] }
            },
            0x25 => Self::BmGetConfidence,
            0x30 => {
                Self::BoostOff { unicast: data.first().copied().unwrap_or(0) }
            },
            0x31 => Self::BoostOn { unicast: data.first().copied().unwrap_or(0) },
            0x32 => Self::BoostQuery,
            0x38 => {
                if data.len() != 2 {
                    return Err(shape_err("ACCESSORY_SET needs anum+aspect"));
                }
                Self::AccessorySet { anum: data[0], aspect: data[1] }
            },
            0x39 => Self::AccessoryGet {
                anum: *data.first().ok_or_else(|| shape_err("missing anum"))?,
            },
            0x62 => Self::CsSetState {
                state: *data.first().ok_or_else(|| shape_err("missing state"))?,
            },
            0x64 => Self::CsDrive(CsDriveOptions::decode(kind, data)?),
            0x65 => {
                if data.len() != 5 {
                    return Err(shape_err("CS_ACCESSORY needs 5 bytes"));
                }
                Self::CsAccessory {
                    addr: read_u16_le(&data[0..2]),
                    aspect: data[2],
                    time: read_u16_le(&data[3..5]),
                }
            },
            0x67 => Self::CsPom(CsPomOptions::decode(kind, data)?),
            0x6F => Self::CsProg(CsProgOptions::decode(kind, data)?),
            0x81 => {
                if data.len() != 2 {
                    return Err(shape_err("SYS_MAGIC needs 2 bytes"));
                }
                Self::SysMagic { magic: read_u16_le(data) }
            },
            0x82 => Self::SysPong { dat: *data.first().ok_or_else(|| shape_err("missing dat"))? },
            0x83 => {
                if data.len() != 2 {
                    return Err(shape_err("SYS_P_VERSION needs 2 bytes"));
                }
                Self::SysPVersion { version: read_u16_le(data) }
            },
            0x84 => {
                if data.len() != 7 && data.len() != 11 {
                    return Err(shape_err("SYS_UNIQUE_ID needs 7 or 11 bytes"));
                }
                let mut raw = [0u8; 7];
                raw.copy_from_slice(&data[..7]);
                let fingerprint = if data.len() == 11 {
                    Some(u32::from_le_bytes([data[7], data[8], data[9], data[10]]))
                } else {
                    None
                };
                Self::SysUniqueId { uid: UniqueId::from_bytes(raw), fingerprint }
            },
            0x85 => {
                if data.is_empty() || data.len() % 3 != 0 || data.len() > 48 {
                    return Err(shape_err("SYS_SW_VERSION needs 1-16 3-byte triples"));
                }
                let versions =
                    data.chunks_exact(3).map(|c| (c[0], c[1], c[2])).collect();
                Self::SysSwVersion { versions }
            },
            0x86 => {
                let code = *data.first().ok_or_else(|| shape_err("missing code"))?;
                Self::SysError { code, detail: data[1..].to_vec() }
            },
            0x87 => Self::SysIdentifyState {
                state: *data.first().ok_or_else(|| shape_err("missing state"))?,
            },
            0x88 => Self::NodeTabCount {
                length: *data.first().ok_or_else(|| shape_err("missing length"))?,
            },
            0x89 => {
                if data.len() != 9 {
                    return Err(shape_err("NODETAB needs 9 bytes"));
                }
                let mut raw = [0u8; 7];
                raw.copy_from_slice(&data[2..9]);
                Self::NodeTab { version: data[0], local: data[1], uid: UniqueId::from_bytes(raw) }
            },
            0x8A => Self::PktCapacity {
                capacity: *data.first().ok_or_else(|| shape_err("missing capacity"))?,
            },
            0x8B => {
                Self::NodeNa { node: *data.first().ok_or_else(|| shape_err("missing node"))? }
            },
            0x8C => {
                if data.len() != 8 {
                    return Err(shape_err("NODE_LOST needs 8 bytes"));
                }
                let mut raw = [0u8; 7];
                raw.copy_from_slice(&data[1..8]);
                Self::NodeLost { node_addr: data[0], uid: UniqueId::from_bytes(raw) }
            },
            0x8D => {
                if data.len() != 9 {
                    return Err(shape_err("NODE_NEW needs 9 bytes"));
                }
                let mut raw = [0u8; 7];
                raw.copy_from_slice(&data[2..9]);
                Self::NodeNew {
                    version: data[0],
                    node_addr: data[1],
                    uid: UniqueId::from_bytes(raw),
                }
            },
            0x8E => Self::Stall { state: *data.first().ok_or_else(|| shape_err("missing state"))? },
            0x90 => {
                if data.len() != 2 {
                    return Err(shape_err("FEATURE needs id+value"));
                }
                Self::Feature { id: data[0], value: data[1] }
            },
            0x91 => {
                Self::FeatureNa { id: *data.first().ok_or_else(|| shape_err("missing id"))? }
            },
            0x92 => {
                if data.is_empty() {
                    return Err(shape_err("FEATURE_COUNT needs count"));
                }
                Self::FeatureCount {
                    count: data[0],
                    streaming: data.get(1).copied().unwrap_or(0) != 0,
                }
            },
            0x93 => {
                let (name, consumed) = read_lv_string(data)?;
                let (value, _) = read_lv_string(&data[consumed..])?;
                Self::Vendor { name, value }
            },
            0x94 => {
                Self::VendorAck { mode: *data.first().ok_or_else(|| shape_err("missing mode"))? }
            },
            0xA0 => {
                let mnum = *data.first().ok_or_else(|| shape_err("missing mnum"))?;
                let timestamp = if data.len() >= 3 { Some(read_u16_le(&data[1..3])) } else { None };
                Self::BmOcc { mnum, timestamp }
            },
            0xA1 => Self::BmFree { mnum: *data.first().ok_or_else(|| shape_err("missing mnum"))? },
            0xA2 => {
                let base = *data.first().ok_or_else(|| shape_err("missing base"))?;
                let size = *data.get(1).ok_or_else(|| shape_err("missing size"))? as usize;
                let bitmap =
                    data.get(2..2 + size).ok_or_else(|| shape_err("truncated bitmap"))?;
                Self::BmMultiple { base, data: bitmap.to_vec() }
            },
            0xA3 => {
                let mnum = *data.first().ok_or_else(|| shape_err("missing mnum"))?;
                let addr = if data.len() >= 3 { Some(read_u16_le(&data[1..3])) } else { None };
                Self::BmAddress { mnum, addr }
            },
            0xA5 => {
                if data.len() != 5 {
                    return Err(shape_err("BM_CV needs 5 bytes"));
                }
                Self::BmCv {
                    addr: read_u16_le(&data[0..2]),
                    cv: read_u16_le(&data[2..4]),
                    data: data[4],
                }
            },
            0xA6 => {
                if data.len() != 4 {
                    return Err(shape_err("BM_SPEED needs 4 bytes"));
                }
                Self::BmSpeed { addr: read_u16_le(&data[0..2]), speed: read_u16_le(&data[2..4]) }
            },
            0xA7 => {
                if data.len() != 2 {
                    return Err(shape_err("BM_CURRENT needs 2 bytes"));
                }
                Self::BmCurrent { mnum: data[0], current: data[1] }
            },
            0xA9 => {
                if data.len() != 3 {
                    return Err(shape_err("BM_CONFIDENCE needs 3 bytes"));
                }
                Self::BmConfidence { void: data[0], freeze: data[1], nosignal: data[2] }
            },
            0xAA => {
                if data.len() != 5 {
                    return Err(shape_err("BM_DYN_STATE needs 5 bytes"));
                }
                Self::BmDynState {
                    mnum: data[0],
                    addr: read_u16_le(&data[1..3]),
                    dyn_num: data[3],
                    value: data[4],
                }
            },
            0xB0 => Self::BoostStat {
                state: *data.first().ok_or_else(|| shape_err("missing state"))?,
            },
            0xB2 => {
                if data.len() % 2 != 0 {
                    return Err(shape_err("BOOST_DIAGNOSTIC entries must be pairs"));
                }
                Self::BoostDiagnostic {
                    entries: data.chunks_exact(2).map(|c| (c[0], c[1])).collect(),
                }
            },
            0xB8 | 0xBA => {
                if data.len() < 5 {
                    return Err(shape_err("ACCESSORY_STATE/NOTIFY needs at least 5 bytes"));
                }
                let fields = (data[0], data[1], data[2], data[3], data[4], data[5..].to_vec());
                if kind == 0xB8 {
                    Self::AccessoryState {
                        anum: fields.0,
                        aspect: fields.1,
                        total: fields.2,
                        execute: fields.3,
                        wait: fields.4,
                        details: fields.5,
                    }
                } else {
                    Self::AccessoryNotify {
                        anum: fields.0,
                        aspect: fields.1,
                        total: fields.2,
                        execute: fields.3,
                        wait: fields.4,
                        details: fields.5,
                    }
                }
            },
            0xB9 => {
                if data.len() < 2 {
                    return Err(shape_err("ACCESSORY_PARA needs at least 2 bytes"));
                }
                Self::AccessoryPara { anum: data[0], para_num: data[1], data: data[2..].to_vec() }
            },
            0xE1 => {
                Self::CsState { state: *data.first().ok_or_else(|| shape_err("missing state"))? }
            },
            0xE2 => {
                if data.len() != 3 {
                    return Err(shape_err("CS_DRIVE_ACK needs 3 bytes"));
                }
                Self::CsDriveAck { addr: read_u16_le(&data[0..2]), ack: data[2] }
            },
            0xE3 => {
                if data.len() != 3 {
                    return Err(shape_err("CS_ACCESSORY_ACK needs 3 bytes"));
                }
                Self::CsAccessoryAck { addr: read_u16_le(&data[0..2]), ack: data[2] }
            },
            0xE4 => {
                if data.len() != 6 {
                    return Err(shape_err("CS_POM_ACK needs 6 bytes"));
                }
                Self::CsPomAck {
                    addr: read_u16_le(&data[0..2]),
                    addrx: read_u16_le(&data[2..4]),
                    mid: data[4],
                    ack: data[5],
                }
            },
            0xE5 => Self::CsDriveManual(CsDriveOptions::decode(kind, data)?),
            0xE7 => {
                if data.len() != 3 {
                    return Err(shape_err("CS_ACCESSORY_MANUAL needs 3 bytes"));
                }
                Self::CsAccessoryManual { addr: read_u16_le(&data[0..2]), ack: data[2] }
            },
            0xEF => {
                if data.len() != 5 {
                    return Err(shape_err("CS_PROG_STATE needs 5 bytes"));
                }
                Self::CsProgState {
                    state: data[0],
                    time: data[1],
                    cv: read_u16_le(&data[2..4]),
                    data: data[4],
                }
            },
            other => {
                tracing::warn!(kind = format!("{other:#04x}"), "unrecognized message kind, carrying as Unknown");
                Self::Unknown { kind: other, data: data.to_vec() }
            },
        })
    }
}

/// A fully parsed message: its target/source address, sequence number, and
/// decoded kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// Hierarchical node address.
    pub addr: Address,
    /// Sequence number this message was sent/received with.
    pub seq: SequenceNumber,
    /// Decoded payload.
    pub message: Message,
}

/// Parses one message envelope from the start of `data` (as found inside a
/// frame's unescaped payload). Returns the parsed message and the number of
/// bytes consumed, so callers can loop over multiple concatenated messages.
pub fn parse_one(data: &[u8]) -> Result<(ParsedMessage, usize), ProtoError> {
    let len = *data.first().ok_or(ProtoError::FrameShape)? as usize;
    let total = len + 1;
    let body = data.get(1..total).ok_or(ProtoError::FrameShape)?;

    let (addr, addr_len) = Address::parse(body)?;
    let rest = &body[addr_len..];
    let seq = *rest.first().ok_or(ProtoError::FrameShape)?;
    let kind = *rest.get(1).ok_or(ProtoError::FrameShape)?;
    let payload = &rest[2..];

    let message = Message::decode(kind, payload)?;
    Ok((ParsedMessage { addr, seq: SequenceNumber::from(seq), message }, total))
}

/// Iterates every message envelope packed into a frame's payload.
pub fn parse_all(data: &[u8]) -> Result<Vec<ParsedMessage>, ProtoError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (msg, consumed) = parse_one(&data[offset..])?;
        out.push(msg);
        offset += consumed;
    }
    Ok(out)
}

/// Encodes one message envelope (`len addr seq type data`).
#[must_use]
pub fn encode_one(addr: &Address, seq: SequenceNumber, message: &Message) -> Vec<u8> {
    let mut body = Vec::new();
    addr.write_wire(&mut body);
    body.push(seq.value());
    body.push(message.kind());
    body.extend_from_slice(&message.encode_payload());

    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(body.len() as u8);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: Address, seq: SequenceNumber, msg: Message) {
        let bytes = encode_one(&addr, seq, &msg);
        let (parsed, consumed) = parse_one(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.addr, addr);
        assert_eq!(parsed.seq, seq);
        assert_eq!(parsed.message, msg);
    }

    #[test]
    fn p1_round_trip_simple_kinds() {
        round_trip(Address::INTERFACE, SequenceNumber::from(1), Message::SysGetMagic);
        round_trip(Address::INTERFACE, SequenceNumber::from(2), Message::SysReset);
        round_trip(
            Address::new(&[1]).unwrap(),
            SequenceNumber::from(3),
            Message::SysPing { dat: 7 },
        );
        round_trip(
            Address::INTERFACE,
            SequenceNumber::from(4),
            Message::FeatureSet { id: 10, value: 20 },
        );
    }

    #[test]
    fn p1_round_trip_unique_id_kinds() {
        let uid = UniqueId::from_bytes([0x90, 0, 0x0D, 0x01, 0x02, 0x03, 0x04]);
        round_trip(
            Address::INTERFACE,
            SequenceNumber::from(1),
            Message::SysUniqueId { uid, fingerprint: None },
        );
        round_trip(
            Address::INTERFACE,
            SequenceNumber::from(1),
            Message::SysUniqueId { uid, fingerprint: Some(0xDEAD_BEEF) },
        );
        round_trip(
            Address::new(&[2]).unwrap(),
            SequenceNumber::from(5),
            Message::NodeTab { version: 1, local: 1, uid },
        );
    }

    #[test]
    fn p1_round_trip_cs_drive() {
        let opts = CsDriveOptions {
            addr: 3,
            format: 3,
            active_bits: 0b0001_1111,
            speed: 0x80 | 50,
            f4_f0: 0b0001_0101,
            f12_f5: 0,
            f20_f13: 0,
            f28_f21: 0,
        };
        assert!(opts.light());
        assert!(opts.forward());
        round_trip(Address::new(&[1]).unwrap(), SequenceNumber::from(9), Message::CsDrive(opts));
    }

    #[test]
    fn p1_round_trip_cs_pom_cv_offset() {
        // host cv=1 => wire cv=0
        let opts = CsPomOptions {
            addr: 3,
            addrx: 0,
            mid: 1,
            op: 1,
            cv: 0,
            cvx: 0,
            data: [0, 0, 0, 0],
        };
        round_trip(Address::new(&[1]).unwrap(), SequenceNumber::from(1), Message::CsPom(opts));
    }

    #[test]
    fn scenario_3_feature_inventory_roundtrip() {
        round_trip(
            Address::INTERFACE,
            SequenceNumber::from(1),
            Message::FeatureCount { count: 3, streaming: false },
        );
        round_trip(
            Address::INTERFACE,
            SequenceNumber::from(2),
            Message::Feature { id: 1, value: 5 },
        );
        round_trip(Address::INTERFACE, SequenceNumber::from(3), Message::FeatureNa { id: 255 });
    }

    #[test]
    fn scenario_4_bm_cv_forwards_with_cv_plus_one() {
        round_trip(
            Address::new(&[1]).unwrap(),
            SequenceNumber::from(1),
            Message::BmCv { addr: 3, cv: 0, data: 42 },
        );
    }

    #[test]
    fn unknown_kind_does_not_error() {
        let parsed = Message::decode(0x40, &[1, 2, 3]).unwrap();
        assert_eq!(parsed, Message::Unknown { kind: 0x40, data: vec![1, 2, 3] });
    }

    #[test]
    fn parse_all_splits_concatenated_messages() {
        let m1 = encode_one(&Address::INTERFACE, SequenceNumber::from(1), &Message::SysGetMagic);
        let m2 = encode_one(&Address::INTERFACE, SequenceNumber::from(2), &Message::SysReset);
        let mut both = m1.clone();
        both.extend_from_slice(&m2);
        let parsed = parse_all(&both).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].message, Message::SysGetMagic);
        assert_eq!(parsed[1].message, Message::SysReset);
    }
}
