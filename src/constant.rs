//! Wire-level constants: ports, message type codes, size limits and the
//! built-in statistics ComIDs.

/// PD traffic lives on this UDP port by default (configurable per session).
pub const PD_UDP_PORT: u16 = 20548;
/// MD traffic lives on this UDP and TCP port by default (configurable per session).
pub const MD_UDP_PORT: u16 = 20550;
pub const MD_TCP_PORT: u16 = 20550;

/// Reference upper bound for a PD payload so the whole frame fits a single
/// Ethernet frame.
pub const MAX_PD_DATA_SIZE: usize = 1432;
/// MD payloads may span more than one Ethernet frame; still bounded to keep
/// `datasetLength` sane.
pub const MAX_MD_DATA_SIZE: usize = 64 * 1024;

/// High byte of the 16-bit protocol version field; only this byte
/// participates in compatibility checks.
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION: u16 = (PROTOCOL_VERSION_MAJOR as u16) << 8;

/// Two-byte ASCII message type codes, network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// Process Data
    Pd = 0x5064,
    /// Process Data, PULL reply
    Pp = 0x5070,
    /// Process Data, PULL request
    Pr = 0x5072,
    /// Process Data, error
    Pe = 0x5065,
    /// Message Data, notification (fire and forget)
    Mn = 0x4D6E,
    /// Message Data, request expecting reply
    Mr = 0x4D72,
    /// Message Data, reply without confirmation
    Mp = 0x4D70,
    /// Message Data, reply requiring confirmation
    Mq = 0x4D71,
    /// Message Data, confirmation
    Mc = 0x4D63,
    /// Message Data, error reply
    Me = 0x4D65,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<MsgType> {
        match v {
            0x5064 => Some(MsgType::Pd),
            0x5070 => Some(MsgType::Pp),
            0x5072 => Some(MsgType::Pr),
            0x5065 => Some(MsgType::Pe),
            0x4D6E => Some(MsgType::Mn),
            0x4D72 => Some(MsgType::Mr),
            0x4D70 => Some(MsgType::Mp),
            0x4D71 => Some(MsgType::Mq),
            0x4D63 => Some(MsgType::Mc),
            0x4D65 => Some(MsgType::Me),
            _ => None,
        }
    }

    pub fn is_pd(self) -> bool {
        matches!(self, MsgType::Pd | MsgType::Pp | MsgType::Pr | MsgType::Pe)
    }

    pub fn is_md(self) -> bool {
        !self.is_pd()
    }
}

/// Built-in ComID the statistics publication is served on (PULL reply).
pub const TRDP_GLOBAL_STATISTICS_COMID: u32 = 31;
/// ComID a peer sends a PULL request to in order to solicit the statistics
/// publication.
pub const TRDP_STATISTICS_REQUEST_COMID: u32 = 32;

/// header CRC is the last 4 bytes of every frame
pub const CRC_SIZE: usize = 4;

/// pad `data_size` up to the next multiple of 4 bytes.
pub const fn pad4(data_size: usize) -> usize {
    (data_size + 3) & !3
}
