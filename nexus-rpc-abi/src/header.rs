//! CONTEXT: Fixed 16-byte wire header shared by every nexus-rpc packet.
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! Layout (all multi-byte fields big-endian):
//!   byte 0        request type (u8)
//!   bytes 1..4    message size, 24 bits
//!   bytes 4..6    destination session number (u16)
//!   bytes 6..8    packet type (top 4 bits) | packet number (low 12 bits)
//!   bytes 8..16   request number (u64)

use core::fmt;

/// Size in bytes of the on-wire packet header.
pub const HEADER_LEN: usize = 16;

/// Maximum representable message size (24-bit field).
pub const MAX_MESSAGE_SIZE: u32 = (1 << 24) - 1;

/// Maximum representable packet number within a message (12-bit field).
pub const MAX_PACKET_NUM: u16 = (1 << 12) - 1;

/// The four control/data packet kinds defined by the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Request data.
    Req = 0,
    /// Response data.
    Resp = 1,
    /// Pull the next response segment.
    ReqForResp = 2,
    /// Grant credits for a multi-packet request.
    ExplicitCr = 3,
}

impl PacketType {
    fn from_bits(bits: u8) -> Result<Self, HeaderError> {
        match bits {
            0 => Ok(Self::Req),
            1 => Ok(Self::Resp),
            2 => Ok(Self::ReqForResp),
            3 => Ok(Self::ExplicitCr),
            other => Err(HeaderError::BadPacketType(other)),
        }
    }

    fn bits(self) -> u8 {
        self as u8
    }
}

/// Errors produced while encoding or decoding a [`PacketHeader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderError {
    /// Input buffer shorter than [`HEADER_LEN`].
    Truncated,
    /// `message_size` exceeds [`MAX_MESSAGE_SIZE`].
    MessageTooLarge(u32),
    /// `packet_num` exceeds [`MAX_PACKET_NUM`].
    PacketNumTooLarge(u16),
    /// The 4-bit packet-type field held an unrecognized value.
    BadPacketType(u8),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "header buffer shorter than {HEADER_LEN} bytes"),
            Self::MessageTooLarge(sz) => write!(f, "message size {sz} exceeds 24-bit field"),
            Self::PacketNumTooLarge(n) => write!(f, "packet number {n} exceeds 12-bit field"),
            Self::BadPacketType(b) => write!(f, "unrecognized packet type bits {b:#x}"),
        }
    }
}

/// A decoded packet header ("Packet Header").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub request_type: u8,
    pub message_size: u32,
    pub dest_session_num: u16,
    pub packet_type: PacketType,
    pub packet_num: u16,
    pub request_num: u64,
}

impl PacketHeader {
    /// Encodes `self` into the first [`HEADER_LEN`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) -> Result<(), HeaderError> {
        if self.message_size > MAX_MESSAGE_SIZE {
            return Err(HeaderError::MessageTooLarge(self.message_size));
        }
        if self.packet_num > MAX_PACKET_NUM {
            return Err(HeaderError::PacketNumTooLarge(self.packet_num));
        }

        out[0] = self.request_type;
        let sz = self.message_size.to_be_bytes();
        out[1..4].copy_from_slice(&sz[1..4]);
        out[4..6].copy_from_slice(&self.dest_session_num.to_be_bytes());

        let type_packet = ((self.packet_type.bits() as u16) << 12) | self.packet_num;
        out[6..8].copy_from_slice(&type_packet.to_be_bytes());
        out[8..16].copy_from_slice(&self.request_num.to_be_bytes());
        Ok(())
    }

    /// Decodes a header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated);
        }
        let request_type = buf[0];
        let message_size = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let dest_session_num = u16::from_be_bytes([buf[4], buf[5]]);
        let type_packet = u16::from_be_bytes([buf[6], buf[7]]);
        let packet_type = PacketType::from_bits((type_packet >> 12) as u8)?;
        let packet_num = type_packet & 0x0fff;
        let mut req_bytes = [0u8; 8];
        req_bytes.copy_from_slice(&buf[8..16]);
        let request_num = u64::from_be_bytes(req_bytes);

        Ok(Self {
            request_type,
            message_size,
            dest_session_num,
            packet_type,
            packet_num,
            request_num,
        })
    }
}
