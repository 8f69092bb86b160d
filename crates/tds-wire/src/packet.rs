//! TDS packet header.
//!
//! Every TDS packet starts with the same 8-byte header: type, status,
//! big-endian length (header included), SPID, sequence number, window.
//! The status byte carries the end-of-message marker that the framing
//! layer uses to delimit logical messages, and the reset-connection bit
//! a client may attach to the first packet of a request.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Size of the TDS packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest packet the protocol can express (the length field is a u16).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Packet size used until the server renegotiates it.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS message types exchanged by the connection core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call request.
    Rpc = 0x03,
    /// Server response (token stream).
    TabularResult = 0x04,
    /// Attention signal (cancel the running request).
    Attention = 0x06,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// LOGIN7 authentication request.
    Login7 = 0x10,
    /// Pre-login negotiation; also carries TLS handshake records.
    Prelogin = 0x12,
}

impl PacketType {
    /// Decode a packet type from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Login7),
            0x12 => Ok(Self::Prelogin),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

bitflags! {
    /// Status bits of the packet header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Intermediate packet; more of the same message follows.
        const NORMAL = 0x00;
        /// Final packet of a message.
        const END_OF_MESSAGE = 0x01;
        /// The event this packet belongs to should be ignored.
        const IGNORE = 0x02;
        /// Reset connection state before processing this request.
        const RESET_CONNECTION = 0x08;
        /// Reset connection state but keep the open transaction.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// The 8-byte header preceding every packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message type this packet belongs to.
    pub packet_type: PacketType,
    /// Status bits.
    pub status: PacketStatus,
    /// Total packet length, header included.
    pub length: u16,
    /// Server process id; zero on client-originated packets.
    pub spid: u16,
    /// Sequence number within the message, wrapping at 255.
    pub packet_id: u8,
    /// Unused window field, always zero.
    pub window: u8,
}

impl PacketHeader {
    /// Build a header for an outbound packet.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Decode a header from the front of `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: PACKET_HEADER_SIZE,
                available: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_bits = src.get_u8();
        let status = PacketStatus::from_bits(status_bits)
            .ok_or(ProtocolError::InvalidPacketStatus(status_bits))?;

        Ok(Self {
            packet_type,
            status,
            length: src.get_u16(),
            spid: src.get_u16(),
            packet_id: src.get_u8(),
            window: src.get_u8(),
        })
    }

    /// Encode the header into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Payload length implied by the header.
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Whether this packet terminates its message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }
}
