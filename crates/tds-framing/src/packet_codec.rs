//! TDS packet codec.

use bytes::{BufMut, Bytes, BytesMut};
use tds_wire::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;

/// A decoded TDS packet: header plus payload.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Payload bytes, header excluded.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Whether this packet ends its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// Packet-level codec for use with `tokio-util` framing.
///
/// Encoding stamps the length field and a wrapping sequence number;
/// decoding validates the advertised length against the current limit and
/// waits for complete packets.
#[derive(Debug)]
pub struct TdsCodec {
    max_packet_size: usize,
    next_packet_id: u8,
}

impl TdsCodec {
    /// Create a codec accepting packets up to the protocol maximum.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            next_packet_id: 1,
        }
    }

    /// Restrict the accepted packet size.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(MAX_PACKET_SIZE);
    }

    /// Current packet size limit.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn take_packet_id(&mut self) -> u8 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        // Length is big-endian at bytes 2..4 of the header.
        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < PACKET_HEADER_SIZE {
            return Err(FramingError::InvalidHeader);
        }
        if length > self.max_packet_size {
            return Err(FramingError::PacketTooLarge {
                size: length,
                max: self.max_packet_size,
            });
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        let header = PacketHeader::decode(&mut frame)?;

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            eom = header.is_end_of_message(),
            "decoded packet"
        );

        Ok(Some(Packet::new(header, frame)))
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = PACKET_HEADER_SIZE + item.payload.len();
        if total > self.max_packet_size {
            return Err(FramingError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }

        let mut header = item.header;
        header.length = total as u16;
        header.packet_id = self.take_packet_id();

        dst.reserve(total);
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total,
            packet_id = header.packet_id,
            "encoded packet"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_wire::packet::{PacketStatus, PacketType};

    fn encode_one(codec: &mut TdsCodec, packet: Packet) -> BytesMut {
        let mut dst = BytesMut::new();
        codec.encode(packet, &mut dst).unwrap();
        dst
    }

    #[test]
    fn encode_then_decode() {
        let mut codec = TdsCodec::new();
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0);
        let mut wire = encode_one(&mut codec, Packet::new(header, Bytes::from_static(b"data")));

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.header.packet_type, PacketType::SqlBatch);
        assert_eq!(decoded.header.length, 12);
        assert_eq!(&decoded.payload[..], b"data");
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_packet_waits() {
        let mut codec = TdsCodec::new();
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0);
        let wire = encode_one(&mut codec, Packet::new(header, Bytes::from_static(b"data")));

        let mut partial = BytesMut::from(&wire[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&wire[10..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut codec = TdsCodec::new();
        codec.set_max_packet_size(64);
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0);
        let payload = Bytes::from(vec![0u8; 100]);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode(Packet::new(header, payload), &mut dst),
            Err(FramingError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn packet_ids_increment_and_skip_zero() {
        let mut codec = TdsCodec::new();
        codec.next_packet_id = 255;
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::NORMAL, 0);

        let first = encode_one(&mut codec, Packet::new(header, Bytes::new()));
        let second = encode_one(&mut codec, Packet::new(header, Bytes::new()));
        assert_eq!(first[6], 255);
        assert_eq!(second[6], 1);
    }

    #[test]
    fn undersized_length_is_invalid() {
        let mut codec = TdsCodec::new();
        let mut wire = BytesMut::from(&[0x04u8, 0x01, 0x00, 0x04, 0, 0, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(FramingError::InvalidHeader)
        ));
    }
}
