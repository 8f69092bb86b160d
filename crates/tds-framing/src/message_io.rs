//! Message-level IO engine.
//!
//! [`MessageIo`] converts between logical TDS messages and wire bytes.
//! Outbound payloads are chunked into packets no larger than the
//! negotiated packet size; inbound bytes are reassembled and surfaced as
//! [`IoEvent::Data`] per packet with an [`IoEvent::Message`] marker after
//! the end-of-message packet.
//!
//! The engine also owns the transport's encryption mode. While the
//! pre-login TLS handshake runs, ciphertext produced by the
//! [`TlsEngine`] is wrapped in PRELOGIN-typed packets and inbound
//! PRELOGIN payloads are fed back into the engine by the connection;
//! plaintext messages sent in that window (the LOGIN7 request) are held
//! back and released through the engine the moment
//! [`encrypt_all_future_traffic`](MessageIo::encrypt_all_future_traffic)
//! switches the session over.

use bytes::{Bytes, BytesMut};
use tds_tls::TlsEngine;
use tds_wire::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};

use crate::error::FramingError;
use crate::packet_codec::{Packet, TdsCodec};
use tokio_util::codec::{Decoder, Encoder};

/// Events produced while consuming inbound bytes.
#[derive(Debug, Clone)]
pub enum IoEvent {
    /// Payload of one inbound packet.
    Data(Bytes),
    /// The previous [`IoEvent::Data`] completed a message.
    Message,
}

enum Transport {
    /// Cleartext session.
    Plain,
    /// TLS handshake in progress; outbound plaintext is deferred.
    Negotiating {
        engine: TlsEngine,
        deferred: BytesMut,
    },
    /// All traffic flows through the TLS engine.
    Encrypted { engine: TlsEngine },
}

/// Sans-io message framing engine.
pub struct MessageIo {
    codec: TdsCodec,
    inbound: BytesMut,
    outbound: BytesMut,
    packet_size: usize,
    reset_pending: bool,
    transport: Transport,
}

impl MessageIo {
    /// Create an engine with the given outbound packet size.
    #[must_use]
    pub fn new(packet_size: usize) -> Self {
        Self {
            codec: TdsCodec::new(),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            packet_size,
            reset_pending: false,
            transport: Transport::Plain,
        }
    }

    /// Current outbound packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Adopt a renegotiated packet size.
    pub fn set_packet_size(&mut self, size: usize) {
        tracing::debug!(from = self.packet_size, to = size, "packet size changed");
        self.packet_size = size;
    }

    /// Arm the reset-connection bit for the next outbound message.
    ///
    /// The bit rides on the first packet of that message only and clears
    /// itself afterwards.
    pub fn queue_reset_connection(&mut self) {
        self.reset_pending = true;
    }

    /// Queue a logical message for sending.
    pub fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), FramingError> {
        let reset = std::mem::take(&mut self.reset_pending);

        let mut frames = BytesMut::new();
        encode_message(
            &mut self.codec,
            self.packet_size,
            packet_type,
            payload,
            reset,
            &mut frames,
        )?;

        match &mut self.transport {
            Transport::Plain => self.outbound.extend_from_slice(&frames),
            Transport::Negotiating { deferred, .. } => deferred.extend_from_slice(&frames),
            Transport::Encrypted { engine } => {
                engine.write_plaintext(&frames)?;
                self.outbound.extend_from_slice(&engine.take_ciphertext()?);
            }
        }
        Ok(())
    }

    /// Begin tunneling a TLS handshake through PRELOGIN packets.
    ///
    /// The engine's first flight is wrapped and queued immediately.
    pub fn tls_negotiation_starting(&mut self, mut engine: TlsEngine) -> Result<(), FramingError> {
        tracing::debug!("TLS negotiation starting");
        let first_flight = engine.take_ciphertext()?;
        encode_message(
            &mut self.codec,
            self.packet_size,
            PacketType::Prelogin,
            &first_flight,
            false,
            &mut self.outbound,
        )?;
        self.transport = Transport::Negotiating {
            engine,
            deferred: BytesMut::new(),
        };
        Ok(())
    }

    /// Feed one inbound PRELOGIN payload of handshake bytes to the TLS
    /// engine; any response records are wrapped and queued.
    ///
    /// Returns `true` once the handshake has completed.
    pub fn tls_handshake_data(&mut self, bytes: &[u8]) -> Result<bool, FramingError> {
        let Transport::Negotiating { engine, .. } = &mut self.transport else {
            return Ok(false);
        };

        engine.receive_ciphertext(bytes)?;
        let response = engine.take_ciphertext()?;
        let complete = !engine.is_handshaking();

        if !response.is_empty() {
            encode_message(
                &mut self.codec,
                self.packet_size,
                PacketType::Prelogin,
                &response,
                false,
                &mut self.outbound,
            )?;
        }

        if complete {
            tracing::debug!("TLS handshake complete");
        }
        Ok(complete)
    }

    /// Switch the session to ciphertext.
    ///
    /// Messages deferred during negotiation are pushed through the engine
    /// now, unwrapped: from here on TLS records travel on the wire as-is.
    pub fn encrypt_all_future_traffic(&mut self) -> Result<(), FramingError> {
        let transport = std::mem::replace(&mut self.transport, Transport::Plain);
        let Transport::Negotiating {
            mut engine,
            deferred,
        } = transport
        else {
            self.transport = transport;
            return Ok(());
        };

        tracing::debug!(deferred = deferred.len(), "encrypting all future traffic");
        if !deferred.is_empty() {
            engine.write_plaintext(&deferred)?;
        }
        self.outbound.extend_from_slice(&engine.take_ciphertext()?);
        self.transport = Transport::Encrypted { engine };
        Ok(())
    }

    /// Consume bytes read from the socket, producing framing events.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<IoEvent>, FramingError> {
        match &mut self.transport {
            Transport::Plain | Transport::Negotiating { .. } => {
                self.inbound.extend_from_slice(bytes);
            }
            Transport::Encrypted { engine } => {
                engine.receive_ciphertext(bytes)?;
                let plaintext = engine.read_plaintext()?;
                self.inbound.extend_from_slice(&plaintext);
                // Post-handshake records (key updates, tickets) may want out.
                self.outbound.extend_from_slice(&engine.take_ciphertext()?);
            }
        }

        let mut events = Vec::new();
        while let Some(packet) = self.codec.decode(&mut self.inbound)? {
            let end_of_message = packet.is_end_of_message();
            events.push(IoEvent::Data(packet.payload));
            if end_of_message {
                events.push(IoEvent::Message);
            }
        }
        Ok(events)
    }

    /// Whether bytes are waiting to be flushed to the socket.
    #[must_use]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take everything queued for the socket.
    pub fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }
}

impl std::fmt::Debug for MessageIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = match self.transport {
            Transport::Plain => "plain",
            Transport::Negotiating { .. } => "negotiating",
            Transport::Encrypted { .. } => "encrypted",
        };
        f.debug_struct("MessageIo")
            .field("packet_size", &self.packet_size)
            .field("transport", &transport)
            .field("outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

/// Chunk `payload` into packets of at most `packet_size` bytes and encode
/// them into `dst`. The final packet carries END_OF_MESSAGE; the first
/// carries RESET_CONNECTION when requested.
fn encode_message(
    codec: &mut TdsCodec,
    packet_size: usize,
    packet_type: PacketType,
    payload: &[u8],
    reset_first: bool,
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    let max_payload = packet_size - PACKET_HEADER_SIZE;
    let mut chunks: Vec<&[u8]> = payload.chunks(max_payload).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let last = chunks.len() - 1;

    for (index, chunk) in chunks.into_iter().enumerate() {
        let mut status = if index == last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        if index == 0 && reset_first {
            status |= PacketStatus::RESET_CONNECTION;
        }

        let header = PacketHeader::new(packet_type, status, 0);
        codec.encode(Packet::new(header, Bytes::copy_from_slice(chunk)), dst)?;
    }
    Ok(())
}
