//! PRELOGIN negotiation payload.
//!
//! The PRELOGIN message is an option table: 5-byte entries of
//! (type, offset, length) terminated by 0xFF, followed by the option data
//! the offsets point at. The same layout is used in both directions, so
//! one type serves as builder and parser.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::TdsVersion;

const OPTION_VERSION: u8 = 0x00;
const OPTION_ENCRYPTION: u8 = 0x01;
const OPTION_INSTANCE: u8 = 0x02;
const OPTION_THREAD_ID: u8 = 0x03;
const OPTION_MARS: u8 = 0x04;
const OPTION_TERMINATOR: u8 = 0xFF;

/// Encryption negotiation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt only the login sequence.
    #[default]
    Off = 0x00,
    /// Encrypt the whole session.
    On = 0x01,
    /// Encryption is not available.
    NotSupported = 0x02,
    /// Encryption is mandatory.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Decode the wire byte; unknown values degrade to `Off`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::On,
            0x02 => Self::NotSupported,
            0x03 => Self::Required,
            _ => Self::Off,
        }
    }

    /// Whether this level commits the session to a TLS handshake.
    #[must_use]
    pub const fn requires_tls(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// A PRELOGIN message in either direction.
#[derive(Debug, Clone)]
pub struct PreloginMessage {
    /// Version field: the client sends its driver version, the server its
    /// product version. Neither side treats it as the TDS version, which
    /// is negotiated by LOGINACK.
    pub version: u32,
    /// Sub-build number accompanying the version.
    pub sub_build: u16,
    /// Encryption negotiation byte.
    pub encryption: EncryptionLevel,
    /// Named-instance validation string.
    pub instance: Option<String>,
    /// Client thread id, echoed for diagnostics.
    pub thread_id: Option<u32>,
    /// Whether MARS is requested; this driver never requests it.
    pub mars: bool,
}

impl Default for PreloginMessage {
    fn default() -> Self {
        Self {
            version: TdsVersion::V7_4.raw(),
            sub_build: 0,
            encryption: EncryptionLevel::Off,
            instance: None,
            thread_id: None,
            mars: false,
        }
    }
}

impl PreloginMessage {
    /// Start building a client PRELOGIN.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the encryption byte.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Set the instance validation string.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the client thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Encode the option table followed by the option data.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // (option byte, encoded data) pairs, emitted in option order.
        let mut options: Vec<(u8, Vec<u8>)> = Vec::with_capacity(5);

        let mut version = Vec::with_capacity(6);
        version.extend_from_slice(&self.version.to_be_bytes());
        version.extend_from_slice(&self.sub_build.to_le_bytes());
        options.push((OPTION_VERSION, version));

        options.push((OPTION_ENCRYPTION, vec![self.encryption as u8]));

        if let Some(ref instance) = self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((OPTION_INSTANCE, data));
        }

        if let Some(thread_id) = self.thread_id {
            options.push((OPTION_THREAD_ID, thread_id.to_be_bytes().to_vec()));
        }

        options.push((OPTION_MARS, vec![u8::from(self.mars)]));

        let table_len = options.len() * 5 + 1;
        let data_len: usize = options.iter().map(|(_, data)| data.len()).sum();
        let mut buf = BytesMut::with_capacity(table_len + data_len);

        let mut offset = table_len as u16;
        for (option, data) in &options {
            buf.put_u8(*option);
            buf.put_u16(offset);
            buf.put_u16(data.len() as u16);
            offset += data.len() as u16;
        }
        buf.put_u8(OPTION_TERMINATOR);

        for (_, data) in &options {
            buf.put_slice(data);
        }

        buf.freeze()
    }

    /// Decode a PRELOGIN payload.
    ///
    /// Offsets in the option table are absolute within the payload, so the
    /// whole payload must be available; the caller buffers the message
    /// before parsing.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut message = Self {
            version: 0,
            ..Self::default()
        };

        let mut table = payload;
        let mut entries = Vec::new();
        loop {
            if !table.has_remaining() {
                return Err(ProtocolError::Truncated {
                    needed: 1,
                    available: 0,
                });
            }
            let option = table.get_u8();
            if option == OPTION_TERMINATOR {
                break;
            }
            if table.remaining() < 4 {
                return Err(ProtocolError::Truncated {
                    needed: 4,
                    available: table.remaining(),
                });
            }
            let offset = table.get_u16() as usize;
            let length = table.get_u16() as usize;
            entries.push((option, offset, length));
        }

        for (option, offset, length) in entries {
            let data = payload
                .get(offset..offset + length)
                .ok_or(ProtocolError::PreloginOutOfBounds)?;

            match option {
                OPTION_VERSION if length >= 6 => {
                    message.version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    message.sub_build = u16::from_le_bytes([data[4], data[5]]);
                }
                OPTION_ENCRYPTION if length >= 1 => {
                    message.encryption = EncryptionLevel::from_u8(data[0]);
                }
                OPTION_INSTANCE if length > 0 => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    if end > 0 {
                        message.instance =
                            Some(String::from_utf8_lossy(&data[..end]).into_owned());
                    }
                }
                OPTION_THREAD_ID if length >= 4 => {
                    message.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                OPTION_MARS if length >= 1 => {
                    message.mars = data[0] != 0;
                }
                // Undersized bodies and options this driver does not
                // model (fed-auth, nonce, trace id) are skipped; the
                // option table is self-describing.
                _ => {}
            }
        }

        Ok(message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let original = PreloginMessage::new()
            .with_encryption(EncryptionLevel::On)
            .with_instance("SQLEXPRESS")
            .with_thread_id(0xBEEF);

        let decoded = PreloginMessage::decode(&original.encode()).unwrap();
        assert_eq!(decoded.version, original.version);
        assert_eq!(decoded.encryption, EncryptionLevel::On);
        assert_eq!(decoded.instance.as_deref(), Some("SQLEXPRESS"));
        assert_eq!(decoded.thread_id, Some(0xBEEF));
        assert!(!decoded.mars);
    }

    #[test]
    fn table_precedes_data() {
        let encoded = PreloginMessage::new().encode();
        assert_eq!(encoded[0], OPTION_VERSION);
        // Three options (version, encryption, mars) of 5 bytes each plus
        // the terminator.
        assert_eq!(encoded[15], OPTION_TERMINATOR);
    }

    #[test]
    fn encryption_levels() {
        assert!(EncryptionLevel::On.requires_tls());
        assert!(EncryptionLevel::Required.requires_tls());
        assert!(!EncryptionLevel::Off.requires_tls());
        assert!(!EncryptionLevel::NotSupported.requires_tls());
        assert_eq!(EncryptionLevel::from_u8(0x7F), EncryptionLevel::Off);
    }

    #[test]
    fn out_of_bounds_offset_rejected() {
        // One option pointing past the end of the payload.
        let mut payload = BytesMut::new();
        payload.put_u8(OPTION_ENCRYPTION);
        payload.put_u16(200);
        payload.put_u16(1);
        payload.put_u8(OPTION_TERMINATOR);
        assert!(matches!(
            PreloginMessage::decode(&payload),
            Err(ProtocolError::PreloginOutOfBounds)
        ));
    }
}
