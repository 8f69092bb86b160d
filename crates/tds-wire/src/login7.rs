//! LOGIN7 authentication payload.
//!
//! LOGIN7 is a 94-byte fixed header followed by a data block of UTF-16LE
//! strings. The header carries (offset, length) pairs into the data block
//! for each string. The password is obfuscated on the wire (XOR 0xA5 and
//! a nibble swap); that is obfuscation only, which is why the login
//! sequence is normally wrapped in TLS.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16;
use crate::version::TdsVersion;

/// Size of the LOGIN7 fixed header.
pub const LOGIN7_HEADER_SIZE: usize = 94;

// OptionFlags1: fUseDB | fDatabase (fatal on failure) | fSetLang.
const OPTION_FLAGS_1: u8 = 0xE0;
// OptionFlags2: fLanguage (fatal on failure) | fODBC.
const OPTION_FLAGS_2: u8 = 0x03;
const TYPE_FLAGS: u8 = 0x00;
const OPTION_FLAGS_3: u8 = 0x00;

/// Builder for a LOGIN7 request.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_ver: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Client time zone offset in minutes.
    pub client_time_zone: i32,
    /// Client locale id.
    pub client_lcid: u32,
    /// Client host name.
    pub hostname: String,
    /// Login name.
    pub username: String,
    /// Password, obfuscated during encoding.
    pub password: String,
    /// Application name reported to the server.
    pub app_name: String,
    /// Server name as the client addresses it.
    pub server_name: String,
    /// Driver library name.
    pub library_name: String,
    /// Initial language; empty lets the server decide.
    pub language: String,
    /// Initial database; empty lets the server decide.
    pub database: String,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::default(),
            packet_size: crate::packet::DEFAULT_PACKET_SIZE as u32,
            client_prog_ver: 0,
            client_pid: std::process::id(),
            client_time_zone: 0,
            client_lcid: 0x0000_0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::new(),
            language: String::new(),
            database: String::new(),
        }
    }
}

impl Login7 {
    /// Encode the payload: fixed header, offset table, then string data.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // The data block in field order; passwords get their own encoder.
        let fields: [(&str, bool); 9] = [
            (&self.hostname, false),
            (&self.username, false),
            (&self.password, true),
            (&self.app_name, false),
            (&self.server_name, false),
            ("", false), // unused / extension block
            (&self.library_name, false),
            (&self.language, false),
            (&self.database, false),
        ];

        let mut data = BytesMut::new();
        let mut table = Vec::with_capacity(fields.len());
        for (value, is_password) in fields {
            let offset = LOGIN7_HEADER_SIZE + data.len();
            let chars = value.encode_utf16().count();
            table.push((offset as u16, chars as u16));
            if is_password {
                write_obfuscated_password(&mut data, value);
            } else {
                write_utf16(&mut data, value);
            }
        }

        let total = LOGIN7_HEADER_SIZE + data.len();
        let mut buf = BytesMut::with_capacity(total);

        buf.put_u32_le(total as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_ver);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_u8(OPTION_FLAGS_1);
        buf.put_u8(OPTION_FLAGS_2);
        buf.put_u8(TYPE_FLAGS);
        buf.put_u8(OPTION_FLAGS_3);
        buf.put_i32_le(self.client_time_zone);
        buf.put_u32_le(self.client_lcid);

        for &(offset, chars) in &table {
            buf.put_u16_le(offset);
            buf.put_u16_le(chars);
        }

        buf.put_slice(&[0u8; 6]); // client MAC address
        buf.put_u16_le(0); // SSPI offset
        buf.put_u16_le(0); // SSPI length
        buf.put_u16_le(0); // attach-database file offset
        buf.put_u16_le(0); // attach-database file length
        buf.put_u16_le(0); // change-password offset
        buf.put_u16_le(0); // change-password length
        buf.put_u32_le(0); // long SSPI length

        buf.put_slice(&data);
        buf.freeze()
    }
}

/// Write `password` as UTF-16LE with each byte XORed with 0xA5 and its
/// nibbles swapped.
fn write_obfuscated_password(dst: &mut BytesMut, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            let xored = byte ^ 0xA5;
            dst.put_u8((xored << 4) | (xored >> 4));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_is_94_bytes_before_data() {
        let login = Login7 {
            username: "sa".into(),
            ..Login7::default()
        };
        let payload = login.encode();

        // Total length field covers the whole payload.
        let total = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(total as usize, payload.len());

        // First offset entry (hostname) points at the end of the header.
        let ib_hostname = u16::from_le_bytes([payload[36], payload[37]]);
        assert_eq!(ib_hostname as usize, LOGIN7_HEADER_SIZE);
    }

    #[test]
    fn tds_version_encoded_little_endian() {
        let payload = Login7::default().encode();
        assert_eq!(&payload[4..8], &TdsVersion::V7_4.raw().to_le_bytes());
    }

    #[test]
    fn password_obfuscation_known_vector() {
        // 'a' as UTF-16LE is [0x61, 0x00]; XOR 0xA5 then nibble swap
        // yields [0x4C, 0x5A].
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        assert_eq!(&buf[..], &[0x4C, 0x5A]);
    }

    #[test]
    fn username_lands_at_its_offset() {
        let login = Login7 {
            hostname: "client".into(),
            username: "sa".into(),
            ..Login7::default()
        };
        let payload = login.encode();

        let ib_user = u16::from_le_bytes([payload[40], payload[41]]) as usize;
        let cch_user = u16::from_le_bytes([payload[42], payload[43]]) as usize;
        assert_eq!(cch_user, 2);
        assert_eq!(&payload[ib_user..ib_user + 4], &[b's', 0, b'a', 0]);
    }
}
