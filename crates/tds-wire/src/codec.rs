//! Low-level string and header encoding helpers.
//!
//! TDS strings travel as UTF-16LE with either a one-byte (`B_VARCHAR`)
//! or two-byte (`US_VARCHAR`) character-count prefix. Readers return
//! `None` when the buffer does not yet hold the complete element, which
//! lets the incremental token parser wait for more data.

use bytes::{Buf, BufMut, BytesMut};

/// Read a `B_VARCHAR` (u8 character count + UTF-16LE data).
pub fn read_b_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 1 {
        return None;
    }
    let chars = src.get_u8() as usize;
    read_utf16(src, chars)
}

/// Read a `US_VARCHAR` (u16 character count + UTF-16LE data).
pub fn read_us_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 2 {
        return None;
    }
    let chars = src.get_u16_le() as usize;
    read_utf16(src, chars)
}

/// Read `chars` UTF-16 code units from `src`.
///
/// Unpaired surrogates are replaced rather than rejected; server-supplied
/// strings are display data, not protocol structure.
pub fn read_utf16(src: &mut impl Buf, chars: usize) -> Option<String> {
    if src.remaining() < chars * 2 {
        return None;
    }
    let mut units = Vec::with_capacity(chars);
    for _ in 0..chars {
        units.push(src.get_u16_le());
    }
    Some(String::from_utf16_lossy(&units))
}

/// Write a `B_VARCHAR`; the string is truncated at 255 code units.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len().min(255);
    dst.put_u8(len as u8);
    for &unit in &units[..len] {
        dst.put_u16_le(unit);
    }
}

/// Write a `US_VARCHAR`; the string is truncated at 65535 code units.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len().min(65535);
    dst.put_u16_le(len as u16);
    for &unit in &units[..len] {
        dst.put_u16_le(unit);
    }
}

/// Write raw UTF-16LE data with no length prefix.
pub fn write_utf16(dst: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

/// Number of bytes `s` occupies as UTF-16LE.
#[must_use]
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Write the ALL_HEADERS prefix carried by SQL batch, RPC and transaction
/// manager requests on TDS 7.2 and later.
///
/// The only header the core sends is the transaction descriptor header
/// (type 0x0002), carrying the current descriptor and an outstanding
/// request count of one.
pub fn write_all_headers(dst: &mut BytesMut, transaction_descriptor: u64) {
    const TOTAL_LENGTH: u32 = 22;
    const HEADER_LENGTH: u32 = 18;
    const HEADER_TYPE_TRANSACTION_DESCRIPTOR: u16 = 0x0002;

    dst.put_u32_le(TOTAL_LENGTH);
    dst.put_u32_le(HEADER_LENGTH);
    dst.put_u16_le(HEADER_TYPE_TRANSACTION_DESCRIPTOR);
    dst.put_u64_le(transaction_descriptor);
    dst.put_u32_le(1);
}
