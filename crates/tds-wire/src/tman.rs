//! Transaction manager request payloads.
//!
//! Transaction control rides on packet type 0x0E. Each payload is the
//! ALL_HEADERS prefix, a request-type word, and request-specific data.
//! The server answers begin/commit/rollback with ENVCHANGE tokens
//! carrying the transaction descriptors.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_all_headers;

const TM_BEGIN_XACT: u16 = 5;
const TM_COMMIT_XACT: u16 = 7;
const TM_ROLLBACK_XACT: u16 = 8;

/// Isolation level byte carried in a begin-transaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TmIsolationLevel {
    /// Use the session's current level.
    NoChange = 0x00,
    /// READ UNCOMMITTED.
    ReadUncommitted = 0x01,
    /// READ COMMITTED.
    #[default]
    ReadCommitted = 0x02,
    /// REPEATABLE READ.
    RepeatableRead = 0x03,
    /// SERIALIZABLE.
    Serializable = 0x04,
    /// SNAPSHOT.
    Snapshot = 0x05,
}

/// Encode a begin-transaction request.
#[must_use]
pub fn encode_begin(
    transaction_descriptor: u64,
    isolation: TmIsolationLevel,
    name: &str,
) -> Bytes {
    let mut buf = BytesMut::new();
    write_all_headers(&mut buf, transaction_descriptor);
    buf.put_u16_le(TM_BEGIN_XACT);
    buf.put_u8(isolation as u8);
    write_name(&mut buf, name);
    buf.freeze()
}

/// Encode a commit-transaction request.
#[must_use]
pub fn encode_commit(transaction_descriptor: u64, name: &str) -> Bytes {
    encode_end(TM_COMMIT_XACT, transaction_descriptor, name)
}

/// Encode a rollback-transaction request.
#[must_use]
pub fn encode_rollback(transaction_descriptor: u64, name: &str) -> Bytes {
    encode_end(TM_ROLLBACK_XACT, transaction_descriptor, name)
}

fn encode_end(request_type: u16, transaction_descriptor: u64, name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    write_all_headers(&mut buf, transaction_descriptor);
    buf.put_u16_le(request_type);
    write_name(&mut buf, name);
    buf.put_u8(0); // no begin-after-end flags
    buf.freeze()
}

// Transaction names are a byte-counted UTF-16LE string.
fn write_name(dst: &mut BytesMut, name: &str) {
    let units: Vec<u16> = name.encode_utf16().collect();
    let capped = units.len().min(127);
    dst.put_u8((capped * 2) as u8);
    for unit in &units[..capped] {
        dst.put_u16_le(*unit);
    }
}
