//! SQL batch payload.

use bytes::{Bytes, BytesMut};

use crate::codec::{utf16_len, write_all_headers, write_utf16};

/// Encode a SQL batch request payload.
///
/// The payload is the ALL_HEADERS prefix carrying the current transaction
/// descriptor, followed by the SQL text as UTF-16LE. For requests outside
/// an explicit transaction the descriptor is the zero sentinel.
#[must_use]
pub fn encode_sql_batch(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + utf16_len(sql));
    write_all_headers(&mut buf, transaction_descriptor);
    write_utf16(&mut buf, sql);
    buf.freeze()
}
