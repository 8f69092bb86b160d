//! Token-stream parsing.
//!
//! Server responses (packet type 0x04) are a stream of tokens: metadata,
//! rows, messages, environment changes and completion markers. The
//! [`TokenStreamParser`] is a byte sink: the connection feeds it the
//! payload of every inbound packet and receives typed [`TokenEvent`]s
//! back. Tokens may span packet boundaries, so the parser keeps partial
//! token bytes between calls.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{read_b_varchar, read_us_varchar, write_b_varchar, write_us_varchar};
use crate::error::ProtocolError;

/// Token type bytes this parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// RETURNSTATUS: stored-procedure return code.
    ReturnStatus = 0x79,
    /// COLMETADATA: result-set column descriptions.
    ColMetaData = 0x81,
    /// ORDER: columns the result set is ordered by.
    Order = 0xA9,
    /// ERROR: server error message.
    Error = 0xAA,
    /// INFO: server informational message.
    Info = 0xAB,
    /// RETURNVALUE: output parameter value.
    ReturnValue = 0xAC,
    /// LOGINACK: login acknowledgement.
    LoginAck = 0xAD,
    /// ROW: one row of data.
    Row = 0xD1,
    /// ENVCHANGE: session environment change.
    EnvChange = 0xE3,
    /// DONE: end of a SQL statement.
    Done = 0xFD,
    /// DONEPROC: end of a stored procedure.
    DoneProc = 0xFE,
    /// DONEINPROC: end of a statement inside a procedure.
    DoneInProc = 0xFF,
}

bitflags! {
    /// Status word of the DONE token family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow in this response.
        const MORE = 0x0001;
        /// The statement ended in error.
        const ERROR = 0x0002;
        /// A transaction is open.
        const IN_XACT = 0x0004;
        /// The row count field is valid.
        const COUNT = 0x0010;
        /// This DONE acknowledges an attention signal.
        const ATTENTION = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// DONE / DONEPROC / DONEINPROC contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneToken {
    /// Status word.
    pub status: DoneStatus,
    /// Token of the current command.
    pub cur_cmd: u16,
    /// Rows affected, valid when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl DoneToken {
    /// Whether this token acknowledges an attention signal.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTENTION)
    }

    /// The row count this token contributes to the request total.
    #[must_use]
    pub const fn counted_rows(&self) -> u64 {
        if self.status.contains(DoneStatus::COUNT) {
            self.row_count
        } else {
            0
        }
    }

    /// Encode under the given DONE-family token type.
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) {
        dst.put_u8(token as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }
}

/// ERROR or INFO token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class; 11 and above is an error.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name.
    pub server: String,
    /// Procedure the message originated in, if any.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u32,
}

impl ServerMessage {
    /// Encode as an ERROR or INFO token.
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message);
        write_b_varchar(&mut body, &self.server);
        write_b_varchar(&mut body, &self.procedure);
        body.put_u32_le(self.line);

        dst.put_u8(token as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}

/// LOGINACK token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Accepted interface; 1 is T-SQL.
    pub interface: u8,
    /// Negotiated TDS version, raw wire value.
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Encode as a LOGINACK token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version);
        write_b_varchar(&mut body, &self.prog_name);
        body.put_u32(self.prog_version);

        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}

/// Type description of one column or parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeInfo {
    /// Fixed-width type; values carry no length prefix.
    Fixed {
        /// Type token.
        token: u8,
        /// Value width in bytes.
        len: usize,
    },
    /// Variable type with a one-byte length prefix on each value.
    ByteLen {
        /// Type token.
        token: u8,
        /// Maximum value width.
        max: u8,
        /// Precision, for decimal types.
        precision: Option<u8>,
        /// Scale, for decimal types.
        scale: Option<u8>,
    },
    /// Variable type with a two-byte length prefix on each value
    /// (0xFFFF marks NULL).
    VarLen16 {
        /// Type token.
        token: u8,
        /// Maximum value width in bytes.
        max: u16,
        /// Collation, for character types.
        collation: Option<[u8; 5]>,
    },
}

// Fixed-width type tokens.
const T_NULL: u8 = 0x1F;
const T_INT1: u8 = 0x30;
const T_BIT: u8 = 0x32;
const T_INT2: u8 = 0x34;
const T_INT4: u8 = 0x38;
const T_DATETIM4: u8 = 0x3A;
const T_FLT4: u8 = 0x3B;
const T_MONEY: u8 = 0x3C;
const T_DATETIME: u8 = 0x3D;
const T_FLT8: u8 = 0x3E;
const T_MONEY4: u8 = 0x7A;
const T_INT8: u8 = 0x7F;

// Byte-length type tokens.
const T_GUID: u8 = 0x24;
const T_INTN: u8 = 0x26;
const T_BITN: u8 = 0x68;
const T_DECIMALN: u8 = 0x6A;
const T_NUMERICN: u8 = 0x6C;
const T_FLTN: u8 = 0x6D;
const T_MONEYN: u8 = 0x6E;
const T_DATETIMN: u8 = 0x6F;

// Two-byte-length type tokens.
const T_BIGVARBINARY: u8 = 0xA5;
const T_BIGVARCHAR: u8 = 0xA7;
const T_BIGBINARY: u8 = 0xAD;
const T_BIGCHAR: u8 = 0xAF;
const T_NVARCHAR: u8 = 0xE7;
const T_NCHAR: u8 = 0xEF;

const fn fixed_width(token: u8) -> Option<usize> {
    match token {
        T_NULL => Some(0),
        T_INT1 | T_BIT => Some(1),
        T_INT2 => Some(2),
        T_INT4 | T_DATETIM4 | T_FLT4 | T_MONEY4 => Some(4),
        T_MONEY | T_DATETIME | T_FLT8 | T_INT8 => Some(8),
        _ => None,
    }
}

impl TypeInfo {
    /// The type token byte.
    #[must_use]
    pub const fn token(&self) -> u8 {
        match self {
            Self::Fixed { token, .. }
            | Self::ByteLen { token, .. }
            | Self::VarLen16 { token, .. } => *token,
        }
    }

    fn parse(src: &mut &[u8]) -> Result<Option<Self>, ProtocolError> {
        if src.remaining() < 1 {
            return Ok(None);
        }
        let token = src.get_u8();

        if let Some(len) = fixed_width(token) {
            return Ok(Some(Self::Fixed { token, len }));
        }

        match token {
            T_GUID | T_INTN | T_BITN | T_FLTN | T_MONEYN | T_DATETIMN => {
                if src.remaining() < 1 {
                    return Ok(None);
                }
                Ok(Some(Self::ByteLen {
                    token,
                    max: src.get_u8(),
                    precision: None,
                    scale: None,
                }))
            }
            T_DECIMALN | T_NUMERICN => {
                if src.remaining() < 3 {
                    return Ok(None);
                }
                Ok(Some(Self::ByteLen {
                    token,
                    max: src.get_u8(),
                    precision: Some(src.get_u8()),
                    scale: Some(src.get_u8()),
                }))
            }
            T_BIGVARBINARY | T_BIGBINARY => {
                if src.remaining() < 2 {
                    return Ok(None);
                }
                Ok(Some(Self::VarLen16 {
                    token,
                    max: src.get_u16_le(),
                    collation: None,
                }))
            }
            T_BIGVARCHAR | T_BIGCHAR | T_NVARCHAR | T_NCHAR => {
                if src.remaining() < 7 {
                    return Ok(None);
                }
                let max = src.get_u16_le();
                let mut collation = [0u8; 5];
                src.copy_to_slice(&mut collation);
                Ok(Some(Self::VarLen16 {
                    token,
                    max,
                    collation: Some(collation),
                }))
            }
            other => Err(ProtocolError::UnsupportedColumnType(other)),
        }
    }

    /// Encode this type description.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::Fixed { token, .. } => dst.put_u8(*token),
            Self::ByteLen {
                token,
                max,
                precision,
                scale,
            } => {
                dst.put_u8(*token);
                dst.put_u8(*max);
                if let (Some(p), Some(s)) = (precision, scale) {
                    dst.put_u8(*p);
                    dst.put_u8(*s);
                }
            }
            Self::VarLen16 {
                token,
                max,
                collation,
            } => {
                dst.put_u8(*token);
                dst.put_u16_le(*max);
                if let Some(collation) = collation {
                    dst.put_slice(collation);
                }
            }
        }
    }

    /// Convenience constructor for a nullable 4-byte integer column.
    #[must_use]
    pub const fn intn() -> Self {
        Self::ByteLen {
            token: T_INTN,
            max: 4,
            precision: None,
            scale: None,
        }
    }

    /// Convenience constructor for an `nvarchar` column.
    #[must_use]
    pub const fn nvarchar(max_bytes: u16) -> Self {
        Self::VarLen16 {
            token: T_NVARCHAR,
            max: max_bytes,
            collation: Some([0x09, 0x04, 0xD0, 0x00, 0x34]),
        }
    }

    fn parse_value(&self, src: &mut &[u8]) -> Option<Option<Bytes>> {
        match self {
            Self::Fixed { len, .. } => {
                if *len == 0 {
                    return Some(None);
                }
                if src.remaining() < *len {
                    return None;
                }
                Some(Some(src.copy_to_bytes(*len)))
            }
            Self::ByteLen { .. } => {
                if src.remaining() < 1 {
                    return None;
                }
                let len = src.get_u8() as usize;
                if len == 0 {
                    return Some(None);
                }
                if src.remaining() < len {
                    return None;
                }
                Some(Some(src.copy_to_bytes(len)))
            }
            Self::VarLen16 { .. } => {
                if src.remaining() < 2 {
                    return None;
                }
                let len = src.get_u16_le();
                if len == 0xFFFF {
                    return Some(None);
                }
                let len = len as usize;
                if src.remaining() < len {
                    return None;
                }
                Some(Some(src.copy_to_bytes(len)))
            }
        }
    }

    fn encode_value(&self, value: Option<&[u8]>, dst: &mut impl BufMut) {
        match self {
            Self::Fixed { .. } => {
                if let Some(value) = value {
                    dst.put_slice(value);
                }
            }
            Self::ByteLen { .. } => match value {
                Some(value) => {
                    dst.put_u8(value.len() as u8);
                    dst.put_slice(value);
                }
                None => dst.put_u8(0),
            },
            Self::VarLen16 { .. } => match value {
                Some(value) => {
                    dst.put_u16_le(value.len() as u16);
                    dst.put_slice(value);
                }
                None => dst.put_u16_le(0xFFFF),
            },
        }
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type.
    pub info: TypeInfo,
}

/// COLMETADATA token contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMetadata {
    /// Columns in result order.
    pub columns: Vec<Column>,
}

impl ColumnMetadata {
    fn parse(src: &mut &[u8]) -> Result<Option<Self>, ProtocolError> {
        if src.remaining() < 2 {
            return Ok(None);
        }
        let count = src.get_u16_le();
        if count == 0xFFFF {
            return Ok(Some(Self::default()));
        }

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if src.remaining() < 6 {
                return Ok(None);
            }
            let _user_type = src.get_u32_le();
            let _flags = src.get_u16_le();
            let Some(info) = TypeInfo::parse(src)? else {
                return Ok(None);
            };
            let Some(name) = read_b_varchar(src) else {
                return Ok(None);
            };
            columns.push(Column { name, info });
        }
        Ok(Some(Self { columns }))
    }

    /// Encode as a COLMETADATA token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::ColMetaData as u8);
        dst.put_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            dst.put_u32_le(0); // user type
            dst.put_u16_le(0x0001); // nullable
            column.info.encode(dst);
            write_b_varchar(dst, &column.name);
        }
    }
}

/// One row of raw column values, aligned with the current metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Undecoded values; `None` is SQL NULL.
    pub values: Vec<Option<Bytes>>,
}

impl Row {
    /// Encode as a ROW token against the given metadata.
    pub fn encode(&self, metadata: &ColumnMetadata, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::Row as u8);
        for (column, value) in metadata.columns.iter().zip(&self.values) {
            column.info.encode_value(value.as_deref(), dst);
        }
    }
}

/// RETURNVALUE token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Status byte.
    pub status: u8,
    /// Value type.
    pub info: TypeInfo,
    /// Raw value; `None` is SQL NULL.
    pub value: Option<Bytes>,
}

/// Typed events emitted by [`TokenStreamParser`].
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// Informational message.
    InfoMessage(ServerMessage),
    /// Error message.
    ErrorMessage(ServerMessage),
    /// Login acknowledgement.
    LoginAck(LoginAck),
    /// ENVCHANGE: current database changed.
    DatabaseChange {
        /// New database.
        new: String,
        /// Previous database.
        old: String,
    },
    /// ENVCHANGE: session language changed.
    LanguageChange {
        /// New language.
        new: String,
        /// Previous language.
        old: String,
    },
    /// ENVCHANGE: character set changed.
    CharsetChange {
        /// New character set.
        new: String,
        /// Previous character set.
        old: String,
    },
    /// ENVCHANGE: packet size renegotiated.
    PacketSizeChange {
        /// New packet size in bytes.
        new: u32,
        /// Previous packet size in bytes.
        old: u32,
    },
    /// ENVCHANGE: transaction began; the server issued a descriptor.
    BeginTransaction {
        /// The new transaction descriptor.
        descriptor: u64,
    },
    /// ENVCHANGE: transaction committed.
    CommitTransaction,
    /// ENVCHANGE: transaction rolled back.
    RollbackTransaction,
    /// ENVCHANGE: connection-reset acknowledgement.
    ResetConnectionAck,
    /// Result-set metadata.
    ColumnMetadata(Arc<ColumnMetadata>),
    /// Result-set ordering columns.
    Order(Vec<u16>),
    /// One row of data.
    Row(Row),
    /// Stored-procedure return status.
    ReturnStatus(i32),
    /// Output parameter value.
    ReturnValue(ReturnValue),
    /// Statement completion.
    Done(DoneToken),
    /// Procedure completion.
    DoneProc(DoneToken),
    /// In-procedure statement completion.
    DoneInProc(DoneToken),
}

// Environment change type bytes.
const ENV_DATABASE: u8 = 1;
const ENV_LANGUAGE: u8 = 2;
const ENV_CHARSET: u8 = 3;
const ENV_PACKET_SIZE: u8 = 4;
const ENV_BEGIN_XACT: u8 = 8;
const ENV_COMMIT_XACT: u8 = 9;
const ENV_ROLLBACK_XACT: u8 = 10;
const ENV_RESET_ACK: u8 = 18;

enum Parsed {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// A complete token producing an event.
    Event(TokenEvent),
    /// A complete token the connection has no use for.
    Skipped,
}

/// Incremental token-stream parser.
///
/// Feed it packet payloads with [`add_buffer`](Self::add_buffer); complete
/// tokens come back as events and partial ones are retained until the next
/// call. ROW tokens are decoded against the most recent COLMETADATA, which
/// the parser remembers.
#[derive(Debug, Default)]
pub struct TokenStreamParser {
    buf: BytesMut,
    metadata: Option<Arc<ColumnMetadata>>,
}

impl TokenStreamParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the parser is holding an unfinished token.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feed response bytes and collect the token events they complete.
    pub fn add_buffer(&mut self, bytes: &[u8]) -> Result<Vec<TokenEvent>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        tracing::trace!(
            added = bytes.len(),
            buffered = self.buf.len(),
            "token stream input"
        );

        let mut events = Vec::new();
        loop {
            let mut cur: &[u8] = &self.buf;
            if cur.is_empty() {
                break;
            }
            // Disjoint borrows: `cur` views the buffer while the column
            // metadata slot is updated in place.
            match parse_token(&mut cur, &mut self.metadata)? {
                Parsed::Incomplete => break,
                parsed => {
                    let consumed = self.buf.len() - cur.len();
                    self.buf.advance(consumed);
                    if let Parsed::Event(event) = parsed {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }
}

fn parse_token(
    cur: &mut &[u8],
    current_metadata: &mut Option<Arc<ColumnMetadata>>,
) -> Result<Parsed, ProtocolError> {
    let token = cur.get_u8();
    match token {
        0x79 => {
            if cur.remaining() < 4 {
                return Ok(Parsed::Incomplete);
            }
            Ok(Parsed::Event(TokenEvent::ReturnStatus(cur.get_i32_le())))
        }
        0x81 => match ColumnMetadata::parse(cur)? {
            None => Ok(Parsed::Incomplete),
            Some(metadata) => {
                let metadata = Arc::new(metadata);
                *current_metadata = Some(Arc::clone(&metadata));
                Ok(Parsed::Event(TokenEvent::ColumnMetadata(metadata)))
            }
        },
        0xA9 => parse_order(cur),
        0xAA | 0xAB => parse_message(cur, token == 0xAA),
        0xAC => parse_return_value(cur),
        0xAD => parse_login_ack(cur),
        0xD1 => parse_row(cur, current_metadata.as_deref()),
        0xE3 => parse_env_change(cur),
        0xFD | 0xFE | 0xFF => parse_done(cur, token),
        other => Err(ProtocolError::UnknownToken(other)),
    }
}

fn parse_row(cur: &mut &[u8], metadata: Option<&ColumnMetadata>) -> Result<Parsed, ProtocolError> {
    let metadata = metadata.ok_or(ProtocolError::RowWithoutMetadata)?;

    let mut values = Vec::with_capacity(metadata.columns.len());
    for column in &metadata.columns {
        match column.info.parse_value(cur) {
            None => return Ok(Parsed::Incomplete),
            Some(value) => values.push(value),
        }
    }
    Ok(Parsed::Event(TokenEvent::Row(Row { values })))
}

fn parse_order(cur: &mut &[u8]) -> Result<Parsed, ProtocolError> {
    if cur.remaining() < 2 {
        return Ok(Parsed::Incomplete);
    }
    let len = cur.get_u16_le() as usize;
    if cur.remaining() < len {
        return Ok(Parsed::Incomplete);
    }
    if len % 2 != 0 {
        return Err(ProtocolError::MalformedToken {
            token: "ORDER",
            detail: "odd body length",
        });
    }
    let columns = (0..len / 2).map(|_| cur.get_u16_le()).collect();
    Ok(Parsed::Event(TokenEvent::Order(columns)))
}

fn parse_message(cur: &mut &[u8], is_error: bool) -> Result<Parsed, ProtocolError> {
    if cur.remaining() < 2 {
        return Ok(Parsed::Incomplete);
    }
    let len = cur.get_u16_le() as usize;
    if cur.remaining() < len {
        return Ok(Parsed::Incomplete);
    }

    let mut body = &cur[..len];
    cur.advance(len);

    let malformed = ProtocolError::MalformedToken {
        token: if is_error { "ERROR" } else { "INFO" },
        detail: "body shorter than advertised",
    };
    if body.remaining() < 6 {
        return Err(malformed);
    }
    let number = body.get_i32_le();
    let state = body.get_u8();
    let class = body.get_u8();
    let Some(message) = read_us_varchar(&mut body) else {
        return Err(malformed);
    };
    let Some(server) = read_b_varchar(&mut body) else {
        return Err(malformed);
    };
    let Some(procedure) = read_b_varchar(&mut body) else {
        return Err(malformed);
    };
    if body.remaining() < 4 {
        return Err(malformed);
    }
    let line = body.get_u32_le();

    let message = ServerMessage {
        number,
        state,
        class,
        message,
        server,
        procedure,
        line,
    };
    Ok(Parsed::Event(if is_error {
        TokenEvent::ErrorMessage(message)
    } else {
        TokenEvent::InfoMessage(message)
    }))
}

fn parse_login_ack(cur: &mut &[u8]) -> Result<Parsed, ProtocolError> {
    if cur.remaining() < 2 {
        return Ok(Parsed::Incomplete);
    }
    let len = cur.get_u16_le() as usize;
    if cur.remaining() < len {
        return Ok(Parsed::Incomplete);
    }

    let mut body = &cur[..len];
    cur.advance(len);

    let malformed = ProtocolError::MalformedToken {
        token: "LOGINACK",
        detail: "body shorter than advertised",
    };
    if body.remaining() < 5 {
        return Err(malformed);
    }
    let interface = body.get_u8();
    let tds_version = body.get_u32();
    let Some(prog_name) = read_b_varchar(&mut body) else {
        return Err(malformed);
    };
    if body.remaining() < 4 {
        return Err(malformed);
    }
    let prog_version = body.get_u32();

    Ok(Parsed::Event(TokenEvent::LoginAck(LoginAck {
        interface,
        tds_version,
        prog_name,
        prog_version,
    })))
}

fn parse_return_value(cur: &mut &[u8]) -> Result<Parsed, ProtocolError> {
    if cur.remaining() < 2 {
        return Ok(Parsed::Incomplete);
    }
    let ordinal = cur.get_u16_le();
    let Some(name) = read_b_varchar(cur) else {
        return Ok(Parsed::Incomplete);
    };
    if cur.remaining() < 7 {
        return Ok(Parsed::Incomplete);
    }
    let status = cur.get_u8();
    let _user_type = cur.get_u32_le();
    let _flags = cur.get_u16_le();
    let Some(info) = TypeInfo::parse(cur)? else {
        return Ok(Parsed::Incomplete);
    };
    let Some(value) = info.parse_value(cur) else {
        return Ok(Parsed::Incomplete);
    };

    Ok(Parsed::Event(TokenEvent::ReturnValue(ReturnValue {
        ordinal,
        name,
        status,
        info,
        value,
    })))
}

fn parse_env_change(cur: &mut &[u8]) -> Result<Parsed, ProtocolError> {
    if cur.remaining() < 2 {
        return Ok(Parsed::Incomplete);
    }
    let len = cur.get_u16_le() as usize;
    if cur.remaining() < len {
        return Ok(Parsed::Incomplete);
    }

    let mut body = &cur[..len];
    cur.advance(len);

    let malformed = ProtocolError::MalformedToken {
        token: "ENVCHANGE",
        detail: "body shorter than advertised",
    };
    if body.remaining() < 1 {
        return Err(malformed);
    }
    let env_type = body.get_u8();

    let event = match env_type {
        ENV_DATABASE | ENV_LANGUAGE | ENV_CHARSET | ENV_PACKET_SIZE => {
            let Some(new) = read_b_varchar(&mut body) else {
                return Err(malformed);
            };
            let Some(old) = read_b_varchar(&mut body) else {
                return Err(malformed);
            };
            match env_type {
                ENV_DATABASE => TokenEvent::DatabaseChange { new, old },
                ENV_LANGUAGE => TokenEvent::LanguageChange { new, old },
                ENV_CHARSET => TokenEvent::CharsetChange { new, old },
                _ => {
                    let parse = |s: &str| {
                        s.parse::<u32>().map_err(|_| ProtocolError::MalformedToken {
                            token: "ENVCHANGE",
                            detail: "packet size is not a number",
                        })
                    };
                    TokenEvent::PacketSizeChange {
                        new: parse(&new)?,
                        old: parse(&old)?,
                    }
                }
            }
        }
        ENV_BEGIN_XACT => {
            if body.remaining() < 9 || body.get_u8() != 8 {
                return Err(ProtocolError::MalformedToken {
                    token: "ENVCHANGE",
                    detail: "begin-transaction descriptor is not 8 bytes",
                });
            }
            TokenEvent::BeginTransaction {
                descriptor: body.get_u64_le(),
            }
        }
        ENV_COMMIT_XACT => TokenEvent::CommitTransaction,
        ENV_ROLLBACK_XACT => TokenEvent::RollbackTransaction,
        ENV_RESET_ACK => TokenEvent::ResetConnectionAck,
        // Collation changes and the like; the length prefix lets us
        // skip what we do not model.
        _ => return Ok(Parsed::Skipped),
    };
    Ok(Parsed::Event(event))
}

fn parse_done(cur: &mut &[u8], token: u8) -> Result<Parsed, ProtocolError> {
    if cur.remaining() < 12 {
        return Ok(Parsed::Incomplete);
    }
    let done = DoneToken {
        status: DoneStatus::from_bits_truncate(cur.get_u16_le()),
        cur_cmd: cur.get_u16_le(),
        row_count: cur.get_u64_le(),
    };
    Ok(Parsed::Event(match token {
        0xFD => TokenEvent::Done(done),
        0xFE => TokenEvent::DoneProc(done),
        _ => TokenEvent::DoneInProc(done),
    }))
}

/// Encode a begin-transaction ENVCHANGE token (server side; used by tests
/// and scripted servers).
pub fn encode_env_begin_transaction(descriptor: u64, dst: &mut impl BufMut) {
    dst.put_u8(TokenType::EnvChange as u8);
    dst.put_u16_le(11);
    dst.put_u8(ENV_BEGIN_XACT);
    dst.put_u8(8);
    dst.put_u64_le(descriptor);
    dst.put_u8(0);
}

/// Encode a commit-transaction ENVCHANGE token.
pub fn encode_env_commit_transaction(descriptor: u64, dst: &mut impl BufMut) {
    encode_env_end_transaction(ENV_COMMIT_XACT, descriptor, dst);
}

/// Encode a rollback-transaction ENVCHANGE token.
pub fn encode_env_rollback_transaction(descriptor: u64, dst: &mut impl BufMut) {
    encode_env_end_transaction(ENV_ROLLBACK_XACT, descriptor, dst);
}

fn encode_env_end_transaction(env_type: u8, descriptor: u64, dst: &mut impl BufMut) {
    dst.put_u8(TokenType::EnvChange as u8);
    dst.put_u16_le(11);
    dst.put_u8(env_type);
    dst.put_u8(0);
    dst.put_u8(8);
    dst.put_u64_le(descriptor);
}

/// Encode a packet-size ENVCHANGE token.
pub fn encode_env_packet_size(new: u32, old: u32, dst: &mut impl BufMut) {
    let new = new.to_string();
    let old = old.to_string();
    let mut body = BytesMut::new();
    body.put_u8(ENV_PACKET_SIZE);
    write_b_varchar(&mut body, &new);
    write_b_varchar(&mut body, &old);

    dst.put_u8(TokenType::EnvChange as u8);
    dst.put_u16_le(body.len() as u16);
    dst.put_slice(&body);
}

/// Encode a database-change ENVCHANGE token.
pub fn encode_env_database(new: &str, old: &str, dst: &mut impl BufMut) {
    let mut body = BytesMut::new();
    body.put_u8(ENV_DATABASE);
    write_b_varchar(&mut body, new);
    write_b_varchar(&mut body, old);

    dst.put_u8(TokenType::EnvChange as u8);
    dst.put_u16_le(body.len() as u16);
    dst.put_slice(&body);
}
