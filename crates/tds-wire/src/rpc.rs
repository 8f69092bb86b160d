//! RPC request payload.
//!
//! RPC requests (packet type 0x03) name a procedure either by string or
//! by one of the well-known procedure ids, then carry a flag word and the
//! parameters. Parameterized SQL goes through `sp_executesql` this way.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{write_all_headers, write_b_varchar, write_us_varchar, write_utf16};

// Parameter type tokens.
const TYPE_GUID: u8 = 0x24;
const TYPE_INTN: u8 = 0x26;
const TYPE_BITN: u8 = 0x68;
const TYPE_FLTN: u8 = 0x6D;
const TYPE_BIGVARBINARY: u8 = 0xA5;
const TYPE_NVARCHAR: u8 = 0xE7;

// Raw collation for NVARCHAR parameters (Latin1_General, CI_AS).
const DEFAULT_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// Well-known procedure ids the server accepts in place of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// `sp_executesql`: execute parameterized SQL.
    ExecuteSql = 0x000A,
    /// `sp_prepare`: prepare a statement, returning a handle.
    Prepare = 0x000B,
    /// `sp_execute`: execute a prepared handle.
    Execute = 0x000C,
    /// `sp_unprepare`: release a prepared handle.
    Unprepare = 0x000F,
}

/// How the request names its procedure.
#[derive(Debug, Clone)]
pub enum Procedure {
    /// By well-known id.
    Id(ProcId),
    /// By name.
    Name(String),
}

/// A parameter value, covering the scalar types the driver binds.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// SQL NULL.
    Null,
    /// 8-bit integer.
    TinyInt(u8),
    /// 16-bit integer.
    SmallInt(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// Boolean bit.
    Bit(bool),
    /// 32-bit float.
    Real(f32),
    /// 64-bit float.
    Float(f64),
    /// Unicode string.
    NVarChar(String),
    /// Binary blob.
    VarBinary(Bytes),
    /// UNIQUEIDENTIFIER.
    Guid([u8; 16]),
}

impl ParamValue {
    /// The type name used when declaring this parameter to `sp_executesql`.
    #[must_use]
    pub fn declaration(&self) -> &'static str {
        match self {
            Self::Null => "int",
            Self::TinyInt(_) => "tinyint",
            Self::SmallInt(_) => "smallint",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Bit(_) => "bit",
            Self::Real(_) => "real",
            Self::Float(_) => "float",
            Self::NVarChar(_) => "nvarchar(4000)",
            Self::VarBinary(_) => "varbinary(8000)",
            Self::Guid(_) => "uniqueidentifier",
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Null => {
                dst.put_u8(TYPE_INTN);
                dst.put_u8(4);
                dst.put_u8(0);
            }
            Self::TinyInt(v) => encode_intn(dst, 1, &v.to_le_bytes()),
            Self::SmallInt(v) => encode_intn(dst, 2, &v.to_le_bytes()),
            Self::Int(v) => encode_intn(dst, 4, &v.to_le_bytes()),
            Self::BigInt(v) => encode_intn(dst, 8, &v.to_le_bytes()),
            Self::Bit(v) => {
                dst.put_u8(TYPE_BITN);
                dst.put_u8(1);
                dst.put_u8(1);
                dst.put_u8(u8::from(*v));
            }
            Self::Real(v) => {
                dst.put_u8(TYPE_FLTN);
                dst.put_u8(4);
                dst.put_u8(4);
                dst.put_f32_le(*v);
            }
            Self::Float(v) => {
                dst.put_u8(TYPE_FLTN);
                dst.put_u8(8);
                dst.put_u8(8);
                dst.put_f64_le(*v);
            }
            Self::NVarChar(s) => {
                let byte_len = crate::codec::utf16_len(s);
                dst.put_u8(TYPE_NVARCHAR);
                dst.put_u16_le(byte_len.max(2) as u16);
                dst.put_slice(&DEFAULT_COLLATION);
                dst.put_u16_le(byte_len as u16);
                write_utf16(dst, s);
            }
            Self::VarBinary(data) => {
                dst.put_u8(TYPE_BIGVARBINARY);
                dst.put_u16_le(data.len().max(1) as u16);
                dst.put_u16_le(data.len() as u16);
                dst.put_slice(data);
            }
            Self::Guid(bytes) => {
                dst.put_u8(TYPE_GUID);
                dst.put_u8(16);
                dst.put_u8(16);
                dst.put_slice(bytes);
            }
        }
    }
}

fn encode_intn(dst: &mut BytesMut, width: u8, data: &[u8]) {
    dst.put_u8(TYPE_INTN);
    dst.put_u8(width);
    dst.put_u8(width);
    dst.put_slice(data);
}

/// One named RPC parameter.
#[derive(Debug, Clone)]
pub struct RpcParam {
    /// Parameter name including the `@` prefix, or empty for positional.
    pub name: String,
    /// Whether the server should return the parameter value (OUTPUT).
    pub output: bool,
    /// The bound value.
    pub value: ParamValue,
}

impl RpcParam {
    /// Bind an input parameter.
    #[must_use]
    pub fn input(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            output: false,
            value,
        }
    }

    /// Bind an output parameter.
    #[must_use]
    pub fn out(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            output: true,
            value,
        }
    }
}

/// A complete RPC request.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Procedure to invoke.
    pub procedure: Procedure,
    /// Parameters in declaration order.
    pub params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Build a request against a well-known procedure id.
    #[must_use]
    pub fn by_id(id: ProcId, params: Vec<RpcParam>) -> Self {
        Self {
            procedure: Procedure::Id(id),
            params,
        }
    }

    /// Build a request against a named procedure.
    #[must_use]
    pub fn by_name(name: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            procedure: Procedure::Name(name.into()),
            params,
        }
    }

    /// Encode the payload with the given transaction descriptor.
    #[must_use]
    pub fn encode(&self, transaction_descriptor: u64) -> Bytes {
        let mut buf = BytesMut::new();
        write_all_headers(&mut buf, transaction_descriptor);

        match &self.procedure {
            Procedure::Id(id) => {
                buf.put_u16_le(0xFFFF);
                buf.put_u16_le(*id as u16);
            }
            Procedure::Name(name) => write_us_varchar(&mut buf, name),
        }

        buf.put_u16_le(0); // option flags

        for param in &self.params {
            write_b_varchar(&mut buf, &param.name);
            buf.put_u8(if param.output { 0x01 } else { 0x00 });
            param.value.encode(&mut buf);
        }

        buf.freeze()
    }
}
