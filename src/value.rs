//! # Typed Value Encoding
//!
//! Purpose: the wire protocol only carries bytes; the client remembers what
//! kind of value those bytes represent in the 32-bit `flags` extras field
//! so `Get` can reconstruct the original type.
//!
//! ## Design Principles
//! 1. **Closed Enumeration, Open Escape Hatch**: every primitive kind the
//!    source supports gets its own tag; anything else falls back to a
//!    general-purpose binary encoding the caller decodes explicitly.
//! 2. **Little-Endian Payloads**: fixed-width integers and floats are
//!    little-endian on the wire — a client-side convention, not something
//!    the binary protocol itself mandates.
//! 3. **ASCII Decimal For Int**: `Value::Int` is stored as an ASCII decimal
//!    string specifically so the server's `Increment`/`Decrement` opcodes
//!    (which parse the stored value with `strtoull`) can operate on it.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ClientError, ClientResult};

/// Tag carried in the protocol's `flags` extras field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueKind {
    Int = 0x0000_0000,
    Bytes = 0x0000_0002,
    I8 = 0x0000_0004,
    I16 = 0x0000_0008,
    I32 = 0x0000_0010,
    I64 = 0x0000_0020,
    U8 = 0x0000_0040,
    U16 = 0x0000_0080,
    U32 = 0x0000_0100,
    U64 = 0x0000_0200,
    F32 = 0x0000_0400,
    F64 = 0x0000_0800,
    Str = 0x0000_1000,
    Bool = 0x0000_2000,
    /// Escape hatch: a general-purpose binary encoding of anything else.
    Struct = 0x0000_0001,
}

impl ValueKind {
    pub fn from_flags(flags: u32) -> Option<ValueKind> {
        Some(match flags {
            0x0000_0000 => ValueKind::Int,
            0x0000_0001 => ValueKind::Struct,
            0x0000_0002 => ValueKind::Bytes,
            0x0000_0004 => ValueKind::I8,
            0x0000_0008 => ValueKind::I16,
            0x0000_0010 => ValueKind::I32,
            0x0000_0020 => ValueKind::I64,
            0x0000_0040 => ValueKind::U8,
            0x0000_0080 => ValueKind::U16,
            0x0000_0100 => ValueKind::U32,
            0x0000_0200 => ValueKind::U64,
            0x0000_0400 => ValueKind::F32,
            0x0000_0800 => ValueKind::F64,
            0x0000_1000 => ValueKind::Str,
            0x0000_2000 => ValueKind::Bool,
            _ => return None,
        })
    }

    pub fn flags(self) -> u32 {
        self as u32
    }
}

/// A value read back from the cache.
///
/// `Get` returns this directly for every primitive kind; for `Struct`, call
/// [`Value::decode_struct`] with the caller's destination type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bool(bool),
    /// Raw bytes produced by a general-purpose encoder; decode explicitly.
    Struct(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Int(_) => ValueKind::Int,
            Value::I8(_) => ValueKind::I8,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::U8(_) => ValueKind::U8,
            Value::U16(_) => ValueKind::U16,
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
            Value::Struct(_) => ValueKind::Struct,
        }
    }

    /// Encodes a struct through the general-purpose escape hatch.
    pub fn from_struct<T: Serialize>(value: &T) -> ClientResult<Value> {
        let bytes = bincode::serialize(value).map_err(|_| ClientError::InvalidFormat)?;
        Ok(Value::Struct(bytes))
    }

    /// Decodes the `Struct` escape hatch into a caller-supplied type.
    ///
    /// Mirrors the source's `ByteToStruct`: a non-`Struct` value, or a
    /// `Struct` value requested without a compatible destination type,
    /// surfaces [`ClientError::NoFormat`] / [`ClientError::InvalidFormat`].
    pub fn decode_struct<T: DeserializeOwned>(&self) -> ClientResult<T> {
        match self {
            Value::Struct(bytes) => {
                bincode::deserialize(bytes).map_err(|_| ClientError::InvalidFormat)
            }
            _ => Err(ClientError::NoFormat),
        }
    }

    pub(crate) fn encode_payload(&self) -> Vec<u8> {
        match self {
            Value::Bytes(bytes) => bytes.clone(),
            Value::Int(v) => v.to_string().into_bytes(),
            Value::I8(v) => vec![*v as u8],
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => vec![*v],
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::Str(s) => s.clone().into_bytes(),
            Value::Bool(b) => vec![if *b { 1 } else { 0 }],
            Value::Struct(bytes) => bytes.clone(),
        }
    }

    pub(crate) fn decode_payload(kind: ValueKind, data: &[u8]) -> ClientResult<Value> {
        Ok(match kind {
            ValueKind::Bytes => Value::Bytes(data.to_vec()),
            ValueKind::Int => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| ClientError::InvalidFormat)?
                    .trim();
                Value::Int(text.parse().map_err(|_| ClientError::InvalidFormat)?)
            }
            ValueKind::I8 => Value::I8(*data.first().ok_or(ClientError::InvalidFormat)? as i8),
            ValueKind::I16 => Value::I16(i16::from_le_bytes(read_le(data)?)),
            ValueKind::I32 => Value::I32(i32::from_le_bytes(read_le(data)?)),
            ValueKind::I64 => Value::I64(i64::from_le_bytes(read_le(data)?)),
            ValueKind::U8 => Value::U8(*data.first().ok_or(ClientError::InvalidFormat)?),
            ValueKind::U16 => Value::U16(u16::from_le_bytes(read_le(data)?)),
            ValueKind::U32 => Value::U32(u32::from_le_bytes(read_le(data)?)),
            ValueKind::U64 => Value::U64(u64::from_le_bytes(read_le(data)?)),
            ValueKind::F32 => Value::F32(f32::from_le_bytes(read_le(data)?)),
            ValueKind::F64 => Value::F64(f64::from_le_bytes(read_le(data)?)),
            ValueKind::Str => {
                Value::Str(String::from_utf8(data.to_vec()).map_err(|_| ClientError::InvalidFormat)?)
            }
            ValueKind::Bool => {
                Value::Bool(*data.first().ok_or(ClientError::InvalidFormat)? == 1)
            }
            ValueKind::Struct => Value::Struct(data.to_vec()),
        })
    }
}

fn read_le<const N: usize>(data: &[u8]) -> ClientResult<[u8; N]> {
    data.get(..N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ClientError::InvalidFormat)
}

macro_rules! impl_from_primitive {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Value {
                Value::$variant(v)
            }
        }
    };
}

impl_from_primitive!(i8, I8);
impl_from_primitive!(i16, I16);
impl_from_primitive!(i32, I32);
impl_from_primitive!(i64, I64);
impl_from_primitive!(u8, U8);
impl_from_primitive!(u16, U16);
impl_from_primitive!(u32, U32);
impl_from_primitive!(u64, U64);
impl_from_primitive!(f32, F32);
impl_from_primitive!(f64, F64);
impl_from_primitive!(bool, Bool);
impl_from_primitive!(String, Str);

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value {
        Value::Bytes(v.to_vec())
    }
}

/// The source stores `int` as an ASCII decimal specifically so the server
/// can `Increment`/`Decrement` it; this mirrors that by routing the
/// platform `int`-equivalent (`i64`) through `Value::Int`, not `Value::I64`.
impl Value {
    pub fn from_int(v: i64) -> Value {
        Value::Int(v)
    }
}
