// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed values: the tag space shared by frame parameters and stored
//! records, and the per-type little-endian payload encoding.
//!
//! Strings travel with an explicit length that counts a mandatory trailing
//! NUL; fixed-width scalars travel as exactly their width. The `Min`/`Max`
//! sentinels bound the tag range and `Unset` marks "type unknown" in
//! requests.

use bytes::{BufMut, BytesMut};

use crate::wire::error::WireError;

/// Value type tags. `u16` inside frame parameters, `u32` inside stored
/// records.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    String = 1,
    Int32 = 2,
    UInt32 = 3,
    Int64 = 4,
    UInt64 = 5,
    Float = 6,
    Double = 7,
    Boolean = 8,
    /// Type not known by the requester; matches any stored type.
    Unset = 9,
}

/// Low sentinel of the type range.
pub const TYPE_MIN: u16 = 0;
/// High sentinel of the type range.
pub const TYPE_MAX: u16 = 10;

impl DataType {
    pub fn from_u16(v: u16) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::String,
            2 => Self::Int32,
            3 => Self::UInt32,
            4 => Self::Int64,
            5 => Self::UInt64,
            6 => Self::Float,
            7 => Self::Double,
            8 => Self::Boolean,
            9 => Self::Unset,
            _ => return Err(WireError::MalformedFrame("value type out of range")),
        })
    }

    pub fn from_u32(v: u32) -> Result<Self, WireError> {
        let narrow = u16::try_from(v)
            .map_err(|_| WireError::MalformedFrame("value type out of range"))?;
        Self::from_u16(narrow)
    }

    /// Payload width for fixed-width types; `None` for strings (and for
    /// `Unset`, which never carries a payload).
    pub fn fixed_len(self) -> Option<usize> {
        Some(match self {
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double => 8,
            Self::Boolean => 1,
            Self::String | Self::Unset => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "bool",
            Self::Unset => "unset",
        }
    }
}

/// A tagged value, as carried in frame parameters and stored records.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::String(_) => DataType::String,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Boolean(_) => DataType::Boolean,
        }
    }

    /// Encoded payload length, including the NUL terminator for strings.
    pub fn wire_len(&self) -> usize {
        match self {
            Value::String(s) => s.len() + 1,
            other => other
                .data_type()
                .fixed_len()
                .expect("non-string types have a fixed width"),
        }
    }

    /// Append the payload bytes (no type tag, no length prefix).
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Value::String(s) => {
                buf.put_slice(s.as_bytes());
                buf.put_u8(0);
            },
            Value::Int32(v) => buf.put_i32_le(*v),
            Value::UInt32(v) => buf.put_u32_le(*v),
            Value::Int64(v) => buf.put_i64_le(*v),
            Value::UInt64(v) => buf.put_u64_le(*v),
            Value::Float(v) => buf.put_f32_le(*v),
            Value::Double(v) => buf.put_f64_le(*v),
            Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        }
    }

    /// Decode a payload of type `ty` from exactly `bytes`.
    ///
    /// A zero-length payload is only legal for strings and decodes to the
    /// empty string; a non-empty string payload must end in NUL.
    pub fn decode(ty: DataType, bytes: &[u8]) -> Result<Value, WireError> {
        if ty == DataType::String {
            return match bytes {
                [] => Ok(Value::String(String::new())),
                [head @ .., 0] => {
                    let s = std::str::from_utf8(head)
                        .map_err(|_| WireError::MalformedFrame("string is not UTF-8"))?;
                    Ok(Value::String(s.to_owned()))
                },
                _ => Err(WireError::MalformedFrame("string missing NUL terminator")),
            };
        }

        let want = ty
            .fixed_len()
            .ok_or(WireError::MalformedFrame("unset type carries no payload"))?;
        if bytes.len() != want {
            return Err(WireError::MalformedFrame("fixed-width payload length mismatch"));
        }

        Ok(match ty {
            DataType::Int32 => Value::Int32(i32::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )),
            DataType::UInt32 => Value::UInt32(u32::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )),
            DataType::Int64 => Value::Int64(i64::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )),
            DataType::UInt64 => Value::UInt64(u64::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )),
            DataType::Float => Value::Float(f32::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )),
            DataType::Double => Value::Double(f64::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )),
            DataType::Boolean => Value::Boolean(bytes[0] != 0),
            DataType::String | DataType::Unset => unreachable!("handled above"),
        })
    }

    /// Equality on the raw wire representation, the comparison delta
    /// suppression uses: strings byte-wise, scalars by their little-endian
    /// bytes (so `-0.0` and `0.0` differ, and NaN equals an identical NaN).
    pub fn same_representation(&self, other: &Value) -> bool {
        if self.data_type() != other.data_type() {
            return false;
        }
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.as_bytes() == b.as_bytes(),
            (Value::Float(a), Value::Float(b)) => a.to_le_bytes() == b.to_le_bytes(),
            (Value::Double(a), Value::Double(b)) => a.to_le_bytes() == b.to_le_bytes(),
            _ => self == other,
        }
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(v) => f.write_str(v),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
        }
    }
}
