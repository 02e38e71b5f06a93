//! Typed key-value payloads
//!
//! A stored value always carries its type tag. Reading it back as another type
//! is a `DataTypeMismatch`, never a silent conversion.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Type tag of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Bool = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    String = 12,
    Bytes = 13,
    Json = 14,
}

impl ValueType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ValueType::Bool,
            2 => ValueType::I8,
            3 => ValueType::I16,
            4 => ValueType::I32,
            5 => ValueType::I64,
            6 => ValueType::U8,
            7 => ValueType::U16,
            8 => ValueType::U32,
            9 => ValueType::U64,
            10 => ValueType::F32,
            11 => ValueType::F64,
            12 => ValueType::String,
            13 => ValueType::Bytes,
            14 => ValueType::Json,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::I8 => "i8",
            ValueType::I16 => "i16",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::U8 => "u8",
            ValueType::U16 => "u16",
            ValueType::U32 => "u32",
            ValueType::U64 => "u64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::Json => "json",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed value as held by a Key-Value Storage.
///
/// In deployment manifests values are written as
/// `{"type": "u32", "value": 42}`; bytes use base64 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KvsValue {
    Bool(bool),
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
    String(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

impl KvsValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            KvsValue::Bool(_) => ValueType::Bool,
            KvsValue::I8(_) => ValueType::I8,
            KvsValue::I16(_) => ValueType::I16,
            KvsValue::I32(_) => ValueType::I32,
            KvsValue::I64(_) => ValueType::I64,
            KvsValue::U8(_) => ValueType::U8,
            KvsValue::U16(_) => ValueType::U16,
            KvsValue::U32(_) => ValueType::U32,
            KvsValue::U64(_) => ValueType::U64,
            KvsValue::F32(_) => ValueType::F32,
            KvsValue::F64(_) => ValueType::F64,
            KvsValue::String(_) => ValueType::String,
            KvsValue::Bytes(_) => ValueType::Bytes,
            KvsValue::Json(_) => ValueType::Json,
        }
    }

    /// Serializes the payload without its type tag.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            KvsValue::Bool(v) => vec![*v as u8],
            KvsValue::I8(v) => v.to_le_bytes().to_vec(),
            KvsValue::I16(v) => v.to_le_bytes().to_vec(),
            KvsValue::I32(v) => v.to_le_bytes().to_vec(),
            KvsValue::I64(v) => v.to_le_bytes().to_vec(),
            KvsValue::U8(v) => v.to_le_bytes().to_vec(),
            KvsValue::U16(v) => v.to_le_bytes().to_vec(),
            KvsValue::U32(v) => v.to_le_bytes().to_vec(),
            KvsValue::U64(v) => v.to_le_bytes().to_vec(),
            KvsValue::F32(v) => v.to_le_bytes().to_vec(),
            KvsValue::F64(v) => v.to_le_bytes().to_vec(),
            KvsValue::String(v) => v.as_bytes().to_vec(),
            KvsValue::Bytes(v) => v.clone(),
            KvsValue::Json(v) => v.to_string().into_bytes(),
        }
    }

    /// Parses a payload written by [`encode_payload`](Self::encode_payload).
    pub fn decode_payload(ty: ValueType, payload: &[u8]) -> Result<KvsValue, String> {
        fn fixed<const N: usize>(ty: ValueType, payload: &[u8]) -> Result<[u8; N], String> {
            payload
                .try_into()
                .map_err(|_| format!("{} payload must be {} bytes, got {}", ty, N, payload.len()))
        }

        Ok(match ty {
            ValueType::Bool => match fixed::<1>(ty, payload)?[0] {
                0 => KvsValue::Bool(false),
                1 => KvsValue::Bool(true),
                other => return Err(format!("invalid bool byte {}", other)),
            },
            ValueType::I8 => KvsValue::I8(i8::from_le_bytes(fixed(ty, payload)?)),
            ValueType::I16 => KvsValue::I16(i16::from_le_bytes(fixed(ty, payload)?)),
            ValueType::I32 => KvsValue::I32(i32::from_le_bytes(fixed(ty, payload)?)),
            ValueType::I64 => KvsValue::I64(i64::from_le_bytes(fixed(ty, payload)?)),
            ValueType::U8 => KvsValue::U8(u8::from_le_bytes(fixed(ty, payload)?)),
            ValueType::U16 => KvsValue::U16(u16::from_le_bytes(fixed(ty, payload)?)),
            ValueType::U32 => KvsValue::U32(u32::from_le_bytes(fixed(ty, payload)?)),
            ValueType::U64 => KvsValue::U64(u64::from_le_bytes(fixed(ty, payload)?)),
            ValueType::F32 => KvsValue::F32(f32::from_le_bytes(fixed(ty, payload)?)),
            ValueType::F64 => KvsValue::F64(f64::from_le_bytes(fixed(ty, payload)?)),
            ValueType::String => KvsValue::String(
                String::from_utf8(payload.to_vec()).map_err(|e| format!("invalid utf-8: {}", e))?,
            ),
            ValueType::Bytes => KvsValue::Bytes(payload.to_vec()),
            ValueType::Json => KvsValue::Json(
                serde_json::from_slice(payload).map_err(|e| format!("invalid json: {}", e))?,
            ),
        })
    }

    /// Size of the stored payload in bytes.
    pub fn payload_size(&self) -> u64 {
        match self {
            KvsValue::String(v) => v.len() as u64,
            KvsValue::Bytes(v) => v.len() as u64,
            other => other.encode_payload().len() as u64,
        }
    }
}

/// Rust types that map onto a [`ValueType`].
pub trait KvsType: Sized {
    const TYPE: ValueType;

    fn into_value(self) -> KvsValue;

    fn from_value(value: KvsValue) -> Option<Self>;
}

macro_rules! impl_kvs_type {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl KvsType for $ty {
                const TYPE: ValueType = ValueType::$variant;

                fn into_value(self) -> KvsValue {
                    KvsValue::$variant(self)
                }

                fn from_value(value: KvsValue) -> Option<Self> {
                    match value {
                        KvsValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for KvsValue {
                fn from(v: $ty) -> Self {
                    KvsValue::$variant(v)
                }
            }
        )*
    };
}

impl_kvs_type! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

impl From<&str> for KvsValue {
    fn from(v: &str) -> Self {
        KvsValue::String(v.to_string())
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
