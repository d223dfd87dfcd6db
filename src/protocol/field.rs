// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Every field starts with id(4) + type(1) + flags(1) + 2 bytes that are
/// either padding or an inline i16.
pub const FIELD_HEADER_SIZE: usize = 8;

const TYPE_INT32: u8 = 0;
const TYPE_INT64: u8 = 2;
const TYPE_INT16: u8 = 3;
const TYPE_BINARY: u8 = 4;
const TYPE_FLOAT: u8 = 5;
const TYPE_UTF8_STRING: u8 = 7;

/// Bytes needed to bring `len` up to the next 8-byte boundary.
pub fn padding(len: usize) -> usize {
    (8 - len % 8) & 7
}

/// Typed value carried by a structured message field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
}

///
/// Conversion from the rust type to the field value.
///
macro_rules! implement_from {
    ($inner_type:ty, $variant:ident) => {
        impl From<$inner_type> for FieldValue {
            fn from(value: $inner_type) -> Self {
                FieldValue::$variant(value.into())
            }
        }
    };
}

implement_from!(i16, Int16);
implement_from!(i32, Int32);
implement_from!(i64, Int64);
implement_from!(f64, Float);
implement_from!(String, String);
implement_from!(&str, String);
implement_from!(Bytes, Binary);
implement_from!(Vec<u8>, Binary);

impl FieldValue {
    fn type_code(&self) -> u8 {
        match self {
            FieldValue::Int16(_) => TYPE_INT16,
            FieldValue::Int32(_) => TYPE_INT32,
            FieldValue::Int64(_) => TYPE_INT64,
            FieldValue::Float(_) => TYPE_FLOAT,
            FieldValue::String(_) => TYPE_UTF8_STRING,
            FieldValue::Binary(_) => TYPE_BINARY,
        }
    }

    /// Widening integer view; strings and blobs have none.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int16(v) => Some(i64::from(*v)),
            FieldValue::Int32(v) => Some(i64::from(*v)),
            FieldValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// One entry of a structured message's field table.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: u32,
    pub value: FieldValue,
}

impl Field {
    pub fn new(id: u32, value: impl Into<FieldValue>) -> Self {
        Field {
            id,
            value: value.into(),
        }
    }

    /// Encoded size including the trailing alignment padding.
    pub fn wire_format_size(&self) -> usize {
        let unpadded = match &self.value {
            FieldValue::Int16(_) => FIELD_HEADER_SIZE,
            FieldValue::Int32(_) => FIELD_HEADER_SIZE + 4,
            FieldValue::Int64(_) | FieldValue::Float(_) => FIELD_HEADER_SIZE + 8,
            FieldValue::String(s) => FIELD_HEADER_SIZE + 4 + s.len(),
            FieldValue::Binary(b) => FIELD_HEADER_SIZE + 4 + b.len(),
        };
        unpadded + padding(unpadded)
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        let start = writer.len();
        writer.put_u32(self.id);
        writer.put_u8(self.value.type_code());
        writer.put_u8(0);
        match &self.value {
            FieldValue::Int16(v) => writer.put_i16(*v),
            FieldValue::Int32(v) => {
                writer.put_u16(0);
                writer.put_i32(*v);
            }
            FieldValue::Int64(v) => {
                writer.put_u16(0);
                writer.put_i64(*v);
            }
            FieldValue::Float(v) => {
                writer.put_u16(0);
                writer.put_f64(*v);
            }
            FieldValue::String(s) => {
                writer.put_u16(0);
                writer.put_u32(s.len() as u32);
                writer.put_slice(s.as_bytes());
            }
            FieldValue::Binary(b) => {
                writer.put_u16(0);
                writer.put_u32(b.len() as u32);
                writer.put_slice(b);
            }
        }
        writer.put_bytes(0, padding(writer.len() - start));
    }

    /// Reads one field, including its alignment padding, from the front of
    /// `buffer`. The buffer only ever holds the current frame's body, so any
    /// shortfall means the frame lied about its contents.
    pub fn decode(buffer: &mut BytesMut) -> AppResult<Field> {
        if buffer.remaining() < FIELD_HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "field header needs {} bytes, {} left",
                FIELD_HEADER_SIZE,
                buffer.remaining()
            )));
        }
        let id = buffer.get_u32();
        let type_code = buffer.get_u8();
        let _flags = buffer.get_u8();
        let mut consumed = FIELD_HEADER_SIZE;

        let value = if type_code == TYPE_INT16 {
            FieldValue::Int16(buffer.get_i16())
        } else {
            buffer.advance(2);
            match type_code {
                TYPE_INT32 => {
                    ensure_remaining(buffer, 4, id)?;
                    consumed += 4;
                    FieldValue::Int32(buffer.get_i32())
                }
                TYPE_INT64 => {
                    ensure_remaining(buffer, 8, id)?;
                    consumed += 8;
                    FieldValue::Int64(buffer.get_i64())
                }
                TYPE_FLOAT => {
                    ensure_remaining(buffer, 8, id)?;
                    consumed += 8;
                    FieldValue::Float(buffer.get_f64())
                }
                TYPE_UTF8_STRING | TYPE_BINARY => {
                    ensure_remaining(buffer, 4, id)?;
                    let len = buffer.get_u32() as usize;
                    ensure_remaining(buffer, len, id)?;
                    consumed += 4 + len;
                    let raw = buffer.split_to(len).freeze();
                    if type_code == TYPE_BINARY {
                        FieldValue::Binary(raw)
                    } else {
                        let s = String::from_utf8(raw.to_vec()).map_err(|e| {
                            AppError::MalformedProtocol(format!("field {} is not utf-8: {}", id, e))
                        })?;
                        FieldValue::String(s)
                    }
                }
                unknown => {
                    return Err(AppError::MalformedProtocol(format!(
                        "field {} has unknown type {}",
                        id, unknown
                    )));
                }
            }
        };

        // the last field of a frame may arrive without its padding
        let pad = padding(consumed).min(buffer.remaining());
        buffer.advance(pad);

        Ok(Field { id, value })
    }
}

fn ensure_remaining(buffer: &BytesMut, needed: usize, id: u32) -> AppResult<()> {
    if buffer.remaining() < needed {
        return Err(AppError::MalformedProtocol(format!(
            "field {} needs {} more bytes, {} left",
            id,
            needed,
            buffer.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Field::new(1, 7i16), 8)]
    #[case(Field::new(2, -7i32), 16)]
    #[case(Field::new(3, i64::MAX), 16)]
    #[case(Field::new(4, 0.25f64), 16)]
    #[case(Field::new(5, "report"), 24)]
    #[case(Field::new(6, Vec::<u8>::new()), 16)]
    fn test_field_encoding(#[case] field: Field, #[case] expected_size: usize) {
        let mut buf = BytesMut::new();
        field.encode(&mut buf);
        assert_eq!(buf.len(), expected_size);
        assert_eq!(field.wire_format_size(), expected_size);

        let decoded = Field::decode(&mut buf).unwrap();
        assert_eq!(decoded, field);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u8(6);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_bytes(0, 24);
        let err = Field::decode(&mut buf).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_truncated_string_is_rejected() {
        let mut buf = BytesMut::new();
        Field::new(5, "a longer string value").encode(&mut buf);
        buf.truncate(16);
        assert!(matches!(
            Field::decode(&mut buf),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let mut buf = BytesMut::new();
        Field::new(5, vec![0xff, 0xfe]).encode(&mut buf);
        // flip the type byte from binary to utf-8 string
        buf[4] = TYPE_UTF8_STRING;
        assert!(Field::decode(&mut buf).is_err());
    }

    #[test]
    fn test_value_views() {
        assert_eq!(FieldValue::from(5i16).as_i64(), Some(5));
        assert_eq!(FieldValue::from(-5i32).as_i64(), Some(-5));
        assert_eq!(FieldValue::from("x").as_str(), Some("x"));
        assert_eq!(FieldValue::from("x").as_i64(), None);
        assert_eq!(
            FieldValue::from(vec![1u8, 2]).as_bytes(),
            Some(&Bytes::from_static(&[1, 2]))
        );
    }
}
