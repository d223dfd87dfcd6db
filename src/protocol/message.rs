use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codes::{MF_BINARY, MF_END_OF_FILE};
use super::field::{padding, Field, FieldValue, FIELD_HEADER_SIZE};
use crate::{AppError, AppResult};

/// code(2) + flags(2) + size(4) + id(4) + field count or payload length(4)
pub const HEADER_SIZE: usize = 16;

/// Fixed-size prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub code: u16,
    pub flags: u16,
    /// Total frame size, header and padding included.
    pub size: u32,
    pub id: u32,
    /// Structured messages: number of fields. Binary messages: payload
    /// length without padding.
    pub count: u32,
}

impl FrameHeader {
    /// Parses the header from the first `HEADER_SIZE` bytes of `buf` without
    /// consuming them. Returns `None` if fewer bytes are available.
    pub fn peek(buf: &[u8]) -> Option<FrameHeader> {
        let mut header = buf.get(0..HEADER_SIZE)?;
        Some(FrameHeader {
            code: header.get_u16(),
            flags: header.get_u16(),
            size: header.get_u32(),
            id: header.get_u32(),
            count: header.get_u32(),
        })
    }

    pub fn is_binary(&self) -> bool {
        self.flags & MF_BINARY == MF_BINARY
    }
}

/// Message content: a field table or raw bytes, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Fields(Vec<Field>),
    Binary(Bytes),
}

/// One decoded frame.
///
/// The id is chosen by whoever sends a request; replies and any chunk
/// messages that follow them echo it back so the peer can correlate.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    code: u16,
    id: u32,
    /// Header flags except `MF_BINARY`, which is derived from the body.
    flags: u16,
    body: MessageBody,
}

impl Message {
    /// Creates an empty structured message.
    pub fn new(code: u16, id: u32) -> Self {
        Message {
            code,
            id,
            flags: 0,
            body: MessageBody::Fields(Vec::new()),
        }
    }

    /// Creates a binary message carrying `payload` verbatim.
    pub fn binary(code: u16, id: u32, payload: impl Into<Bytes>) -> Self {
        Message {
            code,
            id,
            flags: 0,
            body: MessageBody::Binary(payload.into()),
        }
    }

    /// Builds a reply to `self` with the given code, echoing the id.
    pub fn reply(&self, code: u16) -> Self {
        Message::new(code, self.id)
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn flags(&self) -> u16 {
        match self.body {
            MessageBody::Binary(_) => self.flags | MF_BINARY,
            MessageBody::Fields(_) => self.flags,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.body, MessageBody::Binary(_))
    }

    pub fn is_end_of_file(&self) -> bool {
        self.flags & MF_END_OF_FILE == MF_END_OF_FILE
    }

    pub fn set_end_of_file(&mut self, end_of_file: bool) {
        if end_of_file {
            self.flags |= MF_END_OF_FILE;
        } else {
            self.flags &= !MF_END_OF_FILE;
        }
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Field table of a structured message; empty for binary messages.
    pub fn fields(&self) -> &[Field] {
        match &self.body {
            MessageBody::Fields(fields) => fields,
            MessageBody::Binary(_) => &[],
        }
    }

    /// Raw payload of a binary message.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Binary(payload) => Some(payload),
            MessageBody::Fields(_) => None,
        }
    }

    pub fn field(&self, id: u32) -> Option<&FieldValue> {
        self.fields()
            .iter()
            .find(|field| field.id == id)
            .map(|field| &field.value)
    }

    pub fn field_as_i64(&self, id: u32) -> Option<i64> {
        self.field(id).and_then(FieldValue::as_i64)
    }

    pub fn field_as_str(&self, id: u32) -> Option<&str> {
        self.field(id).and_then(FieldValue::as_str)
    }

    /// Sets a field, replacing any existing field with the same id.
    ///
    /// Setting a field on a binary message turns it back into a structured
    /// one and discards the payload.
    pub fn set_field(&mut self, id: u32, value: impl Into<FieldValue>) {
        let value = value.into();
        match &mut self.body {
            MessageBody::Fields(fields) => {
                match fields.iter_mut().find(|field| field.id == id) {
                    Some(existing) => existing.value = value,
                    None => fields.push(Field { id, value }),
                }
            }
            MessageBody::Binary(_) => {
                self.body = MessageBody::Fields(vec![Field { id, value }]);
            }
        }
    }

    /// Builder-style variant of [`Message::set_field`].
    pub fn with_field(mut self, id: u32, value: impl Into<FieldValue>) -> Self {
        self.set_field(id, value);
        self
    }

    /// Encoded size of the whole frame, header and padding included.
    pub fn wire_format_size(&self) -> usize {
        match &self.body {
            MessageBody::Fields(fields) => {
                HEADER_SIZE + fields.iter().map(Field::wire_format_size).sum::<usize>()
            }
            MessageBody::Binary(payload) => {
                HEADER_SIZE + payload.len() + padding(payload.len())
            }
        }
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        let size = self.wire_format_size();
        writer.reserve(size);
        writer.put_u16(self.code);
        writer.put_u16(self.flags());
        writer.put_u32(size as u32);
        writer.put_u32(self.id);
        match &self.body {
            MessageBody::Fields(fields) => {
                writer.put_u32(fields.len() as u32);
                for field in fields {
                    field.encode(writer);
                }
            }
            MessageBody::Binary(payload) => {
                writer.put_u32(payload.len() as u32);
                writer.put_slice(payload);
                writer.put_bytes(0, padding(payload.len()));
            }
        }
    }

    /// Builds a message from a parsed header and the rest of its frame.
    ///
    /// `body` must hold exactly `header.size - HEADER_SIZE` bytes.
    pub fn decode(header: &FrameHeader, mut body: BytesMut) -> AppResult<Message> {
        let flags = header.flags & !MF_BINARY;
        let count = header.count as usize;
        let body = if header.is_binary() {
            if count > body.remaining() {
                return Err(AppError::MalformedProtocol(format!(
                    "binary message {} declares {} payload bytes, frame holds {}",
                    header.id,
                    count,
                    body.remaining()
                )));
            }
            MessageBody::Binary(body.split_to(count).freeze())
        } else {
            // every field takes at least FIELD_HEADER_SIZE bytes, so a count
            // beyond that is a lie; reject before reserving anything for it
            if count > body.remaining() / FIELD_HEADER_SIZE {
                return Err(AppError::MalformedProtocol(format!(
                    "message {} declares {} fields in {} bytes",
                    header.id,
                    count,
                    body.remaining()
                )));
            }
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(Field::decode(&mut body)?);
            }
            MessageBody::Fields(fields)
        };
        Ok(Message {
            code: header.code,
            id: header.id,
            flags,
            body,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            MessageBody::Fields(fields) => write!(
                f,
                "code=0x{:04x} id={} fields={}",
                self.code,
                self.id,
                fields.len()
            ),
            MessageBody::Binary(payload) => write!(
                f,
                "code=0x{:04x} id={} binary={}B",
                self.code,
                self.id,
                payload.len()
            ),
        }
    }
}
