use bytes::{Buf, BytesMut};

use crate::protocol::{FrameHeader, Message, HEADER_SIZE};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Default size of a connection's read buffer.
pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 256 * 1024;
/// Default upper bound for a single frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Splits a connection's inbound byte stream into messages.
///
/// The decoder holds only the two size limits; the bytes themselves live in
/// the owning connection's buffer, so nothing is shared between connections.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    initial_buffer_size: usize,
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(initial_buffer_size: usize, max_message_size: usize) -> Self {
        FrameDecoder {
            initial_buffer_size: initial_buffer_size.min(max_message_size),
            max_message_size,
        }
    }

    pub fn initial_buffer_size(&self) -> usize {
        self.initial_buffer_size
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Check whether `buffer` holds at least one complete frame.
    ///
    /// Returns `Err(Incomplete)` if more bytes have to be read from the socket,
    /// or a protocol error if the header is unusable: a declared size smaller
    /// than the header itself or larger than the configured maximum. In the
    /// oversize case nothing is reserved for the declared length.
    pub fn check(&self, buffer: &mut BytesMut) -> AppResult<FrameHeader> {
        let header = FrameHeader::peek(buffer).ok_or(Incomplete)?;
        let frame_size = header.size as usize;
        if frame_size < HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} is smaller than the {} byte header",
                frame_size, HEADER_SIZE
            )));
        }
        if frame_size > self.max_message_size {
            return Err(AppError::FrameTooLarge {
                size: frame_size,
                max: self.max_message_size,
            });
        }
        if buffer.remaining() < frame_size {
            buffer.reserve(frame_size - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(header)
    }

    /// Parse one message off the front of `buffer`.
    ///
    /// Returns `Ok(None)` if the buffer does not hold a whole frame yet; the
    /// buffer is left untouched in that case. On success exactly the frame's
    /// declared size is consumed.
    pub fn parse(&self, buffer: &mut BytesMut) -> AppResult<Option<Message>> {
        match self.check(buffer) {
            Ok(header) => {
                let mut frame = buffer.split_to(header.size as usize);
                frame.advance(HEADER_SIZE);
                Message::decode(&header, frame).map(Some)
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
