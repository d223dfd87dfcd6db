use bytes::Bytes;

use crate::protocol::codes::CMD_FILE_DATA;
use crate::protocol::Message;

/// Default size of one outbound chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Splits an outbound payload into binary messages of at most `chunk_size`
/// bytes each.
///
/// Chunks share the id of the request that produced the payload and slice
/// the original buffer without copying. The last chunk carries the
/// end-of-file flag; an empty payload produces no chunks at all.
#[derive(Debug, Clone, Copy)]
pub struct OutboundChunker {
    chunk_size: usize,
}

impl Default for OutboundChunker {
    fn default() -> Self {
        OutboundChunker::new(DEFAULT_CHUNK_SIZE)
    }
}

impl OutboundChunker {
    pub fn new(chunk_size: usize) -> Self {
        OutboundChunker {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of messages `chunks` will yield for a payload of `len` bytes.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    pub fn chunks(&self, id: u32, payload: Bytes) -> Chunks {
        Chunks {
            id,
            payload,
            offset: 0,
            chunk_size: self.chunk_size,
        }
    }
}

/// Iterator returned by [`OutboundChunker::chunks`].
#[derive(Debug)]
pub struct Chunks {
    id: u32,
    payload: Bytes,
    offset: usize,
    chunk_size: usize,
}

impl Iterator for Chunks {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let mut chunk = Message::binary(CMD_FILE_DATA, self.id, self.payload.slice(self.offset..end));
        chunk.set_end_of_file(end == self.payload.len());
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.payload.len() - self.offset).div_ceil(self.chunk_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks {}
