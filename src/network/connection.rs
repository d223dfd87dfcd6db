use std::io::{self, ErrorKind};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::network::FrameDecoder;
use crate::protocol::Message;
use crate::{AppError, AppResult};

/// Read side of a client connection.
///
/// Owns the inbound buffer, which starts at the decoder's initial size and
/// grows on demand up to the decoder's maximum frame size.
#[derive(Debug)]
pub struct Connection<R> {
    reader: R,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new(reader: R, decoder: FrameDecoder) -> Connection<R> {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(decoder.initial_buffer_size()),
            decoder,
        }
    }

    /// Reads a `Message` from the connection.
    ///
    /// This method continuously reads data from the stream into the buffer until a complete
    /// frame can be parsed. If a data format error is encountered, or if the frame
    /// exceeds the size limit, an error is returned and the connection should be closed.
    ///
    /// If the client closes the connection while a frame is being sent, an error is returned.
    /// If the client closes the connection gracefully, `None` is returned.
    pub async fn read_frame(&mut self) -> AppResult<Option<Message>> {
        loop {
            if let Some(message) = self.decoder.parse(&mut self.buffer)? {
                return Ok(Some(message));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // client has closed the connection gracefully
                    Ok(None)
                } else {
                    // client close the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// Write side of a client connection.
///
/// Messages are encoded into a scratch buffer that is reused across writes,
/// then pushed through a `BufWriter`. Nothing reaches the socket until
/// [`FrameWriter::flush`] is called or the buffer fills up.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
    scratch: BytesMut,
    max_message_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> FrameWriter<W> {
        FrameWriter {
            writer: BufWriter::new(writer),
            scratch: BytesMut::with_capacity(4 * 1024),
            // the header's size field is a u32
            max_message_size: u32::MAX as usize,
        }
    }

    /// Refuse to write frames larger than `max_message_size`, which is
    /// still capped by what the header can express.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> FrameWriter<W> {
        self.max_message_size = max_message_size.min(u32::MAX as usize);
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Fails with `InvalidValue` before writing anything if the encoded
    /// message would exceed the maximum frame size.
    pub async fn write_message(&mut self, message: &Message) -> AppResult<()> {
        let size = message.wire_format_size();
        if size > self.max_message_size {
            return Err(AppError::InvalidValue(format!(
                "message {} of {} bytes exceeds the maximum of {} bytes",
                message, size, self.max_message_size
            )));
        }
        self.scratch.clear();
        message.encode(&mut self.scratch);
        self.writer
            .write_all(&self.scratch)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("write message error: {}", e)))
    }

    pub async fn flush(&mut self) -> AppResult<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("flush message error: {}", e)))
    }

    /// Flushes what is buffered and shuts the write direction down.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Shuts the write direction down without flushing. Bytes still
    /// buffered from an interrupted write are discarded, so a peer that
    /// stopped reading cannot hold this up.
    pub async fn abort(&mut self) -> AppResult<()> {
        self.writer.get_mut().shutdown().await?;
        Ok(())
    }
}
