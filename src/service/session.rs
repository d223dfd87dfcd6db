use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::network::{Connection, FrameWriter, OutboundChunker};
use crate::protocol::codes::CMD_KEEPALIVE;
use crate::protocol::Message;
use crate::{AppError, AppResult};

/// Business logic for one client session.
///
/// The transport calls `handle` once per decoded request, in arrival order,
/// and never concurrently for the same session. Anything written into
/// `payload` is streamed back as chunk messages after the reply, using the
/// request's id. Failures are the handler's to encode into its reply.
pub trait SessionHandler: Send + 'static {
    fn handle(
        &mut self,
        request: Message,
        payload: &mut BytesMut,
    ) -> impl Future<Output = Option<Message>> + Send;

    /// Called once when the session is closing, whatever the reason.
    fn on_close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Creates one [`SessionHandler`] per accepted connection.
pub trait SessionFactory: Send + Sync + 'static {
    type Handler: SessionHandler;

    fn create(&self, session: &Arc<SessionHandle>) -> Self::Handler;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Serving = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Serving,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound for tearing a socket down when no I/O deadline is configured.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Shared side of a session: what the registry and the business layer see.
///
/// Reads belong to the session's own worker task. Writes from any task go
/// through the writer mutex, so a reply and its chunk stream are never
/// interleaved with another send on the same connection.
pub struct SessionHandle {
    id: u64,
    peer: String,
    active: AtomicBool,
    state: AtomicU8,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    io_timeout: Option<Duration>,
    stop: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn new<W>(id: u64, peer: impl Into<String>, writer: W, io_timeout: Option<Duration>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        SessionHandle {
            id,
            peer: peer.into(),
            active: AtomicBool::new(true),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            writer: Mutex::new(FrameWriter::new(Box::new(writer) as BoxedWriter)),
            io_timeout,
            stop: CancellationToken::new(),
        }
    }

    /// Messages larger than `max_message_size` are refused before any byte
    /// is written.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.writer = Mutex::new(self.writer.into_inner().with_max_message_size(max_message_size));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Lock-free liveness check.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ask the session to close. The worker task notices, shuts the socket
    /// down and deregisters. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.set_state(ConnectionState::Closing);
            self.stop.cancel();
            debug!(session = self.id, peer = %self.peer, "session closing");
        }
    }

    /// Resolves once [`SessionHandle::close`] has been called.
    pub async fn closed(&self) {
        self.stop.cancelled().await
    }

    /// Writes and flushes one message. A failed write closes the session.
    pub async fn send(&self, message: &Message) -> AppResult<()> {
        if !self.is_active() {
            return Err(AppError::ConnectionClosed(self.id));
        }
        let result = tokio::select! {
            biased;
            _ = self.closed() => Err(AppError::ConnectionClosed(self.id)),
            res = self.send_locked(message) => res,
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn send_locked(&self, message: &Message) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        with_deadline(self.io_timeout, "write", async {
            writer.write_message(message).await?;
            writer.flush().await
        })
        .await?;
        if message.code() != CMD_KEEPALIVE {
            debug!(session = self.id, %message, "sent message");
        }
        Ok(())
    }

    /// Writes a reply followed by the chunk stream for `payload`, holding the
    /// writer for the whole sequence. The reply is flushed before the first
    /// chunk goes out. Any write failure abandons the remaining chunks and
    /// closes the session.
    pub async fn deliver(
        &self,
        reply: Option<&Message>,
        id: u32,
        payload: Bytes,
        chunker: &OutboundChunker,
    ) -> AppResult<()> {
        if !self.is_active() {
            return Err(AppError::ConnectionClosed(self.id));
        }
        let result = self.deliver_locked(reply, id, payload, chunker).await;
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn deliver_locked(
        &self,
        reply: Option<&Message>,
        id: u32,
        payload: Bytes,
        chunker: &OutboundChunker,
    ) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        if let Some(reply) = reply {
            with_deadline(self.io_timeout, "write", async {
                writer.write_message(reply).await?;
                writer.flush().await
            })
            .await?;
            debug!(session = self.id, message = %reply, "sent reply");
        }
        if payload.is_empty() {
            return Ok(());
        }

        let total = payload.len();
        let chunks = chunker.chunks(id, payload);
        let count = chunks.len();
        for chunk in chunks {
            with_deadline(self.io_timeout, "write", writer.write_message(&chunk)).await?;
            debug!(session = self.id, message = %chunk, "sent chunk");
        }
        with_deadline(self.io_timeout, "write", writer.flush()).await?;
        debug!(
            monotonic_counter.chunks_sent = count as u64,
            histogram.payload_bytes = total as u64,
            session = self.id,
            id,
            "streamed payload"
        );
        Ok(())
    }

    /// Shuts the write half down without flushing what an interrupted send
    /// left buffered, bounded by the I/O deadline or `CLOSE_GRACE`.
    async fn shutdown_writer(&self) {
        let grace = self.io_timeout.unwrap_or(CLOSE_GRACE);
        let result = with_deadline(Some(grace), "shutdown", async {
            let mut writer = self.writer.lock().await;
            writer.abort().await
        })
        .await;
        if let Err(e) = result {
            trace!(session = self.id, error = %e, "socket shutdown failed");
        }
    }
}

/// Runs `fut` under the optional per-operation deadline.
pub(crate) async fn with_deadline<T>(
    deadline: Option<Duration>,
    operation: &'static str,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| AppError::Timeout(operation))?,
        None => fut.await,
    }
}

/// Serve loop of one connection: decode, dispatch, reply, stream.
pub struct SessionWorker<H, R> {
    handle: Arc<SessionHandle>,
    connection: Connection<R>,
    handler: H,
    chunker: OutboundChunker,
}

impl<H, R> SessionWorker<H, R>
where
    H: SessionHandler,
    R: AsyncRead + Unpin + Send,
{
    /// Wraps an established connection. The socket is buffered and the
    /// handler exists, so the session is serving from here on.
    pub fn new(
        handle: Arc<SessionHandle>,
        connection: Connection<R>,
        handler: H,
        chunker: OutboundChunker,
    ) -> Self {
        handle.set_state(ConnectionState::Serving);
        SessionWorker {
            handle,
            connection,
            handler,
            chunker,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Serves until the peer disconnects, an error occurs or the session is
    /// closed, then tears the connection down. Errors are returned for
    /// logging only; the session is closed either way.
    pub async fn run(mut self) -> AppResult<()> {
        let result = self.serve().await;

        self.handle.close();
        self.handler.on_close().await;
        self.handle.shutdown_writer().await;
        self.handle.set_state(ConnectionState::Closed);
        debug!(session = self.handle.id, "session closed");

        result
    }

    async fn serve(&mut self) -> AppResult<()> {
        let io_timeout = self.handle.io_timeout;
        loop {
            // read request from client, if client close the connection gracefully, return None,
            // if client close the connection unexpectedly, return Err
            let maybe_request = tokio::select! {
                biased;
                _ = self.handle.closed() => {
                    debug!(session = self.handle.id, "session worker exit read loop after close request");
                    return Ok(());
                }
                res = with_deadline(io_timeout, "read", self.connection.read_frame()) => res?,
            };

            let request = match maybe_request {
                Some(request) => request,
                None => {
                    debug!(session = self.handle.id, "peer closed the connection");
                    return Ok(());
                }
            };

            if request.code() == CMD_KEEPALIVE {
                continue;
            }
            debug!(
                monotonic_counter.messages_received = 1u64,
                session = self.handle.id,
                message = %request,
                "received message"
            );

            let id = request.id();
            let mut payload = BytesMut::new();
            let reply = self.handler.handle(request, &mut payload).await;
            if reply.is_none() && payload.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                _ = self.handle.closed() => return Ok(()),
                res = self.handle.deliver(reply.as_ref(), id, payload.freeze(), &self.chunker) => res?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::network::FrameDecoder;
    use crate::protocol::codes::{
        CMD_FILE_DATA, CMD_NOTIFY, CMD_REQUEST_COMPLETED, CMD_RS_GET_REPORT, CMD_RS_LIST_REPORTS,
        CMD_RS_RENDER_RESULT,
    };

    const FIELD_PAYLOAD_SIZE: u32 = 1;
    const FIELD_DEFINITION: u32 = 2;

    /// Replies to every request; render requests also produce a payload of
    /// the size given in field 1, report requests get a 256-byte definition.
    #[derive(Default)]
    struct RenderHandler {
        closed: Arc<AtomicBool>,
    }

    impl SessionHandler for RenderHandler {
        async fn handle(&mut self, request: Message, payload: &mut BytesMut) -> Option<Message> {
            if request.code() == CMD_RS_RENDER_RESULT {
                let size = request.field_as_i64(FIELD_PAYLOAD_SIZE).unwrap_or(0) as usize;
                payload.extend((0..size).map(|i| (i % 256) as u8));
            }
            let mut reply = request.reply(CMD_REQUEST_COMPLETED).with_field(FIELD_PAYLOAD_SIZE, 0i32);
            if request.code() == CMD_RS_GET_REPORT {
                reply.set_field(FIELD_DEFINITION, vec![0u8; 256]);
            }
            Some(reply)
        }

        async fn on_close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Peer {
        reader: Connection<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Peer {
        async fn request(&mut self, message: &Message) {
            self.writer.write_message(message).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn next(&mut self) -> Option<Message> {
            self.reader.read_frame().await.unwrap()
        }
    }

    fn session(chunk_size: usize) -> (SessionWorker<RenderHandler, ReadHalf<DuplexStream>>, Peer) {
        let (client, server) = duplex(256 * 1024);
        let (server_read, server_write) = split(server);
        let (client_read, client_write) = split(client);

        let handle = Arc::new(SessionHandle::new(1, "test-peer", server_write, None));
        let worker = SessionWorker::new(
            handle,
            Connection::new(server_read, FrameDecoder::default()),
            RenderHandler::default(),
            OutboundChunker::new(chunk_size),
        );
        let peer = Peer {
            reader: Connection::new(client_read, FrameDecoder::default()),
            writer: FrameWriter::new(client_write),
        };
        (worker, peer)
    }

    #[tokio::test]
    async fn test_reply_then_chunks_share_request_id() {
        let (worker, mut peer) = session(16 * 1024);
        let task = tokio::spawn(worker.run());

        let request = Message::new(CMD_RS_RENDER_RESULT, 42).with_field(FIELD_PAYLOAD_SIZE, 40_000i32);
        peer.request(&request).await;

        let reply = peer.next().await.unwrap();
        assert_eq!(reply.code(), CMD_REQUEST_COMPLETED);
        assert_eq!(reply.id(), 42);

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let chunk = peer.next().await.unwrap();
            assert_eq!(chunk.code(), CMD_FILE_DATA);
            assert_eq!(chunk.id(), 42);
            sizes.push(chunk.payload().unwrap().len());
        }
        assert_eq!(sizes, vec![16384, 16384, 7232]);

        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_is_not_dispatched() {
        let (worker, mut peer) = session(1024);
        let handle = worker.handle().clone();
        let task = tokio::spawn(worker.run());

        peer.request(&Message::new(CMD_KEEPALIVE, 7)).await;
        peer.request(&Message::new(CMD_RS_LIST_REPORTS, 8)).await;

        // the first thing back answers the second request
        let reply = peer.next().await.unwrap();
        assert_eq!(reply.id(), 8);
        assert_eq!(handle.state(), ConnectionState::Serving);
        assert!(handle.is_active());

        drop(peer);
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_requests_are_answered_in_order() {
        let (worker, mut peer) = session(1000);
        let task = tokio::spawn(worker.run());

        let first = Message::new(CMD_RS_RENDER_RESULT, 1).with_field(FIELD_PAYLOAD_SIZE, 2500i32);
        let second = Message::new(CMD_RS_RENDER_RESULT, 2).with_field(FIELD_PAYLOAD_SIZE, 1500i32);
        peer.request(&first).await;
        peer.request(&second).await;

        let mut ids = Vec::new();
        for _ in 0..(1 + 3 + 1 + 2) {
            ids.push(peer.next().await.unwrap().id());
        }
        assert_eq!(ids, vec![1, 1, 1, 1, 2, 2, 2]);

        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_worker_and_is_idempotent() {
        let (worker, mut peer) = session(1024);
        let handle = worker.handle().clone();
        let closed = worker.handler.closed.clone();
        let task = tokio::spawn(worker.run());

        handle.close();
        handle.close();
        task.await.unwrap().unwrap();

        assert!(!handle.is_active());
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(closed.load(Ordering::SeqCst));
        // the server side shut its write half down
        assert!(peer.next().await.is_none());
        assert!(matches!(
            handle.send(&Message::new(CMD_RS_LIST_REPORTS, 1)).await,
            Err(AppError::ConnectionClosed(1))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let (mut client, server) = duplex(1024);
        let (server_read, server_write) = split(server);
        let handle = Arc::new(SessionHandle::new(3, "bad-peer", server_write, None));
        let worker = SessionWorker::new(
            handle.clone(),
            Connection::new(server_read, FrameDecoder::default()),
            RenderHandler::default(),
            OutboundChunker::default(),
        );
        let task = tokio::spawn(worker.run());

        let mut garbage = BytesMut::new();
        Message::new(CMD_RS_LIST_REPORTS, 3).encode(&mut garbage);
        // declare a frame shorter than its own header
        garbage[4..8].copy_from_slice(&4u32.to_be_bytes());
        client.write_all(&garbage).await.unwrap();
        client.flush().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_protocol_error());
        assert!(!handle.is_active());
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_closes_idle_session() {
        let (client, server) = duplex(1024);
        let (server_read, server_write) = split(server);
        let handle = Arc::new(SessionHandle::new(
            9,
            "idle-peer",
            server_write,
            Some(Duration::from_secs(30)),
        ));
        let worker = SessionWorker::new(
            handle.clone(),
            Connection::new(server_read, FrameDecoder::default()),
            RenderHandler::default(),
            OutboundChunker::default(),
        );

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, AppError::Timeout("read")));
        assert_eq!(handle.state(), ConnectionState::Closed);
        drop(client);
    }

    #[tokio::test]
    async fn test_oversize_reply_is_refused_and_closes_session() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let (client_read, client_write) = split(client);
        let handle = Arc::new(
            SessionHandle::new(4, "small-peer", server_write, None).with_max_message_size(128),
        );
        let worker = SessionWorker::new(
            handle.clone(),
            Connection::new(server_read, FrameDecoder::default()),
            RenderHandler::default(),
            OutboundChunker::new(64),
        );
        let task = tokio::spawn(worker.run());
        let mut peer = Peer {
            reader: Connection::new(client_read, FrameDecoder::default()),
            writer: FrameWriter::new(client_write),
        };

        peer.request(&Message::new(CMD_RS_GET_REPORT, 11)).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::InvalidValue(_)));
        assert!(!handle.is_active());
        // no partial or corrupt frame reached the peer
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_stalled_peer() {
        // the peer never reads, so the pipe fills after a few frames
        let (_client, server) = duplex(64);
        let (server_read, server_write) = split(server);
        let handle = Arc::new(SessionHandle::new(5, "stalled-peer", server_write, None));
        let worker = SessionWorker::new(
            handle.clone(),
            Connection::new(server_read, FrameDecoder::default()),
            RenderHandler::default(),
            OutboundChunker::default(),
        );
        let task = tokio::spawn(worker.run());

        let notice = Message::new(CMD_NOTIFY, 0).with_field(1, vec![7u8; 16 * 1024]);
        let sender = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(&notice).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        handle.close();
        assert!(matches!(
            sender.await.unwrap(),
            Err(AppError::ConnectionClosed(5))
        ));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("worker teardown blocked on the stalled peer")
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), ConnectionState::Closed);
    }
}
