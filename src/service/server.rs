use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::Connection;
use crate::service::{
    ServerConfig, SessionFactory, SessionHandle, SessionRegistry, SessionWorker, Shutdown,
};
use crate::AppError;
use crate::AppResult;

/// Accepts client connections and runs one session per connection.
///
/// Stopping is graceful:
/// 1. the accept loop is cancelled by the shutdown signal, which also closes the listening socket,
/// 2. every registered session is asked to close, which interrupts its read or write,
/// 3. each session worker runs its handler's close hook and deregisters,
/// 4. once the last worker drops its `shutdown_complete_tx`, `stop` returns.
pub struct Listener<F: SessionFactory> {
    config: Arc<ServerConfig>,
    factory: Arc<F>,
    registry: Arc<SessionRegistry>,
    notify_shutdown: broadcast::Sender<()>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl<F: SessionFactory> Listener<F> {
    pub fn new(config: ServerConfig, factory: F, registry: Arc<SessionRegistry>) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        Listener {
            config: Arc::new(config),
            factory: Arc::new(factory),
            registry,
            notify_shutdown,
            running: None,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listening socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Binds `port` on the configured interface and starts accepting in the
    /// background. Port 0 picks an ephemeral port; the bound address is
    /// returned either way.
    pub async fn start(&mut self, port: u16) -> AppResult<SocketAddr> {
        if self.running.is_some() {
            return Err(AppError::IllegalStateError(
                "listener is already running".to_string(),
            ));
        }

        let address = self.config.listen_address(port);
        let listener = TcpListener::bind(&address).await.map_err(|source| {
            error!("failed to bind {}: {}", address, source);
            AppError::Bind {
                addr: address.clone(),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!("reportwire listening on {}", local_addr);

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let server = Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(self.config.network.max_connection)),
            shutdown_complete_tx,
            next_session_id: AtomicU64::new(1),
            config: self.config.clone(),
            factory: self.factory.clone(),
            registry: self.registry.clone(),
        };

        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let accept_task = tokio::spawn(async move {
            tokio::select! {
                res = server.run() => {
                    if let Err(err) = res {
                        error!(cause = %err, "accept loop failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                }
            }
        });

        self.running = Some(Running {
            local_addr,
            accept_task,
            shutdown_complete_rx,
        });
        Ok(local_addr)
    }

    /// Stops accepting, closes every session and waits for all session
    /// tasks to finish. Does nothing if the listener is not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Running {
            local_addr,
            accept_task,
            mut shutdown_complete_rx,
        } = running;

        info!("stopping listener on {}", local_addr);
        // no receiver left means the accept loop already exited on its own
        let _ = self.notify_shutdown.send(());
        self.registry.close_all();

        if let Err(e) = accept_task.await {
            error!("accept loop task failed: {}", e);
        }
        // catch connections accepted between the signal and the loop exit
        self.registry.close_all();

        // every session task holds a sender; recv yields None once all are gone
        let _ = shutdown_complete_rx.recv().await;
        info!("listener on {} stopped", local_addr);
    }
}

struct Server<F: SessionFactory> {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    shutdown_complete_tx: mpsc::Sender<()>,
    next_session_id: AtomicU64,
    config: Arc<ServerConfig>,
    factory: Arc<F>,
    registry: Arc<SessionRegistry>,
}

impl<F: SessionFactory> Server<F> {
    /// Accepts connections until an unrecoverable accept error. Each
    /// connection holds a permit so that at most `max_connection` sessions
    /// are served at once.
    async fn run(&self) -> AppResult<()> {
        let decoder = self.config.decoder();
        let chunker = self.config.chunker();
        let io_timeout = self.config.io_timeout();
        let max_message_size = self.config.network.max_message_size;

        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(e.to_string()))?;

            let (socket, peer) = self.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let (reader, writer) = socket.into_split();
            let handle = Arc::new(
                SessionHandle::new(session_id, peer.to_string(), writer, io_timeout)
                    .with_max_message_size(max_message_size),
            );
            let handler = self.factory.create(&handle);
            let worker = SessionWorker::new(
                handle.clone(),
                Connection::new(reader, decoder),
                handler,
                chunker,
            );
            self.registry.add(handle);
            info!(
                monotonic_counter.sessions_accepted = 1u64,
                session = session_id,
                peer = %peer,
                "accepted connection"
            );

            let registry = self.registry.clone();
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                match worker.run().await {
                    Ok(()) => {}
                    Err(err) if err.is_protocol_error() => {
                        warn!(session = session_id, "protocol error: {}", err);
                    }
                    Err(err) => {
                        error!(session = session_id, "connection error: {}", err);
                    }
                }
                registry.remove(session_id);
                info!(session = session_id, peer = %peer, "connection closed");
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
                drop(shutdown_complete_tx);
            });
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(err.to_string()));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl<F: SessionFactory> Drop for Server<F> {
    fn drop(&mut self) {
        debug!("accept loop dropped");
    }
}
