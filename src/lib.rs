pub mod network;
pub mod protocol;
mod service;

pub use protocol::{Field, FieldValue, Message, MessageBody};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BroadcastOutcome, ConnectionState,
    Listener, NetworkConfig, OtelGuard, RuntimeConfig, ServerConfig, SessionFactory,
    SessionHandle, SessionHandler, SessionRegistry, SessionWorker, Shutdown, TransferConfig,
    DEFAULT_PORT,
};
