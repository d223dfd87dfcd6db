pub use app_error::{AppError, AppResult};
pub use config::{NetworkConfig, RuntimeConfig, ServerConfig, TransferConfig, DEFAULT_PORT};
pub use registry::{BroadcastOutcome, SessionRegistry};
pub use server::Listener;
pub use session::{ConnectionState, SessionFactory, SessionHandle, SessionHandler, SessionWorker};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, OtelGuard};

mod app_error;
mod config;
mod registry;
mod server;
mod session;
mod shutdown;
mod tracing_config;
