use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use clap::Parser;
use dotenv::dotenv;
use reportwire::protocol::codes::CMD_REQUEST_COMPLETED;
use reportwire::{
    setup_local_tracing, setup_tracing, AppResult, Listener, Message, ServerConfig,
    SessionFactory, SessionHandle, SessionHandler, SessionRegistry,
};
use tokio::{runtime, signal};
use tracing::{debug, info};

/// Result code field of a completion reply.
const VID_RCC: u32 = 28;
const RCC_SUCCESS: i32 = 0;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// log to the console only, without the rolling file and otel exporters
    #[arg(short, long)]
    pub local: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Diagnostic handler: acknowledges every request and streams binary
/// request payloads back to the sender.
struct Loopback {
    peer: String,
}

impl SessionHandler for Loopback {
    async fn handle(&mut self, request: Message, payload: &mut BytesMut) -> Option<Message> {
        if let Some(data) = request.payload() {
            payload.extend_from_slice(data);
        }
        Some(
            request
                .reply(CMD_REQUEST_COMPLETED)
                .with_field(VID_RCC, RCC_SUCCESS),
        )
    }

    async fn on_close(&mut self) {
        debug!("loopback session for {} finished", self.peer);
    }
}

struct LoopbackFactory;

impl SessionFactory for LoopbackFactory {
    type Handler = Loopback;

    fn create(&self, session: &Arc<SessionHandle>) -> Loopback {
        Loopback {
            peer: session.peer().to_string(),
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();
    if commandline.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads())
        .thread_name("reportwire-worker")
        .enable_all()
        .build()?;

    let _otel_guard = if commandline.local {
        setup_local_tracing()?;
        None
    } else {
        Some(rt.block_on(setup_tracing())?)
    };

    rt.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> AppResult<()> {
    let port = config.network.port;
    let registry = Arc::new(SessionRegistry::new());
    let mut listener = Listener::new(config, LoopbackFactory, registry);
    let local_addr: SocketAddr = listener.start(port).await?;

    signal::ctrl_c().await?;
    info!("get shutdown signal, stopping {}", local_addr);
    listener.stop().await;
    info!("reportwire shutdown complete");
    Ok(())
}
