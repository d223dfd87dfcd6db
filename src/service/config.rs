use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::{
    FrameDecoder, OutboundChunker, DEFAULT_CHUNK_SIZE, DEFAULT_INITIAL_BUFFER_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use crate::protocol::HEADER_SIZE;
use crate::{AppError, AppResult};

/// Well-known port of the reporting server.
pub const DEFAULT_PORT: u16 = 4710;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Initial size of each connection's read buffer.
    pub initial_buffer_size: usize,
    /// Largest frame a peer may send; bigger frames close the connection.
    pub max_message_size: usize,
    /// Read/write deadline per socket operation in milliseconds; 0 disables it.
    pub io_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connection: 1024,
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            io_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    /// Size of each chunk of a streamed payload.
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tokio worker threads; 0 means one per CPU.
    pub worker_threads: usize,
}

impl RuntimeConfig {
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub runtime: RuntimeConfig,
}

impl ServerConfig {
    /// Load the configuration from `path`, then apply `REPORTWIRE__SECTION__KEY`
    /// environment overrides. Missing keys fall back to their defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("REPORTWIRE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        if network.initial_buffer_size == 0 || network.max_message_size == 0 {
            return Err(AppError::InvalidValue(
                "network buffer sizes must be greater than 0".to_string(),
            ));
        }
        if network.initial_buffer_size > network.max_message_size {
            return Err(AppError::InvalidValue(format!(
                "network.initial_buffer_size {} exceeds network.max_message_size {}",
                network.initial_buffer_size, network.max_message_size
            )));
        }
        let chunk_size = self.transfer.chunk_size;
        // a chunk travels as one binary frame, header included
        let max_chunk = network.max_message_size.saturating_sub(HEADER_SIZE);
        if chunk_size == 0 || chunk_size > max_chunk {
            return Err(AppError::InvalidValue(format!(
                "transfer.chunk_size {} must be within 1..={}",
                chunk_size, max_chunk
            )));
        }
        Ok(())
    }

    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(
            self.network.initial_buffer_size,
            self.network.max_message_size,
        )
    }

    pub fn chunker(&self) -> OutboundChunker {
        OutboundChunker::new(self.transfer.chunk_size)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        match self.network.io_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn listen_address(&self, port: u16) -> String {
        format!("{}:{}", self.network.ip, port)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.port, 4710);
        assert_eq!(config.network.initial_buffer_size, 256 * 1024);
        assert_eq!(config.network.max_message_size, 4 * 1024 * 1024);
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert_eq!(config.io_timeout(), None);
        assert!(config.runtime.worker_threads() >= 1);
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
[network]
ip = "127.0.0.1"
port = 14710
io_timeout_ms = 2500

[transfer]
chunk_size = 8192
"#,
        );
        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.network.port, 14710);
        assert_eq!(config.network.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.transfer.chunk_size, 8192);
        assert_eq!(config.io_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.listen_address(0), "127.0.0.1:0");
        assert_eq!(config.chunker().chunk_size(), 8192);
    }

    #[test]
    fn test_chunk_larger_than_frame_is_rejected() {
        let file = write_config(
            r#"
[network]
max_message_size = 1024

[transfer]
chunk_size = 4096
"#,
        );
        assert!(matches!(
            ServerConfig::set_up_config(file.path()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_initial_buffer_larger_than_maximum_is_rejected() {
        let mut config = ServerConfig::default();
        config.network.initial_buffer_size = config.network.max_message_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            ServerConfig::set_up_config("/nonexistent/reportwire.toml"),
            Err(AppError::ConfigFileError(_))
        ));
    }
}
