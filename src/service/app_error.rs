// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// protocol errors, fatal to the connection that produced them
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("frame of length {size} exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O errors, fatal to the connection that produced them
    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    /// listener errors
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept error: {0}")]
    Accept(String),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Whether the error came from bytes the peer sent rather than from the
    /// socket itself. Both close the connection; this only changes how the
    /// failure is logged.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            AppError::MalformedProtocol(_) | AppError::FrameTooLarge { .. }
        )
    }
}
