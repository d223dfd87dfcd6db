//! Network Module Implementation
//!
//! This module provides the transport plumbing for client sessions:
//! turning a socket's byte stream into messages and messages back into
//! bytes.
//!
//! # Components
//!
//! - `FrameDecoder`: validates frame sizes and parses whole frames out of a buffer
//! - `Connection`: buffered read half of a socket, yields one `Message` per frame
//! - `FrameWriter`: buffered write half of a socket
//! - `OutboundChunker`: splits large payloads into bounded binary messages
//!
//! Decoding never spans connections: each connection owns its buffer and
//! its decoder.

pub use chunker::{Chunks, OutboundChunker, DEFAULT_CHUNK_SIZE};
pub use connection::{Connection, FrameWriter};
pub use frame::{FrameDecoder, DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
mod chunker;
mod connection;
mod frame;
