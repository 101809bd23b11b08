//! Stream multiplexing layer
//!
//! Provides:
//! - Frame header encoding/decoding
//! - Session management over a single transport
//! - Flow-controlled logical streams with deadlines

mod frame;
mod session;
mod stream;

pub use frame::{
    FrameType, Header, FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN, GOAWAY_INTERNAL_ERROR,
    GOAWAY_NORMAL, GOAWAY_PROTOCOL_ERROR, HEADER_SIZE, PROTO_VERSION,
};
pub use session::Session;
pub use stream::{Stream, StreamState};

use thiserror::Error;

/// Initial size of both per-stream flow-control windows (256 KiB)
pub const INITIAL_STREAM_WINDOW: u32 = 262_144;

/// Multiplexing layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read or write deadline exceeded")]
    Timeout,

    #[error("stream closed")]
    StreamClosed,

    #[error("stream reset by peer")]
    ConnectionReset,

    #[error("receive window exceeded (stream: {id}, available: {available}, got: {length})")]
    RecvWindowExceeded { id: u32, available: u32, length: u32 },

    #[error("unexpected FIN flag")]
    UnexpectedFlag,

    #[error("session shutdown")]
    SessionShutdown,

    #[error("remote side is not accepting new streams")]
    RemoteGoAway,

    #[error("stream id space exhausted")]
    StreamsExhausted,

    #[error("duplicate stream id: {0}")]
    DuplicateStream(u32),

    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),

    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("keepalive timed out")]
    KeepAliveTimeout,
}
