//! # Wiremux
//!
//! A stream multiplexer that carries many logically independent,
//! bidirectional byte streams over a single reliable, ordered transport
//! (typically a TCP connection).
//!
//! ## Features
//!
//! - **Lightweight streams**: open many logical streams over one
//!   connection, each with its own half-close semantics and reset
//! - **Credit-based flow control**: per-stream sliding windows with
//!   suppressed small updates to keep control chatter low
//! - **Deadlines**: per-direction read/write deadlines that interrupt
//!   blocked I/O
//! - **Keepalive**: optional ping-based liveness checking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │          (per-stream read / write / close)           │
//! ├─────────────────────────────────────────────────────┤
//! │                   Stream Layer                       │
//! │    (state machine, windows, deadlines, wakeups)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                      │
//! │   (framing, routing, keepalive, goaway, shutdown)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │        (any AsyncRead + AsyncWrite byte pipe)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod mux;

pub use config::Config;
pub use mux::{MuxError, Session, Stream};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Configuration error: {0}")]
    Config(String),
}
