//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::mux::INITIAL_STREAM_WINDOW;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of inbound streams awaiting `accept_stream`; streams
    /// opened past this limit are reset
    pub accept_backlog: usize,
    /// Periodically ping the peer to detect dead transports
    pub enable_keepalive: bool,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Upper bound on the per-stream receive window, in bytes
    pub max_stream_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            enable_keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            max_stream_window: INITIAL_STREAM_WINDOW,
        }
    }
}

impl Config {
    /// Check the configuration for values the protocol cannot operate with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.accept_backlog == 0 {
            return Err(crate::Error::Config(
                "accept backlog must be positive".to_string(),
            ));
        }
        if self.enable_keepalive && self.keepalive_interval.is_zero() {
            return Err(crate::Error::Config(
                "keepalive interval must be positive".to_string(),
            ));
        }
        if self.max_stream_window < INITIAL_STREAM_WINDOW {
            return Err(crate::Error::Config(format!(
                "max stream window must be at least {} bytes",
                INITIAL_STREAM_WINDOW
            )));
        }
        Ok(())
    }
}
