//! Connection tunables.
//!
//! [`WsConfig`] has a default for every field and can be loaded from a TOML
//! table. [`WsConfig::validate`] runs before a connection starts.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WsError};

/// Outgoing queue limit (16 MiB). Sends beyond it trigger a "going away" close.
pub const DEFAULT_MAX_QUEUE_SIZE: u64 = 16 * 1024 * 1024;

/// Inbound message limit (64 MiB), protecting against malicious 64-bit lengths.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// How long a graceful close waits for the peer's close frame.
pub const DEFAULT_CANCEL_AFTER_CLOSE_MS: u64 = 60_000;

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Tunables for one WebSocket connection.
///
/// Every field has a default, so a config file only needs the keys it
/// overrides:
///
/// ```toml
/// ping_interval_ms = 30000
/// cancel_after_close_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WsConfig {
    /// Heartbeat period. 0 disables heartbeats.
    pub ping_interval_ms: u64,
    /// Default bound on the closing handshake for `close()`.
    pub cancel_after_close_ms: u64,
    /// Maximum bytes of message payload waiting in the outgoing queue.
    pub max_queue_size: u64,
    /// Maximum size of one assembled inbound message.
    pub max_message_size: u64,
    /// Read deadline while waiting for the 101 response. 0 waits forever.
    pub handshake_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 0,
            cancel_after_close_ms: DEFAULT_CANCEL_AFTER_CLOSE_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl WsConfig {
    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<WsConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WsError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Parse a TOML config string and validate it.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<WsConfig> {
        let config: WsConfig = toml::from_str(content)
            .map_err(|e| WsError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(WsError::Config("max_queue_size must be positive".into()));
        }
        if self.max_message_size == 0 {
            return Err(WsError::Config("max_message_size must be positive".into()));
        }
        if self.cancel_after_close_ms == 0 {
            return Err(WsError::Config("cancel_after_close_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn cancel_after_close(mut self, timeout: Duration) -> Self {
        self.cancel_after_close_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_queue_size(mut self, bytes: u64) -> Self {
        self.max_queue_size = bytes;
        self
    }

    pub fn max_message_size(mut self, bytes: u64) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// The heartbeat period, or `None` when heartbeats are disabled.
    pub fn heartbeat_period(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub(crate) fn handshake_deadline(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }
}
