use std::io;

use thiserror::Error;

/// Errors raised by the WebSocket engine.
///
/// Fatal variants end the connection through the single failure path;
/// argument and configuration errors are returned to the caller and leave the
/// connection untouched.
#[derive(Debug, Error)]
pub enum WsError {
    /// Malformed frame or illegal protocol state (RFC 6455 Section 5, 7).
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The HTTP upgrade response did not satisfy RFC 6455 Section 4.1.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// A ping went unanswered for a full heartbeat interval.
    #[error(
        "sent ping but didn't receive pong within {interval_ms}ms \
         (after {successful} successful ping/pongs)"
    )]
    HeartbeatTimeout { interval_ms: u64, successful: u32 },
    /// I/O failure on the underlying byte stream.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The connection was torn down by `cancel()` or the close timer.
    #[error("connection cancelled")]
    Cancelled,
    /// An inbound message grew past the configured maximum.
    #[error("message too big: {size} bytes (max: {max})")]
    MessageTooBig { size: u64, max: u64 },
    /// A caller-supplied close code outside the legal ranges. Illegal codes
    /// received from the peer are reported as [`WsError::Protocol`].
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WsError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WsError::Protocol(msg.into())
    }

    /// Whether this error terminates the connection when raised by the
    /// reader or writer.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            WsError::InvalidArgument(_) | WsError::InvalidCloseCode(_) | WsError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WsError>;
