//! Ping/pong liveness tracking.
//!
//! One ping is outstanding at a time. Every interval tick either sends the
//! next ping or, if the previous one never got a pong, declares the peer dead.
//! Any pong counts as the answer, solicited or not.

use std::time::Duration;

use crate::error::WsError;

/// What the writer should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    /// The last ping was never answered. `successful` counts the pings that
    /// were answered before it.
    TimedOut { successful: u32 },
}

#[derive(Debug)]
pub struct HeartbeatState {
    interval: Duration,
    awaiting_pong: bool,
    sent_ping_count: u32,
}

impl HeartbeatState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            awaiting_pong: false,
            sent_ping_count: 0,
        }
    }

    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.awaiting_pong {
            return HeartbeatAction::TimedOut {
                successful: self.sent_ping_count.saturating_sub(1),
            };
        }
        self.awaiting_pong = true;
        self.sent_ping_count += 1;
        HeartbeatAction::SendPing
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn sent_ping_count(&self) -> u32 {
        self.sent_ping_count
    }

    /// The error reported when a tick returns [`HeartbeatAction::TimedOut`].
    pub fn timeout_error(&self, successful: u32) -> WsError {
        WsError::HeartbeatTimeout {
            interval_ms: self.interval.as_millis() as u64,
            successful,
        }
    }
}
