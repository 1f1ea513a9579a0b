//! Network transports feeding the event gateway.

pub mod websocket;

use std::time::Duration;

pub use websocket::WsTransport;

/// Liveness settings shared by transports.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// A peer silent for this long is considered gone.
    pub heartbeat_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}
