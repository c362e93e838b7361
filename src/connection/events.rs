use std::time::Duration;

/// Connection notifications published by the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Entered the connected state
    Connected,
    /// Left the connected state, including on explicit stop
    Disconnected { reason: String },
    /// A connect attempt failed; the next one starts after `retry_in`
    ConnectFailed {
        attempt: u32,
        retry_in: Duration,
        error: String,
    },
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected)
    }
}
