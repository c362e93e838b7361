//! Session abstraction over the broker transport
//!
//! The delivery pipeline only depends on [`Session`]. The MQTT implementation lives in
//! [`mqtt`]; tests use [`crate::testing::MockSession`].

use crate::auth::Credentials;
use crate::error::SessionError;
use bytes::Bytes;
use tokio::sync::watch;

pub mod mqtt;

/// Transport-level session state as reported by the session itself
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No session; carries the reason for the last transition
    Disconnected(String),
    /// Connect in progress
    Connecting,
    /// Session established and able to publish
    Connected,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// A live, authenticated connection to the ingestion broker
///
/// Implementations use interior mutability: the supervisor drives `connect`/`disconnect`
/// while the dispatch loop calls `send` concurrently through a shared `Arc<dyn Session>`.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Open a session. Returns once the broker acknowledged it.
    async fn connect(&self, client_id: &str, credentials: &Credentials)
    -> Result<(), SessionError>;

    /// Close the session. Closing an already closed session is not an error.
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Publish one payload. Fails with [`SessionError::NotConnected`] when there is no session.
    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;

    /// Subscribe to state transitions, including drops detected in the background
    fn watch_state(&self) -> watch::Receiver<SessionState>;
}
