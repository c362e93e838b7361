//! Mock implementations for testing
//!
//! Provides a scriptable [`Session`] and [`CredentialProvider`] so the delivery pipeline can
//! be exercised without a broker or identity provider.

use crate::auth::{CredentialProvider, Credentials};
use crate::error::{AuthError, SessionError};
use crate::transport::{Session, SessionState};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

pub type SentMessage = (String, Bytes);

/// In-memory session that records every payload it accepts
///
/// Failures are scripted with counters: each `fail_next_*` call makes that many upcoming
/// operations fail with a transient error before the mock behaves normally again.
#[derive(Debug)]
pub struct MockSession {
    state_tx: watch::Sender<SessionState>,
    sent: Mutex<Vec<SentMessage>>,
    connect_failures: AtomicU32,
    connect_refusals: AtomicU32,
    send_failures: AtomicU32,
    connect_calls: AtomicU32,
    send_calls: AtomicU32,
    last_client_id: Mutex<Option<String>>,
    last_credentials: Mutex<Option<Credentials>>,
}

impl MockSession {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected("Not connected".into()));
        Self {
            state_tx,
            sent: Mutex::new(Vec::new()),
            connect_failures: AtomicU32::new(0),
            connect_refusals: AtomicU32::new(0),
            send_failures: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            send_calls: AtomicU32::new(0),
            last_client_id: Mutex::new(None),
            last_credentials: Mutex::new(None),
        }
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Make upcoming connects fail as if the broker refused the credentials
    pub fn reject_next_connects(&self, count: u32) {
        self.connect_refusals.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    /// Drop the session as if the broker went away
    pub fn simulate_drop(&self, reason: &str) {
        self.state_tx
            .send_replace(SessionState::Disconnected(reason.to_string()));
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn last_client_id(&self) -> Option<String> {
        self.last_client_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_credentials(&self) -> Option<Credentials> {
        self.last_credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn connect(
        &self,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<(), SessionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_client_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(client_id.to_string());
        *self
            .last_credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());

        if Self::take_failure(&self.connect_refusals) {
            self.state_tx
                .send_replace(SessionState::Disconnected("Mock credential refusal".into()));
            return Err(SessionError::Auth(AuthError::BrokerRejected(
                "NotAuthorized".to_string(),
            )));
        }
        if Self::take_failure(&self.connect_failures) {
            self.state_tx
                .send_replace(SessionState::Disconnected("Mock connect failure".into()));
            return Err(SessionError::ConnectionFailedStr(
                "Mock connect failure".to_string(),
            ));
        }

        self.state_tx.send_replace(SessionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.state_tx
            .send_replace(SessionState::Disconnected("Client disconnected".into()));
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(SessionError::NotConnected {
                reason: "mock session is down".to_string(),
            });
        }
        if Self::take_failure(&self.send_failures) {
            return Err(SessionError::PublishFailed("Mock publish failure".into()));
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

/// Credential provider that hands out numbered static tokens
#[derive(Debug, Default)]
pub struct MockCredentialProvider {
    failures: AtomicU32,
    issued: AtomicU32,
    invalidations: AtomicU32,
}

impl MockCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> u32 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for MockCredentialProvider {
    async fn current(&self) -> Result<Credentials, AuthError> {
        if MockSession::take_failure(&self.failures) {
            return Err(AuthError::GrantRejected {
                grant: "password",
                message: "mock rejection".to_string(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials::basic("mock-user", format!("token-{n}")))
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "mock"
    }
}
