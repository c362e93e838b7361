//! Reconnection loop around a [`Session`]

use super::backoff::BackoffPolicy;
use super::events::ConnectionEvent;
use crate::auth::CredentialProvider;
use crate::error::{sanitize_error_message, ErrorClass, SdkError, SessionError};
use crate::transport::{Session, SessionState};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long `stop` waits for the loop to unwind before aborting it
const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct SupervisorShared {
    session: Arc<dyn Session>,
    credentials: Arc<dyn CredentialProvider>,
    client_id: String,
    policy: BackoffPolicy,
    events: broadcast::Sender<ConnectionEvent>,
    /// Whether `Connected` was the last notification published
    reported_connected: AtomicBool,
}

impl SupervisorShared {
    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn mark_connected(&self) {
        if !self.reported_connected.swap(true, Ordering::SeqCst) {
            self.emit(ConnectionEvent::Connected);
        }
    }

    fn mark_disconnected(&self, reason: String) {
        if self.reported_connected.swap(false, Ordering::SeqCst) {
            self.emit(ConnectionEvent::Disconnected { reason });
        }
    }

    /// Fresh credentials, then a session
    async fn connect_once(&self) -> Result<(), SessionError> {
        let credentials = self.credentials.current().await?;
        self.session.connect(&self.client_id, &credentials).await
    }
}

struct SupervisorTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps a session to the broker alive until stopped
///
/// Connect failures of every kind are retried under capped exponential backoff and reported
/// as [`ConnectionEvent::ConnectFailed`]; none of them reach the caller of [`start`](Self::start).
pub struct ConnectionSupervisor {
    shared: Arc<SupervisorShared>,
    task: Mutex<Option<SupervisorTask>>,
}

impl ConnectionSupervisor {
    pub fn new(
        session: Arc<dyn Session>,
        credentials: Arc<dyn CredentialProvider>,
        client_id: impl Into<String>,
        policy: BackoffPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(SupervisorShared {
                session,
                credentials,
                client_id: client_id.into(),
                policy,
                events,
                reported_connected: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Start the reconnection loop. Fails if it is already running.
    pub async fn start(&self) -> Result<(), SdkError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(SdkError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let span = crate::connection_span!(
            client_id = %shared.client_id,
            credentials = %shared.credentials.name()
        );
        let handle = tokio::spawn(Self::run(shared, shutdown_rx).instrument(span));

        *task = Some(SupervisorTask {
            shutdown_tx,
            handle,
        });
        info!(client_id = %self.shared.client_id, "Connection supervisor started");
        Ok(())
    }

    /// Cancel the loop, wait for it to unwind, then close the session.
    ///
    /// Stopping a supervisor that is not running only closes the session.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(SupervisorTask {
            shutdown_tx,
            handle,
        }) = task
        {
            let _ = shutdown_tx.send(true);
            let abort = handle.abort_handle();
            match tokio::time::timeout(LOOP_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Connection loop exited"),
                Ok(Err(e)) if !e.is_cancelled() => error!("Connection loop panicked: {}", e),
                Err(_) => {
                    warn!("Connection loop did not exit in time, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        if let Err(e) = self.shared.session.disconnect().await {
            warn!(error = %e, "Error while closing session");
        }
        self.shared
            .mark_disconnected("Connection supervisor stopped".to_string());
        info!(client_id = %self.shared.client_id, "Connection supervisor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Transport-level connectedness, safe to poll from any task
    pub fn is_connected(&self) -> bool {
        self.shared.session.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Send through the current session
    pub async fn send(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected {
                reason: "no active session".to_string(),
            });
        }
        self.shared.session.send(topic, payload).await
    }

    async fn run(shared: Arc<SupervisorShared>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = shared.policy.start();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            attempt = attempt.saturating_add(1);
            debug!(attempt, "Connecting to broker");

            let outcome = tokio::select! {
                _ = shutdown_rx.changed() => break,
                outcome = shared.connect_once() => outcome,
            };

            match outcome {
                Ok(()) => {
                    info!(attempt, "Connected to broker");
                    backoff.reset();
                    attempt = 0;
                    shared.mark_connected();

                    let mut state_rx = shared.session.watch_state();
                    let reason = tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        reason = wait_for_disconnect(&mut state_rx) => reason,
                    };
                    warn!(reason = %reason, "Broker connection lost");
                    shared.mark_disconnected(reason);
                }
                Err(e) => {
                    if e.is_auth() {
                        shared.credentials.invalidate().await;
                    }

                    let delay = backoff.next_delay();
                    let message = sanitize_error_message(&e.to_string());
                    match e.class() {
                        ErrorClass::Unexpected => error!(
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Unexpected connect failure"
                        ),
                        _ => warn!(
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Connect attempt failed"
                        ),
                    }
                    shared.emit(ConnectionEvent::ConnectFailed {
                        attempt,
                        retry_in: delay,
                        error: message,
                    });

                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!("Connection loop observed stop signal");
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.handle.abort();
            }
        }
    }
}

/// Resolve with the reason once the session reports it is no longer connected
async fn wait_for_disconnect(state_rx: &mut watch::Receiver<SessionState>) -> String {
    loop {
        let state = state_rx.borrow_and_update().clone();
        if let SessionState::Disconnected(reason) = state {
            return reason;
        }
        if state_rx.changed().await.is_err() {
            return "Session state channel closed".to_string();
        }
    }
}
