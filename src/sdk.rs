//! The public entry point
//!
//! [`EventSdk`] wires the queue, the connection supervisor and the dispatch loop together and
//! guards them with a small lifecycle:
//!
//! ```text
//! Created -> Started -> Stopped -> Started -> ... -> Disposed
//! ```
//!
//! Only misuse errors are returned from here. Broker, network and auth failures are retried
//! in the background and show up as [`ConnectionEvent`]s and log lines.

use crate::auth::{CredentialProvider, NoAuth, OAuthConfig, OAuthCredentialProvider, StaticCredentials};
use crate::config::{AuthKind, AuthSection, ConfigError, SdkConfig};
use crate::connection::{ConnectionEvent, ConnectionSupervisor};
use crate::dispatch::{DispatchStatsSnapshot, Dispatcher};
use crate::error::{SdkError, SdkResult};
use crate::protocol::{EventMessage, RoutingKey};
use crate::queue::{build_queue, DeliveryCallback, Envelope, QueueStrategy};
use crate::transport::mqtt::MqttSession;
use crate::transport::Session;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Drain timeout used when [`ShutdownOptions::timeout`] is unset
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownOptions {
    /// Wait for queued and in-flight events to be delivered before stopping the loops
    pub wait_for_empty_queue: bool,
    /// Bound on the drain wait; the configured default applies when unset
    pub timeout: Option<Duration>,
}

impl ShutdownOptions {
    /// Stop right away, leaving the backlog in the queue
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn drain(timeout: Option<Duration>) -> Self {
        Self {
            wait_for_empty_queue: true,
            timeout,
        }
    }
}

/// Outcome of [`EventSdk::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Nothing was pending when the loops stopped
    pub drained: bool,
    /// A drain was requested and its timeout elapsed first
    pub timed_out: bool,
    /// Events left in the queue
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Stopped,
    Disposed,
}

struct Forwarder {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Event delivery client
pub struct EventSdk {
    organization_id: String,
    project_id: String,
    queue: Arc<dyn QueueStrategy>,
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: Dispatcher,
    events: broadcast::Sender<ConnectionEvent>,
    /// Read synchronously by `send_message` and the introspection calls
    state: StdMutex<LifecycleState>,
    /// Serializes start, stop and dispose
    transition: Mutex<()>,
    forwarder: Mutex<Option<Forwarder>>,
    default_drain_timeout: Duration,
}

impl EventSdk {
    /// Build an SDK around an explicit session and credential provider
    pub fn new(
        config: &SdkConfig,
        session: Arc<dyn Session>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> SdkResult<Self> {
        config.validate()?;

        let queue = build_queue(config.queue.strategy, config.queue.capacity);
        let supervisor = Arc::new(ConnectionSupervisor::new(
            session,
            credentials,
            config.sdk.client_id.clone(),
            config.reconnect.policy(),
        ));
        let dispatcher = Dispatcher::new(queue.clone(), supervisor.clone(), config.dispatch.policy());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            organization_id: config.sdk.organization_id.clone(),
            project_id: config.sdk.project_id.clone(),
            queue,
            supervisor,
            dispatcher,
            events,
            state: StdMutex::new(LifecycleState::Created),
            transition: Mutex::new(()),
            forwarder: Mutex::new(None),
            default_drain_timeout: config.drain_timeout(),
        })
    }

    /// Build an SDK that talks MQTT to the configured broker
    pub fn from_config(config: &SdkConfig) -> SdkResult<Self> {
        let session: Arc<dyn Session> = Arc::new(MqttSession::new(config.broker.clone()));
        let credentials = build_credential_provider(&config.auth)?;
        Self::new(config, session, credentials)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Start the connection supervisor and the dispatch loop.
    ///
    /// Returns once both loops are running; connecting happens in the background.
    pub async fn start(&self) -> SdkResult<()> {
        let _transition = self.transition.lock().await;
        match self.state() {
            LifecycleState::Disposed => return Err(SdkError::Disposed),
            LifecycleState::Started => return Err(SdkError::AlreadyStarted),
            LifecycleState::Created | LifecycleState::Stopped => {}
        }

        let span = crate::lifecycle_span!(operation = "start", client_id = %self.supervisor.client_id());
        async {
            self.ensure_forwarder().await;
            self.supervisor.start().await?;
            if let Err(e) = self.dispatcher.start_processing().await {
                self.supervisor.stop().await;
                return Err(e);
            }
            self.set_state(LifecycleState::Started);
            info!(
                organization_id = %self.organization_id,
                project_id = %self.project_id,
                pending = self.dispatcher.pending_count(),
                "Event SDK started"
            );
            Ok::<(), SdkError>(())
        }
        .instrument(span)
        .await
    }

    /// Stop accepting events, optionally drain, then stop the dispatch loop and the supervisor
    pub async fn stop(&self, options: ShutdownOptions) -> SdkResult<ShutdownReport> {
        let _transition = self.transition.lock().await;
        match self.state() {
            LifecycleState::Disposed => return Err(SdkError::Disposed),
            LifecycleState::Created | LifecycleState::Stopped => return Err(SdkError::NotStarted),
            LifecycleState::Started => {}
        }

        let span = crate::lifecycle_span!(operation = "stop", client_id = %self.supervisor.client_id());
        Ok(self.shutdown_loops(options).instrument(span).await)
    }

    async fn shutdown_loops(&self, options: ShutdownOptions) -> ShutdownReport {
        self.set_state(LifecycleState::Stopped);

        let mut timed_out = false;
        if options.wait_for_empty_queue {
            let timeout = options.timeout.unwrap_or(self.default_drain_timeout);
            info!(
                pending = self.dispatcher.pending_count(),
                timeout_ms = timeout.as_millis() as u64,
                "Waiting for pending events to be delivered"
            );
            if !self.dispatcher.wait_until_drained(timeout).await {
                timed_out = true;
                warn!(
                    pending = self.dispatcher.pending_count(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for the queue to drain; stopping anyway"
                );
            }
        }

        self.dispatcher.stop_processing().await;
        self.supervisor.stop().await;

        let pending = self.dispatcher.pending_count();
        info!(pending, "Event SDK stopped");
        ShutdownReport {
            drained: pending == 0,
            timed_out,
            pending,
        }
    }

    /// Queue an event for delivery.
    ///
    /// Never waits on the network. The callback runs on the dispatch task once the broker
    /// accepted the event.
    pub fn send_message(
        &self,
        message: EventMessage,
        callback: Option<DeliveryCallback>,
    ) -> SdkResult<Uuid> {
        match self.state() {
            LifecycleState::Disposed => return Err(SdkError::Disposed),
            LifecycleState::Created | LifecycleState::Stopped => return Err(SdkError::NotStarted),
            LifecycleState::Started => {}
        }

        let message_id = message.message_id();
        let entity_id = message
            .entity_id()
            .ok_or(SdkError::MissingEntity { message_id })?
            .to_string();

        let routing_key = RoutingKey::new(&self.organization_id, &self.project_id, entity_id);
        self.queue
            .enqueue(Envelope::new(routing_key, message, callback))
            .map_err(|full| SdkError::QueueFull {
                capacity: full.capacity,
            })?;

        debug!(message_id = %message_id, pending = self.queue.count(), "Event queued");
        Ok(message_id)
    }

    pub fn is_connected(&self) -> bool {
        self.state() != LifecycleState::Disposed && self.supervisor.is_connected()
    }

    pub fn has_messages_pending_for_dispatch(&self) -> bool {
        self.dispatcher.has_pending()
    }

    pub fn messages_pending_for_dispatch_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    /// Connection notifications. Slow receivers lag rather than block the supervisor.
    pub fn subscribe(&self) -> SdkResult<broadcast::Receiver<ConnectionEvent>> {
        if self.state() == LifecycleState::Disposed {
            return Err(SdkError::Disposed);
        }
        Ok(self.events.subscribe())
    }

    /// Stop if running, detach from the supervisor's events and mark the SDK unusable
    pub async fn dispose(&self) -> SdkResult<()> {
        let _transition = self.transition.lock().await;
        if self.state() == LifecycleState::Disposed {
            return Err(SdkError::Disposed);
        }
        // Also covers a stop whose drain wait was cancelled before the loops were stopped.
        if self.dispatcher.is_running().await || self.supervisor.is_running().await {
            self.shutdown_loops(ShutdownOptions::immediate()).await;
        }

        if let Some(Forwarder {
            shutdown_tx,
            handle,
        }) = self.forwarder.lock().await.take()
        {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Event forwarder ended with error: {}", e);
                }
            }
        }

        self.set_state(LifecycleState::Disposed);
        info!(pending = self.queue.count(), "Event SDK disposed");
        Ok(())
    }

    /// Forward supervisor events to our own subscribers until disposal
    async fn ensure_forwarder(&self) {
        let mut forwarder = self.forwarder.lock().await;
        if forwarder.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut source = self.supervisor.subscribe();
        let sink = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        while let Ok(event) = source.try_recv() {
                            let _ = sink.send(event);
                        }
                        break;
                    }
                    received = source.recv() => match received {
                        Ok(event) => {
                            let _ = sink.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Connection event forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        *forwarder = Some(Forwarder {
            shutdown_tx,
            handle,
        });
    }
}

impl Drop for EventSdk {
    fn drop(&mut self) {
        if let Ok(mut forwarder) = self.forwarder.try_lock() {
            if let Some(forwarder) = forwarder.take() {
                forwarder.handle.abort();
            }
        }
    }
}

/// Credential provider for the configured auth kind. Secrets come from the environment.
pub fn build_credential_provider(auth: &AuthSection) -> SdkResult<Arc<dyn CredentialProvider>> {
    match auth.kind {
        AuthKind::None => Ok(Arc::new(NoAuth)),
        AuthKind::Static => {
            let (username_env, password_env) = credential_env_names(auth)?;
            Ok(Arc::new(StaticCredentials::from_env(
                username_env,
                password_env,
            )?))
        }
        AuthKind::OAuth => {
            let (username_env, password_env) = credential_env_names(auth)?;
            let issuer_url = auth.issuer_url.clone().ok_or_else(|| {
                ConfigError::InvalidConfig("oauth auth requires auth.issuer_url".to_string())
            })?;
            let client_id = auth.oauth_client_id.clone().ok_or_else(|| {
                ConfigError::InvalidConfig("oauth auth requires auth.oauth_client_id".to_string())
            })?;

            let config = OAuthConfig {
                issuer_url,
                client_id,
                client_secret: SdkConfig::get_env_var_optional(auth.client_secret_env.as_ref()),
                username: SdkConfig::get_env_var_required(username_env)?,
                password: SdkConfig::get_env_var_required(password_env)?,
                token_skew: Duration::from_secs(auth.token_skew_secs),
                request_timeout: Duration::from_secs(auth.http_timeout_secs),
            };
            Ok(Arc::new(OAuthCredentialProvider::new(config)?))
        }
    }
}

fn credential_env_names(auth: &AuthSection) -> Result<(&str, &str), ConfigError> {
    match (&auth.username_env, &auth.password_env) {
        (Some(username_env), Some(password_env)) => Ok((username_env.as_str(), password_env.as_str())),
        _ => Err(ConfigError::InvalidConfig(
            "auth requires auth.username_env and auth.password_env".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EntityReference;
    use crate::testing::MockSession;
    use serde_json::json;

    fn sdk() -> (EventSdk, Arc<MockSession>) {
        let session = Arc::new(MockSession::new());
        let sdk = EventSdk::new(
            &SdkConfig::local("acme", "web", "sdk-unit"),
            session.clone(),
            Arc::new(NoAuth),
        )
        .unwrap();
        (sdk, session)
    }

    fn event(entity: &str) -> EventMessage {
        EventMessage::new("button.clicked", json!({})).with_entity(EntityReference::new(entity))
    }

    #[tokio::test]
    async fn test_send_before_start_is_rejected() {
        let (sdk, _) = sdk();
        assert!(matches!(
            sdk.send_message(event("u1"), None),
            Err(SdkError::NotStarted)
        ));
        assert_eq!(sdk.messages_pending_for_dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_entity_is_rejected() {
        let (sdk, _) = sdk();
        sdk.start().await.unwrap();
        let result = sdk.send_message(EventMessage::new("button.clicked", json!({})), None);
        assert!(matches!(result, Err(SdkError::MissingEntity { .. })));
        assert!(!sdk.has_messages_pending_for_dispatch());
        sdk.stop(ShutdownOptions::immediate()).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (sdk, _) = sdk();
        assert_eq!(sdk.state(), LifecycleState::Created);
        assert!(matches!(
            sdk.stop(ShutdownOptions::immediate()).await,
            Err(SdkError::NotStarted)
        ));

        sdk.start().await.unwrap();
        assert!(matches!(sdk.start().await, Err(SdkError::AlreadyStarted)));

        sdk.stop(ShutdownOptions::immediate()).await.unwrap();
        assert_eq!(sdk.state(), LifecycleState::Stopped);

        sdk.start().await.unwrap();
        sdk.dispose().await.unwrap();
        assert_eq!(sdk.state(), LifecycleState::Disposed);
        assert!(matches!(sdk.dispose().await, Err(SdkError::Disposed)));
        assert!(matches!(sdk.start().await, Err(SdkError::Disposed)));
    }

    #[test]
    fn test_credential_provider_for_none() {
        let provider = build_credential_provider(&AuthSection::default()).unwrap();
        assert_eq!(provider.name(), "none");
    }

    #[test]
    fn test_static_provider_requires_env_names() {
        let auth = AuthSection {
            kind: AuthKind::Static,
            ..AuthSection::default()
        };
        assert!(matches!(
            build_credential_provider(&auth),
            Err(SdkError::Config(ConfigError::InvalidConfig(_)))
        ));
    }
}
