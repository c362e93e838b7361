//! Impure I/O for the MQTT session
//!
//! Each connect builds a fresh rumqttc client and event loop. A spawned poll task drives the
//! event loop and publishes [`SessionState`] transitions; it exits on the first connection
//! error instead of reconnecting, because reconnection (with fresh credentials) belongs to
//! the connection supervisor.
//!
//! `send` resolves only once the broker has acknowledged the QoS 1 publish. A session that
//! drops before the PubAck arrives reports the send as not delivered, so the caller keeps the
//! message and publishes it again on the next session.

use super::connection::configure_mqtt_options;
use super::message_handler::{EventRoute, MessageHandler};
use crate::auth::Credentials;
use crate::config::BrokerSection;
use crate::error::SessionError;
use crate::transport::{Session, SessionState};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect` waits for the poll task before aborting it
const POLL_TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `send` waits for the broker's PubAck
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(30);

type ConnAckSender = oneshot::Sender<Result<(), SessionError>>;

/// MQTT v5 session publishing at QoS 1
pub struct MqttSession {
    broker: BrokerSection,
    client: Mutex<Option<AsyncClient>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<SessionState>,
    /// Publish progress from the current poll task. Held for the whole of `send`, which
    /// keeps at most one publish outstanding.
    publish_rx: Mutex<Option<mpsc::UnboundedReceiver<EventRoute>>>,
}

impl MqttSession {
    pub fn new(broker: BrokerSection) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected("Not connected".into()));
        Self {
            broker,
            client: Mutex::new(None),
            poll_handle: Mutex::new(None),
            state_tx,
            publish_rx: Mutex::new(None),
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.connect_timeout_secs)
    }

    fn spawn_poll_task(
        client_id: String,
        mut event_loop: EventLoop,
        state_tx: watch::Sender<SessionState>,
        publish_tx: mpsc::UnboundedSender<EventRoute>,
        connack_tx: ConnAckSender,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(client_id = %client_id, "MQTT poll task started");
            let mut connack_tx = Some(connack_tx);
            loop {
                match event_loop.poll().await {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        if let EventRoute::InfrastructureEvent(ref detail) = route {
                            tracing::trace!(target: "mqtt_transport", "MQTT event: {}", detail);
                        }
                        if let Some(next) = MessageHandler::next_state(&route) {
                            let connected = next.is_connected();
                            if let Some(tx) = connack_tx.take() {
                                let _ = tx.send(match &next {
                                    SessionState::Connected => Ok(()),
                                    other => Err(SessionError::ConnectionFailedStr(format!(
                                        "{other:?}"
                                    ))),
                                });
                            }
                            state_tx.send_replace(next);
                            if !connected {
                                break;
                            }
                        } else if MessageHandler::is_publish_progress(&route) {
                            let _ = publish_tx.send(route);
                        }
                    }
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "MQTT connection error");
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(Err(MessageHandler::connection_error(&e)));
                        }
                        state_tx.send_replace(SessionState::Disconnected(e.to_string()));
                        break;
                    }
                }
            }
            debug!(client_id = %client_id, "MQTT poll task stopped");
        })
    }

    /// Wait for the poll task to report ConnAck or failure
    async fn wait_for_connection_confirmation(
        connack_rx: oneshot::Receiver<Result<(), SessionError>>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ConnectionFailedStr(
                "MQTT poll task exited before ConnAck".to_string(),
            )),
            Err(_) => Err(SessionError::ConnectTimeout(timeout)),
        }
    }

    async fn stop_poll_task(&self) {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(POLL_TASK_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("MQTT poll task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT poll task ended with error: {}", e),
                Err(_) => {
                    warn!("MQTT poll task didn't shut down gracefully, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn connect(
        &self,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<(), SessionError> {
        // A previous session may still be winding down. Aborting it closes its publish
        // channel, which releases any `send` still waiting for a PubAck.
        if let Some(stale) = self.poll_handle.lock().await.take() {
            stale.abort();
        }
        self.client.lock().await.take();

        let mqtt_options = configure_mqtt_options(client_id, &self.broker, credentials)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        self.state_tx.send_replace(SessionState::Connecting);
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (connack_tx, connack_rx) = oneshot::channel();

        let handle = Self::spawn_poll_task(
            client_id.to_string(),
            event_loop,
            self.state_tx.clone(),
            publish_tx,
            connack_tx,
        );
        *self.poll_handle.lock().await = Some(handle);
        *self.publish_rx.lock().await = Some(publish_rx);

        if let Err(e) =
            Self::wait_for_connection_confirmation(connack_rx, self.connect_timeout()).await
        {
            if let Some(handle) = self.poll_handle.lock().await.take() {
                handle.abort();
            }
            self.state_tx
                .send_replace(SessionState::Disconnected(e.to_string()));
            return Err(e);
        }

        *self.client.lock().await = Some(client);
        info!(client_id = %client_id, broker = %self.broker.broker_url, "MQTT session established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let client = self.client.lock().await.take();
        let result = match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| SessionError::ConnectionFailed(Box::new(e))),
            None => Ok(()),
        };

        self.stop_poll_task().await;
        self.state_tx
            .send_replace(SessionState::Disconnected("Client disconnected".to_string()));
        info!("MQTT session closed");
        result
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        let state = self.state_tx.borrow().clone();
        if !state.is_connected() {
            return Err(SessionError::NotConnected {
                reason: format!("{state:?}"),
            });
        }

        let mut publish_rx = self.publish_rx.lock().await;
        let progress = publish_rx.as_mut().ok_or_else(|| SessionError::NotConnected {
            reason: "no active event loop".to_string(),
        })?;
        // Acks for a publish that timed out earlier are not ours.
        while progress.try_recv().is_ok() {}

        {
            let client = self.client.lock().await;
            let client = client.as_ref().ok_or_else(|| SessionError::NotConnected {
                reason: "no active client".to_string(),
            })?;
            client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| SessionError::PublishFailed(Box::new(e)))?;
        }

        await_publish_ack(progress, PUBLISH_ACK_TIMEOUT).await?;
        tracing::debug!(target: "mqtt_transport", "Published to {} and acknowledged", topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

/// Follow one publish through the poll task until the broker acknowledges it
///
/// The first `PublishSent` names the packet id to wait for. A closed channel means the
/// event loop is gone and the message never reached the broker's QoS 1 state.
async fn await_publish_ack(
    progress: &mut mpsc::UnboundedReceiver<EventRoute>,
    timeout: Duration,
) -> Result<(), SessionError> {
    let wait = async {
        let mut expected: Option<u16> = None;
        while let Some(route) = progress.recv().await {
            match route {
                EventRoute::PublishSent { packet_id } if expected.is_none() => {
                    expected = Some(packet_id);
                }
                EventRoute::PublishAcknowledged {
                    packet_id,
                    accepted,
                } if expected == Some(packet_id) => {
                    return if accepted {
                        Ok(())
                    } else {
                        Err(SessionError::PublishFailed(
                            format!("broker rejected publish {packet_id}").into(),
                        ))
                    };
                }
                _ => {}
            }
        }
        Err(SessionError::NotConnected {
            reason: "session closed before the broker acknowledged the publish".to_string(),
        })
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::PublishFailed(
            format!("no PubAck within {timeout:?}").into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_broker() -> BrokerSection {
        BrokerSection {
            // Port 1 on loopback refuses connections immediately.
            broker_url: "mqtt://127.0.0.1:1".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 2,
        }
    }

    #[tokio::test]
    async fn test_new_session_is_disconnected() {
        let session = MqttSession::new(unreachable_broker());
        assert!(!session.is_connected());
        assert!(matches!(
            *session.watch_state().borrow(),
            SessionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_send_without_session_fails_with_not_connected() {
        let session = MqttSession::new(unreachable_broker());
        let result = session.send("/t", Bytes::from_static(b"{}")).await;
        assert!(matches!(result, Err(SessionError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let session = MqttSession::new(unreachable_broker());
        let result = session
            .connect("courier-test", &Credentials::anonymous())
            .await;
        assert!(result.is_err());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_ack_for_our_packet_completes_send() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(EventRoute::PublishSent { packet_id: 4 }).unwrap();
        tx.send(EventRoute::PublishAcknowledged {
            packet_id: 3,
            accepted: false,
        })
        .unwrap();
        tx.send(EventRoute::PublishAcknowledged {
            packet_id: 4,
            accepted: true,
        })
        .unwrap();

        assert!(await_publish_ack(&mut rx, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_ack_fails_send() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(EventRoute::PublishSent { packet_id: 9 }).unwrap();
        tx.send(EventRoute::PublishAcknowledged {
            packet_id: 9,
            accepted: false,
        })
        .unwrap();

        let result = await_publish_ack(&mut rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::PublishFailed(_))));
    }

    #[tokio::test]
    async fn test_session_drop_before_ack_is_not_a_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(EventRoute::PublishSent { packet_id: 1 }).unwrap();
        drop(tx);

        let result = await_publish_ack(&mut rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::NotConnected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(EventRoute::PublishSent { packet_id: 1 }).unwrap();

        let result = await_publish_ack(&mut rx, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SessionError::PublishFailed(_))));
        drop(tx);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_ok() {
        let session = MqttSession::new(unreachable_broker());
        assert!(session.disconnect().await.is_ok());
    }
}
