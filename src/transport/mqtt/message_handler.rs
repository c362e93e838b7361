//! Pure routing of rumqttc events to session state decisions

use crate::error::{AuthError, SessionError};
use crate::transport::SessionState;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PubAckReason};
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;

/// What the poll task should do with an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received; the session is usable
    ConnectionAcknowledged,
    /// Broker sent DISCONNECT
    Disconnected,
    /// QoS 1 publish written to the socket
    PublishSent { packet_id: u16 },
    /// QoS 1 publish acknowledged; `accepted` is false for failure reason codes
    PublishAcknowledged { packet_id: u16, accepted: bool },
    /// PingResp and other bookkeeping
    InfrastructureEvent(String),
    /// Outgoing packet, nothing to do
    OutgoingEvent,
}

/// Pure event routing decisions
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged {
                    packet_id: ack.pkid,
                    accepted: Self::publish_accepted(&ack.reason),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether the broker took ownership of the message
    pub fn publish_accepted(reason: &PubAckReason) -> bool {
        matches!(
            reason,
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers
        )
    }

    /// Routes the poll task forwards to a waiting `send`
    pub fn is_publish_progress(route: &EventRoute) -> bool {
        matches!(
            route,
            EventRoute::PublishSent { .. } | EventRoute::PublishAcknowledged { .. }
        )
    }

    /// Map an event loop failure to a session error. Credential refusals become auth errors
    /// so the supervisor drops its cached token.
    pub fn connection_error(error: &ConnectionError) -> SessionError {
        match error {
            ConnectionError::ConnectionRefused(
                code @ (ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword),
            ) => SessionError::Auth(AuthError::BrokerRejected(format!("{code:?}"))),
            other => SessionError::ConnectionFailedStr(other.to_string()),
        }
    }

    /// Session state implied by a route, if it changes anything
    pub fn next_state(route: &EventRoute) -> Option<SessionState> {
        match route {
            EventRoute::ConnectionAcknowledged => Some(SessionState::Connected),
            EventRoute::Disconnected => Some(SessionState::Disconnected(
                "Broker disconnected".to_string(),
            )),
            _ => None,
        }
    }
}
