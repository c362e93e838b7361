//! The queued unit of work

use crate::protocol::{EventMessage, RoutingKey, TopicBuilder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Invoked once after the broker accepted the event
pub type DeliveryCallback = Box<dyn FnOnce(&DeliveryReceipt) + Send + 'static>;

/// Passed to a [`DeliveryCallback`] on success
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub topic: String,
    /// Send attempts including the successful one
    pub attempts: u32,
    pub delivered_at: DateTime<Utc>,
}

/// Routing key + event + optional completion callback.
///
/// The routing key and the event are fixed at construction. The only mutation is the
/// processing timestamp, written once before the first send attempt.
pub struct Envelope {
    routing_key: RoutingKey,
    message: EventMessage,
    callback: Option<DeliveryCallback>,
    encoded: Option<Bytes>,
    attempts: u32,
}

impl Envelope {
    pub fn new(
        routing_key: RoutingKey,
        message: EventMessage,
        callback: Option<DeliveryCallback>,
    ) -> Self {
        Self {
            routing_key,
            message,
            callback,
            encoded: None,
            attempts: 0,
        }
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub fn message(&self) -> &EventMessage {
        &self.message
    }

    pub fn message_id(&self) -> Uuid {
        self.message.message_id()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn topic(&self) -> String {
        TopicBuilder::build_event_topic(&self.routing_key)
    }

    /// Set the processing timestamp if it has not been set yet.
    ///
    /// Returns `true` when this call wrote the timestamp.
    pub fn stamp_processing_time(&mut self) -> bool {
        if self.message.metadata.processing_timestamp.is_some() {
            return false;
        }
        self.message.metadata.processing_timestamp = Some(Utc::now());
        true
    }

    /// Wire payload for the next send attempt.
    ///
    /// Stamps the processing time and serializes on first use; retries reuse the same bytes.
    pub fn payload(&mut self) -> Result<Bytes, serde_json::Error> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }
        self.stamp_processing_time();
        let encoded = Bytes::from(serde_json::to_vec(&self.message)?);
        self.encoded = Some(encoded.clone());
        Ok(encoded)
    }

    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Consume the envelope after a successful send, firing the callback if present.
    pub fn complete(mut self, topic: String) -> DeliveryReceipt {
        let receipt = DeliveryReceipt {
            message_id: self.message_id(),
            topic,
            attempts: self.attempts,
            delivered_at: Utc::now(),
        };
        if let Some(callback) = self.callback.take() {
            callback(&receipt);
        }
        receipt
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message.message_id())
            .field("event_type", &self.message.metadata.event_type)
            .field("has_callback", &self.callback.is_some())
            .field("attempts", &self.attempts)
            .finish()
    }
}
