//! Event message types
//!
//! An [`EventMessage`] is what applications hand to the SDK. It carries its own metadata
//! block so the backend can deduplicate (at-least-once delivery) and measure latency
//! between origin and processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A reference to a domain entity the event is about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityReference {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl EntityReference {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: None,
        }
    }

    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

/// Metadata embedded in every event payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    /// UUID v4 message identifier, stable across retries
    pub message_id: Uuid,
    /// Event type identifier, e.g. `user.signed_in`
    pub event_type: String,
    /// When the application produced the event
    pub origin_timestamp: DateTime<Utc>,
    /// When the SDK first attempted to send the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_timestamp: Option<DateTime<Utc>>,
    /// Primary entity; required for routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<EntityReference>,
}

/// An application event
///
/// # Examples
/// ```
/// use event_courier::protocol::{EntityReference, EventMessage};
/// use serde_json::json;
///
/// let event = EventMessage::new("user.signed_in", json!({"method": "sso"}))
///     .with_entity(EntityReference::new("user-42").with_type("user"));
///
/// assert_eq!(event.entity_id(), Some("user-42"));
/// assert!(event.metadata.processing_timestamp.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    pub metadata: EventMetadata,
    pub data: Value,
}

impl EventMessage {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            metadata: EventMetadata {
                message_id: Uuid::new_v4(),
                event_type: event_type.into(),
                origin_timestamp: Utc::now(),
                processing_timestamp: None,
                entity: None,
                related_entities: Vec::new(),
            },
            data,
        }
    }

    pub fn with_entity(mut self, entity: EntityReference) -> Self {
        self.metadata.entity = Some(entity);
        self
    }

    pub fn with_related_entity(mut self, entity: EntityReference) -> Self {
        self.metadata.related_entities.push(entity);
        self
    }

    pub fn message_id(&self) -> Uuid {
        self.metadata.message_id
    }

    /// Primary entity id, if present and not blank
    pub fn entity_id(&self) -> Option<&str> {
        self.metadata
            .entity
            .as_ref()
            .map(|e| e.entity_id.as_str())
            .filter(|id| !id.trim().is_empty())
    }
}

/// Organization / project / entity triple addressing an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey {
    pub organization_id: String,
    pub project_id: String,
    pub entity_id: String,
}

impl RoutingKey {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.organization_id, self.project_id, self.entity_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_has_fresh_metadata() {
        let a = EventMessage::new("page.viewed", json!({}));
        let b = EventMessage::new("page.viewed", json!({}));
        assert_ne!(a.message_id(), b.message_id());
        assert_eq!(a.metadata.event_type, "page.viewed");
        assert!(a.metadata.processing_timestamp.is_none());
    }

    #[test]
    fn test_entity_id_rejects_blank() {
        let event = EventMessage::new("x", json!(null)).with_entity(EntityReference::new("  "));
        assert_eq!(event.entity_id(), None);

        let event = EventMessage::new("x", json!(null));
        assert_eq!(event.entity_id(), None);
    }

    #[test]
    fn test_serialization_omits_unset_fields() {
        let event = EventMessage::new("cart.updated", json!({"items": 2}))
            .with_entity(EntityReference::new("cart-1"));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["metadata"]["entity"]["entity_id"], "cart-1");
        assert!(value["metadata"].get("processing_timestamp").is_none());
        assert!(value["metadata"].get("related_entities").is_none());
        assert_eq!(value["data"]["items"], 2);
    }

    #[test]
    fn test_routing_key_display() {
        let key = RoutingKey::new("acme", "web", "user-1");
        assert_eq!(key.to_string(), "acme/web/user-1");
    }
}
