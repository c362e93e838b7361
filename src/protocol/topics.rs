//! Topic canonicalization and identifier validation
//!
//! Outbound events are published to
//! `/organizations/{organization_id}/projects/{project_id}/events/{entity_id}`.
//! Organization, project and client identifiers are validated up front; entity ids come
//! from application data and are escaped into a single safe topic segment instead.

use super::messages::RoutingKey;
use thiserror::Error;

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Escape an arbitrary string into one MQTT topic level.
///
/// Level separators and wildcards are not allowed inside a published topic level.
pub fn topic_segment(raw: &str) -> String {
    let escaped: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | '\0' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if escaped.is_empty() {
        "_".to_string()
    } else {
        escaped
    }
}

/// Builds outbound destination paths
pub struct TopicBuilder;

impl TopicBuilder {
    /// `/organizations/{org}/projects/{project}/events`
    pub fn build_project_topic(organization_id: &str, project_id: &str) -> String {
        canonicalize_topic(&format!(
            "/organizations/{organization_id}/projects/{project_id}/events"
        ))
    }

    /// `/organizations/{org}/projects/{project}/events/{entity}`
    pub fn build_event_topic(key: &RoutingKey) -> String {
        let base = Self::build_project_topic(&key.organization_id, &key.project_id);
        format!("{base}/{}", topic_segment(&key.entity_id))
    }
}

pub fn validate_identifier(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }

    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidIdentifierChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Identifier cannot be empty")]
    EmptyIdentifier,
    #[error("Identifier contains invalid character: '{0}'")]
    InvalidIdentifierChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_has_single_leading_slash(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(result.starts_with('/'));
            prop_assert!(!result.contains("//"));
        }

        #[test]
        fn topic_segment_never_contains_separators_or_wildcards(raw in ".*") {
            let segment = topic_segment(&raw);
            prop_assert!(!segment.is_empty());
            prop_assert!(!segment.contains('/'));
            prop_assert!(!segment.contains('+'));
            prop_assert!(!segment.contains('#'));
        }

        #[test]
        fn valid_identifiers_pass(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_identifier(&id).is_ok());
        }

        #[test]
        fn identifiers_with_invalid_chars_fail(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(validate_identifier(&id).is_err());
        }
    }

    #[test]
    fn test_edge_cases() {
        assert_eq!(canonicalize_topic(""), "/");
        assert_eq!(canonicalize_topic("//"), "/");
        assert_eq!(canonicalize_topic("a/b/c/"), "/a/b/c");
        assert_eq!(canonicalize_topic("//a//b//c//"), "/a/b/c");
    }

    #[test]
    fn test_event_topic_construction() {
        let key = RoutingKey {
            organization_id: "acme".to_string(),
            project_id: "checkout".to_string(),
            entity_id: "user-42".to_string(),
        };
        assert_eq!(
            TopicBuilder::build_event_topic(&key),
            "/organizations/acme/projects/checkout/events/user-42"
        );
    }

    #[test]
    fn test_entity_segment_is_escaped() {
        let key = RoutingKey {
            organization_id: "acme".to_string(),
            project_id: "checkout".to_string(),
            entity_id: "orders/7 #1+".to_string(),
        };
        assert_eq!(
            TopicBuilder::build_event_topic(&key),
            "/organizations/acme/projects/checkout/events/orders_7__1_"
        );
    }

    #[test]
    fn test_identifier_errors() {
        assert_eq!(validate_identifier(""), Err(ValidationError::EmptyIdentifier));
        assert_eq!(
            validate_identifier("acme corp"),
            Err(ValidationError::InvalidIdentifierChar(' '))
        );
        assert!(validate_identifier("acme.corp_1-eu").is_ok());
    }
}
