//! Error types for the event delivery pipeline
//!
//! Errors fall into three classes. Transient and unexpected failures happen inside the
//! background loops and are retried under backoff; they never reach the caller. Misuse
//! errors are programming mistakes at the [`EventSdk`](crate::sdk::EventSdk) boundary and
//! are returned synchronously.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// How a failure should be treated by whoever observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected operational failure (broker down, token expired). Retry.
    Transient,
    /// Unknown fault. Log loudly, then retry anyway to keep the loop alive.
    Unexpected,
    /// Caller misuse. Surface immediately, never retry.
    Misuse,
}

/// Errors surfaced by the SDK facade
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("SDK has not been started")]
    NotStarted,

    #[error("SDK is already started")]
    AlreadyStarted,

    #[error("SDK has been disposed")]
    Disposed,

    #[error("Message {message_id} has no entity reference; an entity id is required for routing")]
    MissingEntity { message_id: uuid::Uuid },

    #[error("Dispatch queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
}

impl SdkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SdkError::Session(e) => e.class(),
            SdkError::Auth(e) => e.class(),
            _ => ErrorClass::Misuse,
        }
    }
}

/// Failures reported by a [`Session`](crate::transport::Session) implementation
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),

    #[error("Connection not acknowledged within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Not connected: {reason}")]
    NotConnected { reason: String },

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::ConnectionFailed(_)
            | SessionError::ConnectionFailedStr(_)
            | SessionError::ConnectTimeout(_)
            | SessionError::PublishFailed(_)
            | SessionError::NotConnected { .. } => ErrorClass::Transient,
            SessionError::Auth(e) => e.class(),
            SessionError::InvalidBrokerUrl(_) | SessionError::Serialization(_) => {
                ErrorClass::Unexpected
            }
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }
}

/// Failures while obtaining credentials
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Discovery document unavailable: {0}")]
    Discovery(String),

    #[error("Token endpoint rejected the {grant} grant: {message}")]
    GrantRejected { grant: &'static str, message: String },

    #[error("Token request failed")]
    Http(#[from] reqwest::Error),

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Broker refused the credentials: {0}")]
    BrokerRejected(String),
}

impl AuthError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::InvalidResponse(_) => ErrorClass::Unexpected,
            _ => ErrorClass::Transient,
        }
    }
}

pub type SdkResult<T> = Result<T, SdkError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(password|token|secret|access_token|refresh_token)([=:]\s*|"\s*:\s*")[^\s&",]+"#)
        .expect("secret pattern is a valid regex")
});

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Redact credential material from an error message before it is logged
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}${2}***")
        .to_string();

    if sanitized.len() > MAX_LOGGED_ERROR_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_errors_are_classified_as_misuse() {
        assert_eq!(SdkError::NotStarted.class(), ErrorClass::Misuse);
        assert_eq!(SdkError::AlreadyStarted.class(), ErrorClass::Misuse);
        assert_eq!(SdkError::Disposed.class(), ErrorClass::Misuse);
        assert_eq!(
            SdkError::QueueFull { capacity: 3 }.class(),
            ErrorClass::Misuse
        );
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let err = SessionError::ConnectionFailedStr("broker unreachable".to_string());
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = SessionError::NotConnected {
            reason: "dropped".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(SdkError::from(err).class(), ErrorClass::Transient);
    }

    #[test]
    fn test_auth_errors_inside_session_errors() {
        let err = SessionError::from(AuthError::NoRefreshToken);
        assert!(err.is_auth());
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = SessionError::from(AuthError::InvalidResponse("no access_token".into()));
        assert_eq!(err.class(), ErrorClass::Unexpected);
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized =
            sanitize_error_message("login failed: password=hunter2 token: abc.def.ghi");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc.def.ghi"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token: ***"));
    }

    #[test]
    fn test_sanitize_redacts_json_tokens() {
        let sanitized = sanitize_error_message(r#"{"access_token": "eyJhbGciOi", "x": 1}"#);
        assert!(!sanitized.contains("eyJhbGciOi"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"é".repeat(600));
        assert!(sanitized.len() <= MAX_LOGGED_ERROR_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_error_display() {
        let errors: Vec<SdkError> = vec![
            SdkError::NotStarted,
            SdkError::AlreadyStarted,
            SdkError::Disposed,
            SdkError::MissingEntity {
                message_id: uuid::Uuid::new_v4(),
            },
            SdkError::QueueFull { capacity: 10 },
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
