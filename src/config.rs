//! TOML configuration
//!
//! Secrets are never stored in the file. The auth section names environment variables that
//! are read when the SDK is built.

use crate::connection::BackoffPolicy;
use crate::dispatch::DispatchPolicy;
use crate::protocol::validate_identifier;
use crate::queue::QueueKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkConfig {
    pub sdk: SdkSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Identity of this client and its destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkSection {
    pub organization_id: String,
    pub project_id: String,
    /// Must be unique per concurrent connection; the broker drops the older of two
    /// sessions that share an id
    pub client_id: String,
    /// Default bound for draining the queue on shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long a connect attempt waits for ConnAck
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    None,
    Static,
    OAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    #[serde(default)]
    pub kind: AuthKind,
    pub issuer_url: Option<String>,
    pub oauth_client_id: Option<String>,
    pub client_secret_env: Option<String>,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
    #[serde(default = "default_token_skew_secs")]
    pub token_skew_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            kind: AuthKind::None,
            issuer_url: None,
            oauth_client_id: None,
            client_secret_env: None,
            username_env: None,
            password_env: None,
            token_skew_secs: default_token_skew_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueSection {
    #[serde(default)]
    pub strategy: QueueKind,
    /// Unbounded when unset
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Give up on an envelope after this many failed sends; retry forever when unset
    pub max_send_attempts: Option<u32>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval_ms(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            max_send_attempts: None,
        }
    }
}

impl DispatchSection {
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
            max_send_attempts: self.max_send_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectSection {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_drain_timeout_secs() -> u64 {
    crate::sdk::DEFAULT_DRAIN_TIMEOUT.as_secs()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_token_skew_secs() -> u64 {
    30
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_idle_interval_ms() -> u64 {
    500
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identifier for {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SdkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SdkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a broker on localhost without auth
    pub fn local(organization_id: &str, project_id: &str, client_id: &str) -> Self {
        Self {
            sdk: SdkSection {
                organization_id: organization_id.to_string(),
                project_id: project_id.to_string(),
                client_id: client_id.to_string(),
                drain_timeout_secs: default_drain_timeout_secs(),
            },
            broker: BrokerSection {
                broker_url: "mqtt://localhost:1883".to_string(),
                keep_alive_secs: default_keep_alive_secs(),
                connect_timeout_secs: default_connect_timeout_secs(),
            },
            auth: AuthSection::default(),
            queue: QueueSection::default(),
            dispatch: DispatchSection::default(),
            reconnect: ReconnectSection::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("sdk.organization_id", &self.sdk.organization_id),
            ("sdk.project_id", &self.sdk.project_id),
            ("sdk.client_id", &self.sdk.client_id),
        ] {
            validate_identifier(value).map_err(|e| ConfigError::InvalidIdentifier {
                field,
                reason: e.to_string(),
            })?;
        }

        crate::transport::mqtt::parse_broker_url(&self.broker.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "broker.keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        validate_backoff(
            "reconnect",
            self.reconnect.base_delay_ms,
            self.reconnect.max_delay_ms,
        )?;
        validate_backoff(
            "dispatch",
            self.dispatch.retry_base_delay_ms,
            self.dispatch.retry_max_delay_ms,
        )?;

        if self.dispatch.idle_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch.idle_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.dispatch.max_send_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "dispatch.max_send_attempts must be greater than 0 or unset".to_string(),
            ));
        }
        if self.queue.capacity == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "queue.capacity must be greater than 0 or unset".to_string(),
            ));
        }

        match self.auth.kind {
            AuthKind::None => {}
            AuthKind::Static => {
                if self.auth.username_env.is_none() || self.auth.password_env.is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "static auth requires auth.username_env and auth.password_env"
                            .to_string(),
                    ));
                }
            }
            AuthKind::OAuth => {
                if self.auth.issuer_url.is_none() || self.auth.oauth_client_id.is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "oauth auth requires auth.issuer_url and auth.oauth_client_id"
                            .to_string(),
                    ));
                }
                if self.auth.username_env.is_none() || self.auth.password_env.is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "oauth auth requires auth.username_env and auth.password_env"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.sdk.drain_timeout_secs)
    }

    /// Read a required secret from the environment variable named in the config
    pub fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    pub fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }
}

fn validate_backoff(section: &str, base_ms: u64, max_ms: u64) -> Result<(), ConfigError> {
    if base_ms == 0 {
        return Err(ConfigError::InvalidConfig(format!(
            "{section} base delay must be greater than 0"
        )));
    }
    if max_ms < base_ms {
        return Err(ConfigError::InvalidConfig(format!(
            "{section} max delay ({max_ms}ms) must not be below the base delay ({base_ms}ms)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[sdk]
organization_id = "acme"
project_id = "checkout"
client_id = "checkout-web-01"

[broker]
broker_url = "mqtt://localhost:1883"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = SdkConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.sdk.organization_id, "acme");
        assert_eq!(config.sdk.drain_timeout_secs, 60);
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.auth.kind, AuthKind::None);
        assert_eq!(config.queue.strategy, QueueKind::Fifo);
        assert_eq!(config.queue.capacity, None);
        assert_eq!(config.dispatch.idle_interval_ms, 500);
        assert_eq!(config.dispatch.max_send_attempts, None);
        assert_eq!(config.reconnect.base_delay_ms, 5_000);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
    }

    #[test]
    fn test_policies_from_sections() {
        let config = SdkConfig::from_toml_str(MINIMAL).unwrap();
        let reconnect = config.reconnect.policy();
        assert_eq!(reconnect.base, Duration::from_secs(5));
        assert_eq!(reconnect.max, Duration::from_secs(60));

        let dispatch = config.dispatch.policy();
        assert_eq!(dispatch.idle_interval, Duration::from_millis(500));
        assert_eq!(dispatch.max_send_attempts, None);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[sdk]
organization_id = "acme"
project_id = "checkout"
client_id = "checkout-web-01"
drain_timeout_secs = 15

[broker]
broker_url = "mqtts://broker.example.com:8883"
keep_alive_secs = 30

[auth]
kind = "oauth"
issuer_url = "https://id.example.com/realms/acme"
oauth_client_id = "event-courier"
username_env = "COURIER_USERNAME"
password_env = "COURIER_PASSWORD"

[queue]
strategy = "lifo"
capacity = 1000

[dispatch]
idle_interval_ms = 250
max_send_attempts = 10

[reconnect]
base_delay_ms = 1000
max_delay_ms = 30000
"#;
        let config = SdkConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.auth.kind, AuthKind::OAuth);
        assert_eq!(config.auth.token_skew_secs, 30);
        assert_eq!(config.queue.strategy, QueueKind::Lifo);
        assert_eq!(config.queue.capacity, Some(1000));
        assert_eq!(config.dispatch.max_send_attempts, Some(10));
        assert_eq!(config.drain_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        let bad = MINIMAL.replace("checkout-web-01", "checkout web");
        assert!(matches!(
            SdkConfig::from_toml_str(&bad),
            Err(ConfigError::InvalidIdentifier {
                field: "sdk.client_id",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let bad = MINIMAL.replace("mqtt://localhost:1883", "http://localhost");
        assert!(matches!(
            SdkConfig::from_toml_str(&bad),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backoff_max_below_base_rejected() {
        let mut config = SdkConfig::local("acme", "web", "c1");
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oauth_requires_issuer() {
        let mut config = SdkConfig::local("acme", "web", "c1");
        config.auth.kind = AuthKind::OAuth;
        config.auth.username_env = Some("U".into());
        config.auth.password_env = Some("P".into());
        assert!(config.validate().is_err());

        config.auth.issuer_url = Some("https://id.example.com".into());
        config.auth.oauth_client_id = Some("courier".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = SdkConfig::local("acme", "web", "c1");
        config.queue.capacity = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_env_var() {
        assert!(matches!(
            SdkConfig::get_env_var_required("COURIER_TEST_DEFINITELY_UNSET"),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
