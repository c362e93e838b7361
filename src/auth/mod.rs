//! Credential providers
//!
//! The connection supervisor asks a [`CredentialProvider`] for credentials before every
//! connect attempt. Providers cache whatever they can and decide on their own whether to
//! reuse, refresh, or log in again.

pub mod oauth;

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub use oauth::{OAuthConfig, OAuthCredentialProvider};

/// Credentials presented to the broker when opening a session
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: Option<String>,
    /// Password or bearer token
    pub secret: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// `None` means the credentials never expire
    pub expires_in: Option<Duration>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            secret: None,
            issued_at: Utc::now(),
            expires_in: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            secret: Some(password.into()),
            issued_at: Utc::now(),
            expires_in: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.secret.is_none()
    }

    /// Time left before expiry, `None` for non-expiring credentials
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Option<Duration> {
        let lifetime = self.expires_in?;
        let elapsed = (now - self.issued_at).to_std().unwrap_or(Duration::ZERO);
        Some(lifetime.saturating_sub(elapsed))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("issued_at", &self.issued_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Source of broker credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials that are valid right now, refreshing or logging in as needed
    async fn current(&self) -> Result<Credentials, AuthError>;

    /// Drop cached state so the next [`current`](Self::current) performs a full login
    async fn invalidate(&self);

    fn name(&self) -> &str;
}

/// For brokers that accept anonymous sessions
#[derive(Debug, Default, Clone)]
pub struct NoAuth;

#[async_trait]
impl CredentialProvider for NoAuth {
    async fn current(&self) -> Result<Credentials, AuthError> {
        Ok(Credentials::anonymous())
    }

    async fn invalidate(&self) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Fixed username/password, typically resolved from the environment at startup
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::basic(username, password),
        }
    }

    pub fn from_env(username_env: &str, password_env: &str) -> Result<Self, AuthError> {
        let username = std::env::var(username_env)
            .map_err(|_| AuthError::MissingCredential(username_env.to_string()))?;
        let password = std::env::var(password_env)
            .map_err(|_| AuthError::MissingCredential(password_env.to_string()))?;
        Ok(Self::new(username, password))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current(&self) -> Result<Credentials, AuthError> {
        Ok(self.credentials.clone())
    }

    async fn invalidate(&self) {}

    fn name(&self) -> &str {
        "static"
    }
}

/// Cached access/refresh token pair
#[derive(Clone, PartialEq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub lifetime: Duration,
    /// `None` when the server did not declare a refresh token lifetime
    pub refresh_lifetime: Option<Duration>,
}

impl TokenState {
    /// Saturates at the end of the representable range for absurd lifetimes
    fn expires_at(issued_at: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Access token usable for at least `skew` more
    pub fn is_access_valid(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        Self::expires_at(now, skew) < Self::expires_at(self.issued_at, self.lifetime)
    }

    /// Refresh token, if present and not expired
    pub fn usable_refresh_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.refresh_token.as_deref()?;
        match self.refresh_lifetime {
            Some(lifetime) if now >= Self::expires_at(self.issued_at, lifetime) => None,
            _ => Some(token),
        }
    }

    pub fn to_credentials(&self, username: Option<String>) -> Credentials {
        Credentials {
            username,
            secret: Some(self.access_token.clone()),
            issued_at: self.issued_at,
            expires_in: Some(self.lifetime),
        }
    }
}

impl std::fmt::Debug for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenState")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("issued_at", &self.issued_at)
            .field("lifetime", &self.lifetime)
            .field("refresh_lifetime", &self.refresh_lifetime)
            .finish()
    }
}
