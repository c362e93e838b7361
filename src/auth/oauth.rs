//! OAuth 2.0 / OpenID Connect credential provider
//!
//! Resolves the token endpoint from the issuer's discovery document, then keeps an access
//! token alive: reuse while valid, `refresh_token` grant when it is not, `password` grant
//! when there is nothing to refresh or the refresh is rejected.

use super::{CredentialProvider, Credentials, TokenState};
use crate::error::{sanitize_error_message, AuthError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// OAuth provider configuration
#[derive(Clone)]
pub struct OAuthConfig {
    /// Issuer base URL; the discovery document lives under `/.well-known/openid-configuration`
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub username: String,
    pub password: String,
    /// Tokens closer than this to expiry are treated as expired
    pub token_skew: Duration,
    pub request_timeout: Duration,
}

impl OAuthConfig {
    pub fn discovery_url(&self) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            self.issuer_url.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("issuer_url", &self.issuer_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("token_skew", &self.token_skew)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Tokens without a declared lifetime are assumed to live this long
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

pub struct OAuthCredentialProvider {
    config: OAuthConfig,
    client: Client,
    discovery: Mutex<Option<DiscoveryDocument>>,
    tokens: Mutex<Option<TokenState>>,
}

impl OAuthCredentialProvider {
    pub fn new(config: OAuthConfig) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            config,
            client,
            discovery: Mutex::new(None),
            tokens: Mutex::new(None),
        })
    }

    async fn token_endpoint(&self) -> Result<String, AuthError> {
        let mut discovery = self.discovery.lock().await;
        if let Some(doc) = discovery.as_ref() {
            return Ok(doc.token_endpoint.clone());
        }

        let url = self.config.discovery_url();
        debug!(url = %url, "Fetching discovery document");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Discovery(format!(
                "{url} returned HTTP {}",
                response.status()
            )));
        }

        let doc: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| AuthError::Discovery(format!("malformed document: {e}")))?;

        let endpoint = doc.token_endpoint.clone();
        *discovery = Some(doc);
        Ok(endpoint)
    }

    async fn request_token(
        &self,
        endpoint: &str,
        grant: &'static str,
        params: &[(&str, &str)],
    ) -> Result<TokenState, AuthError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", grant),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        form.extend_from_slice(params);

        let issued_at = Utc::now();
        let response = self.client.post(endpoint).form(&form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                },
                Err(_) => format!("HTTP {status}"),
            };
            return Err(AuthError::GrantRejected {
                grant,
                message: sanitize_error_message(&message),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        Ok(TokenState {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            issued_at,
            lifetime: token
                .expires_in
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME),
            refresh_lifetime: token
                .refresh_expires_in
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }

    async fn password_grant(&self, endpoint: &str) -> Result<TokenState, AuthError> {
        info!(username = %self.config.username, "Logging in with password grant");
        self.request_token(
            endpoint,
            "password",
            &[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ],
        )
        .await
    }

    async fn refresh_grant(
        &self,
        endpoint: &str,
        refresh_token: &str,
    ) -> Result<TokenState, AuthError> {
        debug!("Refreshing access token");
        self.request_token(
            endpoint,
            "refresh_token",
            &[("refresh_token", refresh_token)],
        )
        .await
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentialProvider {
    async fn current(&self) -> Result<Credentials, AuthError> {
        // Held across the HTTP round trips so concurrent callers share one login.
        let mut tokens = self.tokens.lock().await;
        let now = Utc::now();
        let username = Some(self.config.username.clone());

        if let Some(state) = tokens.as_ref() {
            if state.is_access_valid(now, self.config.token_skew) {
                return Ok(state.to_credentials(username));
            }
        }

        let endpoint = self.token_endpoint().await?;

        let refreshed = match tokens.as_ref().and_then(|s| s.usable_refresh_token(now)) {
            Some(refresh_token) => match self.refresh_grant(&endpoint, refresh_token).await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(
                        error = %sanitize_error_message(&e.to_string()),
                        "Token refresh failed, falling back to full login"
                    );
                    None
                }
            },
            None => None,
        };

        let state = match refreshed {
            Some(state) => state,
            None => self.password_grant(&endpoint).await?,
        };

        let credentials = state.to_credentials(username);
        *tokens = Some(state);
        Ok(credentials)
    }

    async fn invalidate(&self) {
        *self.tokens.lock().await = None;
    }

    fn name(&self) -> &str {
        "oauth"
    }
}
