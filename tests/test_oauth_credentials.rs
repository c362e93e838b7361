//! OAuth credential provider against a mock identity provider
//!
//! Covers token reuse, refresh, fallback to a full login, and discovery failures.

use event_courier::auth::{CredentialProvider, OAuthConfig, OAuthCredentialProvider};
use event_courier::error::AuthError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DISCOVERY_PATH: &str = "/realms/acme/.well-known/openid-configuration";
const TOKEN_PATH: &str = "/realms/acme/protocol/openid-connect/token";

fn config(server: &MockServer) -> OAuthConfig {
    OAuthConfig {
        issuer_url: format!("{}/realms/acme", server.uri()),
        client_id: "event-courier".to_string(),
        client_secret: None,
        username: "svc-events".to_string(),
        password: "s3cret".to_string(),
        token_skew: Duration::from_secs(30),
        request_timeout: Duration::from_secs(5),
    }
}

async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": format!("{}/realms/acme", server.uri()),
            "token_endpoint": format!("{}{}", server.uri(), TOKEN_PATH),
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn token_body(access: &str, expires_in: u64, refresh: Option<&str>) -> serde_json::Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
        body["refresh_expires_in"] = json!(1800);
    }
    body
}

#[tokio::test]
async fn test_password_grant_then_reuse() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("username=svc-events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", 300, None)))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OAuthCredentialProvider::new(config(&server)).unwrap();
    let first = provider.current().await.unwrap();
    assert_eq!(first.secret.as_deref(), Some("access-1"));
    assert_eq!(first.username.as_deref(), Some("svc-events"));
    assert_eq!(first.expires_in, Some(Duration::from_secs(300)));

    let second = provider.current().await.unwrap();
    assert_eq!(second.secret.as_deref(), Some("access-1"));
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    // Lifetime below the skew, so the token is stale as soon as it is issued.
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-1", 10, Some("refresh-1"))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2", 300, None)))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OAuthCredentialProvider::new(config(&server)).unwrap();
    assert_eq!(
        provider.current().await.unwrap().secret.as_deref(),
        Some("access-1")
    );
    assert_eq!(
        provider.current().await.unwrap().secret.as_deref(),
        Some("access-2")
    );
}

#[tokio::test]
async fn test_rejected_refresh_falls_back_to_login() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-n", 10, Some("refresh-1"))),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token is not active",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OAuthCredentialProvider::new(config(&server)).unwrap();
    provider.current().await.unwrap();
    let credentials = provider.current().await.unwrap();
    assert_eq!(credentials.secret.as_deref(), Some("access-n"));
}

#[tokio::test]
async fn test_invalidate_forces_full_login() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", 300, Some("r"))))
        .expect(2)
        .mount(&server)
        .await;

    let provider = OAuthCredentialProvider::new(config(&server)).unwrap();
    provider.current().await.unwrap();
    provider.invalidate().await;
    provider.current().await.unwrap();
}

#[tokio::test]
async fn test_rejected_login_is_reported() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid user credentials",
        })))
        .mount(&server)
        .await;

    let provider = OAuthCredentialProvider::new(config(&server)).unwrap();
    match provider.current().await {
        Err(AuthError::GrantRejected { grant, message }) => {
            assert_eq!(grant, "password");
            assert!(message.contains("invalid_grant"));
        }
        other => panic!("expected GrantRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_discovery_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = OAuthCredentialProvider::new(config(&server)).unwrap();
    let err = provider.current().await.unwrap_err();
    assert!(matches!(err, AuthError::Discovery(_)));
    assert_eq!(provider.name(), "oauth");
}
