//! Facade lifecycle and misuse errors
//!
//! Misuse is the only class of error the SDK returns to callers; these tests pin down which
//! calls are rejected in which state, and that rejected calls leave nothing in the queue.

mod test_helpers;

use event_courier::connection::ConnectionEvent;
use event_courier::protocol::EventMessage;
use event_courier::sdk::{LifecycleState, ShutdownOptions};
use event_courier::{ErrorClass, SdkError};
use serde_json::json;
use std::time::Duration;
use test_helpers::{build_sdk, event_for, test_config};

#[tokio::test]
async fn test_send_before_start_fails_and_enqueues_nothing() {
    let (sdk, _session) = build_sdk(&test_config());

    let err = sdk.send_message(event_for("user-1"), None).unwrap_err();
    assert!(matches!(err, SdkError::NotStarted));
    assert_eq!(err.class(), ErrorClass::Misuse);
    assert!(!sdk.has_messages_pending_for_dispatch());
    assert_eq!(sdk.messages_pending_for_dispatch_count(), 0);
}

#[tokio::test]
async fn test_send_without_entity_fails_and_enqueues_nothing() {
    let (sdk, _session) = build_sdk(&test_config());
    sdk.start().await.unwrap();

    let message = EventMessage::new("page.viewed", json!({}));
    let id = message.message_id();
    match sdk.send_message(message, None) {
        Err(SdkError::MissingEntity { message_id }) => assert_eq!(message_id, id),
        other => panic!("expected MissingEntity, got {other:?}"),
    }
    assert_eq!(sdk.messages_pending_for_dispatch_count(), 0);

    sdk.stop(ShutdownOptions::immediate()).await.unwrap();
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (sdk, _session) = build_sdk(&test_config());
    sdk.start().await.unwrap();
    assert!(matches!(sdk.start().await, Err(SdkError::AlreadyStarted)));
    sdk.stop(ShutdownOptions::immediate()).await.unwrap();
}

#[tokio::test]
async fn test_stop_without_start_fails() {
    let (sdk, _session) = build_sdk(&test_config());
    assert!(matches!(
        sdk.stop(ShutdownOptions::immediate()).await,
        Err(SdkError::NotStarted)
    ));
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (sdk, session) = build_sdk(&test_config());
    sdk.start().await.unwrap();
    sdk.stop(ShutdownOptions::immediate()).await.unwrap();
    assert_eq!(sdk.state(), LifecycleState::Stopped);
    assert!(matches!(
        sdk.send_message(event_for("user-1"), None),
        Err(SdkError::NotStarted)
    ));

    sdk.start().await.unwrap();
    sdk.send_message(event_for("user-1"), None).unwrap();
    let report = sdk
        .stop(ShutdownOptions::drain(Some(Duration::from_secs(10))))
        .await
        .unwrap();
    assert!(report.drained);
    assert_eq!(session.sent().len(), 1);
}

#[tokio::test]
async fn test_calls_after_dispose_fail_with_disposed() {
    let (sdk, _session) = build_sdk(&test_config());
    sdk.start().await.unwrap();
    sdk.dispose().await.unwrap();

    assert!(matches!(
        sdk.stop(ShutdownOptions::immediate()).await,
        Err(SdkError::Disposed)
    ));
    assert!(matches!(
        sdk.send_message(event_for("user-1"), None),
        Err(SdkError::Disposed)
    ));
    assert!(matches!(sdk.start().await, Err(SdkError::Disposed)));
    assert!(matches!(sdk.subscribe(), Err(SdkError::Disposed)));
    assert!(matches!(sdk.dispose().await, Err(SdkError::Disposed)));
    assert!(!sdk.is_connected());
}

#[tokio::test]
async fn test_dispose_without_start() {
    let (sdk, _session) = build_sdk(&test_config());
    sdk.dispose().await.unwrap();
    assert_eq!(sdk.state(), LifecycleState::Disposed);
}

#[tokio::test]
async fn test_connection_events_are_forwarded() {
    let (sdk, _session) = build_sdk(&test_config());
    let mut events = sdk.subscribe().unwrap();

    sdk.start().await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, ConnectionEvent::Connected);
    assert!(sdk.is_connected());

    sdk.dispose().await.unwrap();
    let last = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(last, ConnectionEvent::Disconnected { .. }));
}
