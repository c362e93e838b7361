//! Test helpers and utilities for integration tests

use event_courier::auth::NoAuth;
use event_courier::config::SdkConfig;
use event_courier::protocol::{EntityReference, EventMessage};
use event_courier::queue::DeliveryCallback;
use event_courier::testing::MockSession;
use event_courier::EventSdk;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Local configuration with short backoff so paused-time tests stay readable
#[allow(dead_code)]
pub fn test_config() -> SdkConfig {
    let mut config = SdkConfig::local("acme", "checkout", "integration-test");
    config.reconnect.base_delay_ms = 1_000;
    config.reconnect.max_delay_ms = 8_000;
    config.dispatch.retry_base_delay_ms = 1_000;
    config.dispatch.retry_max_delay_ms = 8_000;
    config
}

#[allow(dead_code)]
pub fn build_sdk(config: &SdkConfig) -> (EventSdk, Arc<MockSession>) {
    let session = Arc::new(MockSession::new());
    let sdk = EventSdk::new(config, session.clone(), Arc::new(NoAuth))
        .expect("valid test configuration");
    (sdk, session)
}

#[allow(dead_code)]
pub fn event_for(entity_id: &str) -> EventMessage {
    EventMessage::new("page.viewed", json!({"path": "/cart"}))
        .with_entity(EntityReference::new(entity_id))
}

/// Callback that bumps `counter` each time it runs
#[allow(dead_code)]
pub fn counting_callback(counter: &Arc<AtomicU32>) -> Option<DeliveryCallback> {
    let counter = counter.clone();
    Some(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
}
