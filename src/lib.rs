//! Event Courier
//!
//! Client library that delivers application events to an MQTT ingestion broker without
//! making the caller wait on the network. Events are queued in memory and a background
//! dispatch loop pushes them through a supervised, auto-reconnecting session.
//!
//! # Overview
//!
//! - [`queue`]: envelopes and the FIFO/LIFO backlog
//! - [`auth`]: credential providers (anonymous, static, OAuth password/refresh grants)
//! - [`transport`]: the [`Session`](transport::Session) contract and its MQTT v5 implementation
//! - [`connection`]: reconnection with capped exponential backoff
//! - [`dispatch`]: the single-consumer delivery loop
//! - [`sdk`]: the [`EventSdk`] facade tying it together
//!
//! # Quick Start
//!
//! ```rust
//! use event_courier::config::SdkConfig;
//! use event_courier::protocol::{EntityReference, EventMessage};
//! use event_courier::sdk::{EventSdk, ShutdownOptions};
//! use event_courier::testing::MockSession;
//! use event_courier::auth::NoAuth;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SdkConfig::local("acme", "checkout", "checkout-web-01");
//! let sdk = EventSdk::new(&config, Arc::new(MockSession::new()), Arc::new(NoAuth))?;
//! sdk.start().await?;
//!
//! let event = EventMessage::new("cart.checked_out", json!({"items": 3}))
//!     .with_entity(EntityReference::new("user-42"));
//! sdk.send_message(event, Some(Box::new(|receipt: &event_courier::DeliveryReceipt| {
//!     println!("delivered to {}", receipt.topic);
//! })))?;
//!
//! let report = sdk.stop(ShutdownOptions::drain(None)).await?;
//! assert!(report.drained);
//! # Ok::<(), event_courier::SdkError>(())
//! # }).unwrap();
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod queue;
pub mod sdk;
pub mod testing;
pub mod transport;

pub use config::SdkConfig;
pub use connection::ConnectionEvent;
pub use error::{ErrorClass, SdkError, SdkResult};
pub use protocol::{EntityReference, EventMessage, RoutingKey};
pub use queue::{DeliveryCallback, DeliveryReceipt, QueueKind};
pub use sdk::{EventSdk, ShutdownOptions, ShutdownReport};
