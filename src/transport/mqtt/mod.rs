//! MQTT v5 session implementation
//!
//! - [`connection`] - pure option building and broker URL parsing
//! - [`message_handler`] - pure event routing
//! - [`client`] - the [`MqttSession`] I/O wrapper
//!
//! # Usage
//!
//! ```rust,no_run
//! use event_courier::auth::Credentials;
//! use event_courier::config::BrokerSection;
//! use event_courier::transport::{mqtt::MqttSession, Session};
//!
//! # tokio_test::block_on(async {
//! let session = MqttSession::new(BrokerSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     keep_alive_secs: 60,
//!     connect_timeout_secs: 10,
//! });
//! session.connect("my-client", &Credentials::anonymous()).await?;
//! session.send("/organizations/acme/projects/web/events/user-1", "{}".into()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttSession;
pub use connection::{configure_mqtt_options, parse_broker_url, BrokerAddress};
pub use message_handler::{EventRoute, MessageHandler};
