//! mqttlink - MQTT connection lifecycle management
//!
//! Keeps MQTT connections alive across network loss, buffers every arrived
//! message durably until the application acknowledges it, and redelivers the
//! backlog in arrival order when a session is (re)established.
//!
//! # Overview
//!
//! - [`store`]: durable inbound message buffer (SQLite)
//! - [`engine`]: protocol engine seam and the rumqttc implementation
//! - [`ping`]: keep-alive scheduling under a wake lock
//! - [`coordinator`]: per-handle connection state machine
//! - [`network`]: reachability monitoring and recovery
//! - [`service`] and [`client`]: the caller-facing API
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqttlink::client::{AckMode, ClientEvent, MqttClient};
//! use mqttlink::engine::RumqttcEngineFactory;
//! use mqttlink::message::{ConnectOptions, QoS};
//! use mqttlink::ping::NoopWakeLock;
//! use mqttlink::service::MqttService;
//! use mqttlink::store::SqliteMessageStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(MqttService::new(
//!     Arc::new(SqliteMessageStore::open("buffer.db")?),
//!     Arc::new(RumqttcEngineFactory),
//!     Arc::new(NoopWakeLock),
//! ));
//!
//! let (client, mut events) =
//!     MqttClient::new(service, "mqtt://localhost:1883", "sensor-1", "demo", AckMode::Auto).await?;
//! client.connect(ConnectOptions::persistent()).await?;
//! client.subscribe(vec![("sensors/#".to_string(), QoS::AtLeastOnce)]).await?;
//!
//! while let Some(ClientEvent::MessageArrived { topic, message, .. }) = events.recv().await {
//!     println!("{topic}: {}", message.payload_str());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod message;
pub mod network;
pub mod observability;
pub mod ping;
pub mod registry;
pub mod service;
pub mod store;
pub mod testing;

pub use client::{AckMode, ClientEvent, MqttClient};
pub use config::{ConfigError, MqttLinkConfig};
pub use coordinator::{ConnectionCoordinator, ConnectionRecord, ConnectionState, ServiceEvent};
pub use error::{ServiceError, ServiceResult};
pub use message::{
    ActivityToken, ConnectOptions, ConnectionHandle, LastWill, MessageId, MqttMessage, QoS,
};
pub use network::{NetworkMonitor, Reachability, TcpProbe};
pub use service::MqttService;
pub use store::{MessageStore, SqliteMessageStore, StoredMessage};
