//! Testing utilities and mock implementations
//!
//! Lets the coordinator, service and client be exercised without an MQTT broker.
//!
//! ```rust
//! use mqttlink::engine::EngineError;
//! use mqttlink::message::{ConnectOptions, MqttMessage, QoS};
//! use mqttlink::ping::NoopWakeLock;
//! use mqttlink::service::MqttService;
//! use mqttlink::store::SqliteMessageStore;
//! use mqttlink::client::{AckMode, MqttClient};
//! use mqttlink::testing::MockEngineFactory;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let factory = Arc::new(MockEngineFactory::new());
//! let service = Arc::new(MqttService::new(
//!     Arc::new(SqliteMessageStore::in_memory().unwrap()),
//!     factory.clone(),
//!     Arc::new(NoopWakeLock),
//! ));
//! let (client, _events) =
//!     MqttClient::new(service, "tcp://broker.test:1883", "doc", "app", AckMode::Auto)
//!         .await
//!         .unwrap();
//!
//! let engine = factory.engine("doc").unwrap();
//! engine.push_connect_result(Err(EngineError::Rejected("bad credentials".into())));
//! assert!(client.connect(ConnectOptions::default()).await.is_err());
//!
//! client.connect(ConnectOptions::default()).await.unwrap();
//! client.publish("a/b", MqttMessage::new("hi", QoS::AtMostOnce)).await.unwrap();
//! assert_eq!(engine.published().len(), 1);
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
