//! Protocol engine seam
//!
//! The coordinator never speaks MQTT itself. It drives an engine through
//! [`ProtocolEngine`] and receives asynchronous engine events on a channel.
//! [`RumqttcEngine`] is the production engine; tests use the mock in
//! `crate::testing::mocks`.

use crate::message::{ConnectOptions, MqttMessage, QoS};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod rumqttc_engine;

pub use rumqttc_engine::{RumqttcEngine, RumqttcEngineFactory};

/// Engine-level errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid server URI: {0}")]
    InvalidServerUri(String),
    #[error("Connection rejected: {0}")]
    Rejected(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Engine is not connected")]
    NotConnected,
    #[error("Request failed: {0}")]
    RequestFailed(String),
}

/// Engine-assigned token for an in-flight publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub u64);

/// Events the engine reports outside of any caller request
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A message arrived on a subscribed topic
    MessageArrived { topic: String, message: MqttMessage },
    /// An established session broke
    ConnectionLost { cause: String },
    /// The broker completed the QoS flow for a publish
    DeliveryComplete(DeliveryToken),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Underlying MQTT client, treated as a black box
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Connect and wait for the broker's acknowledgement
    async fn connect(&self, options: &ConnectOptions) -> Result<(), EngineError>;

    /// Disconnect, optionally letting in-flight work drain for `quiesce`
    async fn disconnect(&self, quiesce: Option<Duration>) -> Result<(), EngineError>;

    /// Queue a publish; completion is reported later as [`EngineEvent::DeliveryComplete`]
    async fn publish(&self, topic: &str, message: &MqttMessage)
        -> Result<DeliveryToken, EngineError>;

    async fn subscribe(&self, filters: &[(String, QoS)]) -> Result<(), EngineError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError>;

    /// Keep-alive check. The engine decides whether a wire-level ping is needed.
    async fn check_activity(&self) -> Result<(), EngineError>;

    fn is_connected(&self) -> bool;
}

/// Creates one engine per connection handle
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        server_uri: &str,
        client_id: &str,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ProtocolEngine>, EngineError>;
}
