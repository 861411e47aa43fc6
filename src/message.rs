//! Core value types shared by the store, the engine and the coordinator
//!
//! Everything in here is plain data: connection handles, activity tokens,
//! messages and the connect-options snapshot that is captured at connect time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Quality of service level for a publish or a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Parse a numeric QoS level (0, 1 or 2)
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtLeastOnce
    }
}

/// An application message, inbound or outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    pub duplicate: bool,
}

impl MqttMessage {
    pub fn new(payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            payload: payload.into(),
            qos,
            retained: false,
            duplicate: false,
        }
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Payload rendered as UTF-8, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// Last will published by the broker when the session ends abnormally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

/// Snapshot of connect options.
///
/// Captured by the coordinator when `connect` is called and reused verbatim
/// for every reconnect of the same handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<LastWill>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            username: None,
            password: None,
            will: None,
        }
    }
}

impl ConnectOptions {
    /// Options for a persistent session (clean session disabled)
    pub fn persistent() -> Self {
        Self {
            clean_session: false,
            ..Default::default()
        }
    }
}

/// Opaque identifier of a logical connection.
///
/// Derived from the `{server URI, client id, owning application}` triple so the
/// same triple always maps to the same handle, which is also the key under
/// which its inbound messages are buffered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(server_uri: &str, client_id: &str, app_id: &str) -> Self {
        Self(format!("{server_uri}:{client_id}:{app_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a buffered inbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Correlation token for one asynchronous caller operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityToken(pub u64);

impl fmt::Display for ActivityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
