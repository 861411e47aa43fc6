//! Configuration for the mqttlink service
//!
//! Loaded from TOML and validated after parsing. Broker credentials are never
//! stored in the file: the file names environment variables and the values are
//! read at runtime.

use crate::client::AckMode;
use crate::engine::rumqttc_engine::BrokerAddress;
use crate::message::{ConnectOptions, LastWill, QoS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Locations searched when no config path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["mqttlink.toml", "config/mqttlink.toml"];

/// MQTT client identifiers are length-prefixed with a u16
const MAX_CLIENT_ID_BYTES: usize = 65535;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttLinkConfig {
    #[serde(default)]
    pub service: ServiceSection,
    pub connection: ConnectionSection,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Owning application, part of every connection handle
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// SQLite database holding arrived-but-unacknowledged messages
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Port for the HTTP health server; disabled when absent
    pub health_port: Option<u16>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            store_path: default_store_path(),
            health_port: None,
        }
    }
}

fn default_app_id() -> String {
    "mqttlink".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("mqttlink.db")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Broker URL: mqtt://, tcp://, mqtts:// or ssl://
    pub broker_url: String,
    pub client_id: String,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default)]
    pub ack_mode: AckMode,
    pub will: Option<WillConfig>,
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// Seconds between reachability probes; 0 disables probing
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MqttLinkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MqttLinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// First existing file among [`DEFAULT_CONFIG_PATHS`]
    pub fn find_default_path() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerAddress::parse(&self.connection.broker_url).map_err(|_| {
            ConfigError::InvalidConfig(format!(
                "broker_url '{}' must be an mqtt://, tcp://, mqtts:// or ssl:// URL with a host",
                self.connection.broker_url
            ))
        })?;

        let client_id = &self.connection.client_id;
        if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_BYTES {
            return Err(ConfigError::InvalidConfig(format!(
                "client_id must be 1..={MAX_CLIENT_ID_BYTES} bytes"
            )));
        }

        if self.connection.keep_alive_secs > u16::MAX as u64 {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs {} exceeds {}",
                self.connection.keep_alive_secs,
                u16::MAX
            )));
        }

        for subscription in &self.subscriptions {
            if subscription.topic.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "subscription topic must not be empty".to_string(),
                ));
            }
            parse_qos(subscription.qos)?;
        }

        if let Some(will) = &self.connection.will {
            if will.topic.is_empty() || will.topic.contains(['+', '#']) {
                return Err(ConfigError::InvalidConfig(format!(
                    "invalid will topic '{}'",
                    will.topic
                )));
            }
            parse_qos(will.qos)?;
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.connection.username_env.as_ref())
    }

    /// Get MQTT password from environment variable.
    ///
    /// A configured but unset password variable is an error; a password
    /// silently missing would otherwise surface as a broker auth failure.
    pub fn get_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        self.connection
            .password_env
            .as_deref()
            .map(Self::get_env_var_required)
            .transpose()
    }

    /// Build the connect-options snapshot, resolving credentials from the environment
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let will = match &self.connection.will {
            Some(will) => Some(LastWill {
                topic: will.topic.clone(),
                payload: will.payload.clone().into_bytes(),
                qos: parse_qos(will.qos)?,
                retained: will.retained,
            }),
            None => None,
        };

        Ok(ConnectOptions {
            clean_session: self.connection.clean_session,
            keep_alive: Duration::from_secs(self.connection.keep_alive_secs),
            connection_timeout: Duration::from_secs(self.connection.connection_timeout_secs),
            username: self.get_mqtt_username(),
            password: self.get_mqtt_password()?,
            will,
        })
    }

    pub fn subscription_filters(&self) -> Result<Vec<(String, QoS)>, ConfigError> {
        self.subscriptions
            .iter()
            .map(|s| Ok((s.topic.clone(), parse_qos(s.qos)?)))
            .collect()
    }

    /// Reachability probing parameters, or `None` when disabled
    pub fn probe_settings(&self) -> Option<(Duration, Duration)> {
        (self.network.probe_interval_secs > 0).then(|| {
            (
                Duration::from_secs(self.network.probe_interval_secs),
                Duration::from_millis(self.network.probe_timeout_ms),
            )
        })
    }
}

fn parse_qos(level: u8) -> Result<QoS, ConfigError> {
    QoS::from_u8(level)
        .ok_or_else(|| ConfigError::InvalidConfig(format!("qos {level} must be 0, 1 or 2")))
}
