//! Configuration types for the projector bridge
//!
//! This module provides configuration structures for the MQTT connection,
//! the topic namespace, the advertised device, the serial port and the
//! worker timing. Configuration is read from a TOML file; every field has a
//! default so a minimal file only names what differs.
//!
//! ```toml
//! [mqtt]
//! hostname = "broker.local"
//! username = "projector"
//! password = "secret"
//!
//! [topic]
//! prefix = "projector"
//! node_id = "livingroom"
//! object_id = "benq"
//!
//! [worker]
//! refresh_delay = "60s"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default baud rate for projector RS-232 ports
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default serial device path
pub const DEFAULT_SERIAL_PORT: &str = "/dev/serial0";

/// Pause after each frame so the projector can process it
pub const DEFAULT_SETTLE_TIME_MS: u64 = 100;

/// Line read timeout; bounds how long the read loop ignores shutdown
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Interval between full state refreshes
pub const DEFAULT_REFRESH_DELAY_SECS: u64 = 60;

/// Longest accepted refresh interval (one week)
pub const MAX_REFRESH_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

/// Queue timeout as a multiple of the refresh interval
pub const QUEUE_TIMEOUT_FACTOR: f64 = 1.1;

/// Line the projector emits while warming up after power-on
pub const DEFAULT_POWER_ON_ARTIFACT: &str = "*Block item#";

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectionistConfig {
    /// MQTT broker connection
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Topic namespace and discovery settings
    #[serde(default)]
    pub topic: TopicConfig,

    /// Device description advertised in discovery messages
    #[serde(default)]
    pub device: DeviceConfig,

    /// Serial port settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Worker timing and queue sizing
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// User name, if the broker requires authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password, if the broker requires authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Connect over TLS
    #[serde(default)]
    pub use_tls: bool,

    /// Keepalive interval
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,

    /// Client identifier (defaults to the topic node id)
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            use_tls: false,
            keepalive: default_keepalive(),
            client_id: None,
        }
    }
}

/// Topic namespace: `<prefix>/<node_id>/<object_id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// First topic segment
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Second topic segment, usually the bridge host
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Third topic segment, usually the projector
    #[serde(default = "default_object_id")]
    pub object_id: String,

    /// Unique id used by the home-automation hub
    #[serde(default = "default_unique_id")]
    pub unique_id: String,

    /// Friendly entity name
    #[serde(default = "default_name")]
    pub name: String,

    /// Prefix the hub listens on for discovery configs
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

fn default_prefix() -> String {
    "projector".to_string()
}

fn default_node_id() -> String {
    "projectionist".to_string()
}

fn default_object_id() -> String {
    "benq".to_string()
}

fn default_unique_id() -> String {
    "projectionist_benq".to_string()
}

fn default_name() -> String {
    "Projector".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            node_id: default_node_id(),
            object_id: default_object_id(),
            unique_id: default_unique_id(),
            name: default_name(),
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

/// Device description for discovery messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Manufacturer name
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_manufacturer() -> String {
    "BenQ".to_string()
}

fn default_model() -> String {
    "Projector".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            manufacturer: default_manufacturer(),
            model: default_model(),
        }
    }
}

/// Serial port settings (always 8N1, no flow control)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Path to serial port
    #[serde(default = "default_serial_port")]
    pub port: PathBuf,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Timeout for a single line read
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Pause after each written frame
    #[serde(with = "humantime_serde", default = "default_settle_time")]
    pub settle_time: Duration,

    /// Line treated as an implicit power query
    #[serde(default = "default_power_on_artifact")]
    pub power_on_artifact: String,
}

fn default_serial_port() -> PathBuf {
    PathBuf::from(DEFAULT_SERIAL_PORT)
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_settle_time() -> Duration {
    Duration::from_millis(DEFAULT_SETTLE_TIME_MS)
}

fn default_power_on_artifact() -> String {
    DEFAULT_POWER_ON_ARTIFACT.to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: default_read_timeout(),
            settle_time: default_settle_time(),
            power_on_artifact: default_power_on_artifact(),
        }
    }
}

/// Worker timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Interval between full state refreshes
    #[serde(with = "humantime_serde", default = "default_refresh_delay")]
    pub refresh_delay: Duration,

    /// Capacity of each outbound queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pause after a failed publish before the publisher continues
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub publish_retry_delay: Duration,
}

fn default_refresh_delay() -> Duration {
    Duration::from_secs(DEFAULT_REFRESH_DELAY_SECS)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            refresh_delay: default_refresh_delay(),
            queue_capacity: default_queue_capacity(),
            publish_retry_delay: default_retry_delay(),
        }
    }
}

impl WorkerConfig {
    /// Bound on every blocking queue operation
    ///
    /// A worker starved for longer than one refresh cycle means its producer
    /// is gone.
    ///
    /// Saturates instead of overflowing for absurd refresh delays.
    pub fn queue_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.refresh_delay.as_secs_f64() * QUEUE_TIMEOUT_FACTOR)
            .unwrap_or(Duration::MAX)
    }
}

impl ProjectionistConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        let segments = [
            ("topic.prefix", &self.topic.prefix),
            ("topic.node_id", &self.topic.node_id),
            ("topic.object_id", &self.topic.object_id),
            ("topic.unique_id", &self.topic.unique_id),
            ("topic.discovery_prefix", &self.topic.discovery_prefix),
        ];
        for (key, value) in segments {
            if value.is_empty() {
                return Err(BridgeError::InvalidConfig(format!("{key} must not be empty")));
            }
            if value.contains(['+', '#']) {
                return Err(BridgeError::InvalidConfig(format!(
                    "{key} must not contain MQTT wildcards: {value}"
                )));
            }
        }
        if self.worker.refresh_delay.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "worker.refresh_delay must be greater than zero".to_string(),
            ));
        }
        if self.worker.refresh_delay > Duration::from_secs(MAX_REFRESH_DELAY_SECS) {
            return Err(BridgeError::InvalidConfig(format!(
                "worker.refresh_delay must be at most {}",
                humantime::format_duration(Duration::from_secs(MAX_REFRESH_DELAY_SECS))
            )));
        }
        if self.worker.queue_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "worker.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.mqtt.username.is_none() && self.mqtt.password.is_some() {
            return Err(BridgeError::InvalidConfig(
                "mqtt.password requires mqtt.username".to_string(),
            ));
        }
        Ok(())
    }

    /// MQTT client identifier
    pub fn client_id(&self) -> &str {
        self.mqtt
            .client_id
            .as_deref()
            .unwrap_or(self.topic.node_id.as_str())
    }
}

/// Builder for ProjectionistConfig
#[derive(Debug, Default)]
pub struct ProjectionistConfigBuilder {
    config: ProjectionistConfig,
}

impl ProjectionistConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker host and port
    pub fn broker(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.hostname = hostname.into();
        self.config.mqtt.port = port;
        self
    }

    /// Set the topic namespace
    pub fn namespace(
        mut self,
        prefix: impl Into<String>,
        node_id: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Self {
        self.config.topic.prefix = prefix.into();
        self.config.topic.node_id = node_id.into();
        self.config.topic.object_id = object_id.into();
        self
    }

    /// Set the discovery unique id
    pub fn unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.config.topic.unique_id = unique_id.into();
        self
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.serial.port = port.into();
        self
    }

    /// Set the pause after each frame
    pub fn settle_time(mut self, settle: Duration) -> Self {
        self.config.serial.settle_time = settle;
        self
    }

    /// Set the line read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial.read_timeout = timeout;
        self
    }

    /// Set the refresh interval
    pub fn refresh_delay(mut self, delay: Duration) -> Self {
        self.config.worker.refresh_delay = delay;
        self
    }

    /// Set queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.worker.queue_capacity = capacity;
        self
    }

    /// Set the pause after a failed publish
    pub fn publish_retry_delay(mut self, delay: Duration) -> Self {
        self.config.worker.publish_retry_delay = delay;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ProjectionistConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
