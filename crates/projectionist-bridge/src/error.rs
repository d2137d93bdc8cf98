//! Error types for projector bridge operations
//!
//! This module provides error handling for the bridge: the serial device
//! link, the outbound work queues, the MQTT bus and configuration loading.
//! Parser and translator problems never surface here; unrecognised input is
//! logged and dropped where it is seen.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Serial/Device Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Device link closed
    #[error("Device disconnected")]
    Disconnected,

    // ===== Queue Errors =====
    /// A producer waited longer than the queue timeout for free capacity
    #[error("{queue} queue stalled: no capacity after {waited:?}")]
    QueueStalled {
        /// Queue name
        queue: &'static str,
        /// How long the producer waited
        waited: Duration,
    },

    /// A consumer waited longer than the queue timeout for work
    #[error("{queue} queue idle for {waited:?}, producer presumed dead")]
    QueueTimeout {
        /// Queue name
        queue: &'static str,
        /// How long the consumer waited
        waited: Duration,
    },

    /// Channel closed
    #[error("{0} queue closed")]
    QueueClosed(&'static str),

    // ===== Bus Errors =====
    /// Publish was rejected or could not be handed to the client
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Topic of the failed request
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// The broker is not connected
    #[error("MQTT broker not connected")]
    BusNotConnected,

    // ===== Configuration Errors =====
    /// Configuration file could not be read
    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        /// Config file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Discovery payload serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bridge task ended unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error should terminate the process
    ///
    /// Device link failures and stalled queues cannot be recovered without a
    /// restart. Bus errors never qualify.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::Disconnected
                | BridgeError::QueueStalled { .. }
                | BridgeError::QueueTimeout { .. }
                | BridgeError::QueueClosed(_)
                | BridgeError::Internal(_)
                | BridgeError::Io(_)
        )
    }

    /// Check if the failed operation may simply be attempted again later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::PublishFailed { .. } | BridgeError::BusNotConnected
        )
    }

    /// Check if this is a configuration problem
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BridgeError::ConfigRead { .. }
                | BridgeError::ConfigParse(_)
                | BridgeError::InvalidConfig(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::QueueStalled { .. } => "QUEUE_STALLED",
            BridgeError::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            BridgeError::QueueClosed(_) => "QUEUE_CLOSED",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::BusNotConnected => "BUS_NOT_CONNECTED",
            BridgeError::ConfigRead { .. } => "CONFIG_READ",
            BridgeError::ConfigParse(_) => "CONFIG_PARSE",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::Serialization(_) => "SERIALIZATION",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serial port errors (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for BridgeError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::PortNotFound("/dev/serial0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(BridgeError::BusNotConnected.error_code(), "BUS_NOT_CONNECTED");
    }

    #[test]
    fn test_device_errors_are_fatal() {
        assert!(BridgeError::WriteError("broken pipe".to_string()).is_fatal());
        assert!(BridgeError::Disconnected.is_fatal());
        assert!(BridgeError::QueueTimeout {
            queue: "device",
            waited: Duration::from_secs(66),
        }
        .is_fatal());
    }

    #[test]
    fn test_bus_errors_are_not_fatal() {
        let err = BridgeError::PublishFailed {
            topic: "projector/a/b/power".to_string(),
            reason: "request queue full".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.is_retriable());
        assert!(!BridgeError::BusNotConnected.is_fatal());
        assert!(BridgeError::BusNotConnected.is_retriable());
        assert!(!BridgeError::Disconnected.is_retriable());
    }

    #[test]
    fn test_queue_stalled_message() {
        let err = BridgeError::QueueStalled {
            queue: "bus",
            waited: Duration::from_secs(66),
        };
        let text = err.to_string();
        assert!(text.contains("bus"));
        assert!(text.contains("66s"));
    }

    #[test]
    fn test_config_error_classification() {
        assert!(BridgeError::InvalidConfig("empty prefix".to_string()).is_config_error());
        assert!(!BridgeError::Disconnected.is_config_error());
    }
}
