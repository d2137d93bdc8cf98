//! Message bus abstractions
//!
//! The bridge core never talks to an MQTT client directly. It publishes via
//! [`BusTransport`] and is driven by the transport through
//! [`BusCallbacks`]; the transport owns connecting, authentication, TLS,
//! subscriptions and reconnection.
//!
//! - [`mqtt::MqttTransport`] - rumqttc-backed transport (requires `mqtt` feature)

#[cfg(feature = "mqtt")]
mod mqtt;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::watch;

use crate::error::Result;

/// Availability payload while the bridge runs
pub const PAYLOAD_ONLINE: &str = "Online";

/// Availability payload once the bridge has gone
pub const PAYLOAD_OFFLINE: &str = "Offline";

/// One message waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPublishRequest {
    /// Destination topic
    pub topic: String,
    /// Message body
    pub payload: Bytes,
    /// Ask the broker to keep this as the topic's last value
    pub retain: bool,
}

impl BusPublishRequest {
    /// Create a request
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// Create a retained request
    pub fn retained(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(topic, payload, true)
    }

    /// Payload as text, for logging
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Outbound side of the message bus
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish one request
    ///
    /// Returns `Err` if the request could not be handed to the broker; the
    /// caller decides whether to retry.
    async fn publish(&self, request: &BusPublishRequest) -> Result<()>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Notifications a bus transport delivers to the bridge
///
/// Implementations must not block: they run on the transport's event loop.
pub trait BusCallbacks: Send + Sync {
    /// The broker answered a connection attempt
    fn on_connect(&self, outcome: ConnectOutcome);

    /// A message arrived on a subscribed topic
    fn on_message(&self, topic: &str, payload: Bytes);

    /// The connection to the broker was lost
    fn on_disconnect(&self);
}

/// Result of a connection attempt, as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Connection accepted
    Accepted,
    /// Broker does not speak our protocol version
    RefusedProtocolVersion,
    /// Client identifier rejected
    RefusedClientId,
    /// Broker unavailable
    ServerUnavailable,
    /// Bad user name or password
    BadCredentials,
    /// Not authorized
    NotAuthorized,
    /// Any other failure
    Other,
}

impl ConnectOutcome {
    /// Map an MQTT 3.1.1 CONNACK return code
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ConnectOutcome::Accepted,
            1 => ConnectOutcome::RefusedProtocolVersion,
            2 => ConnectOutcome::RefusedClientId,
            3 => ConnectOutcome::ServerUnavailable,
            4 => ConnectOutcome::BadCredentials,
            5 => ConnectOutcome::NotAuthorized,
            _ => ConnectOutcome::Other,
        }
    }

    /// Check if the connection was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnectOutcome::Accepted)
    }
}

impl fmt::Display for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Accepted => write!(f, "accepted"),
            ConnectOutcome::RefusedProtocolVersion => {
                write!(f, "refused: incorrect protocol version")
            }
            ConnectOutcome::RefusedClientId => write!(f, "refused: invalid client identifier"),
            ConnectOutcome::ServerUnavailable => write!(f, "refused: server unavailable"),
            ConnectOutcome::BadCredentials => write!(f, "refused: bad username or password"),
            ConnectOutcome::NotAuthorized => write!(f, "refused: not authorized"),
            ConnectOutcome::Other => write!(f, "failed: unknown reason"),
        }
    }
}

/// Shared "bus connected" flag
///
/// Written only from [`BusCallbacks`]; read by the publisher and by startup,
/// which can wait for the first connection.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Create a disconnected status
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Record a connection change
    pub fn set(&self, connected: bool) {
        self.tx.send_replace(connected);
    }

    /// Check the last known state; may be stale
    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the bus reports connected
    pub async fn wait_connected(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|connected| *connected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_publish_request_constructors() {
        let req = BusPublishRequest::retained("projector/a/b/power", "ON");
        assert!(req.retain);
        assert_eq!(req.payload_str(), "ON");

        let req = BusPublishRequest::new("projector/a/b/LWT", PAYLOAD_ONLINE, false);
        assert!(!req.retain);
        assert_eq!(req.payload.as_ref(), b"Online");
    }

    #[test]
    fn test_connect_outcome_codes() {
        assert!(ConnectOutcome::from_code(0).is_accepted());
        assert_eq!(ConnectOutcome::from_code(4), ConnectOutcome::BadCredentials);
        assert_eq!(ConnectOutcome::from_code(5), ConnectOutcome::NotAuthorized);
        assert_eq!(ConnectOutcome::from_code(42), ConnectOutcome::Other);
        assert_eq!(
            ConnectOutcome::ServerUnavailable.to_string(),
            "refused: server unavailable"
        );
    }

    #[test]
    fn test_connection_status_flag() {
        let status = ConnectionStatus::new();
        assert!(!status.is_connected());
        let reader = status.clone();
        status.set(true);
        assert!(reader.is_connected());
        status.set(false);
        assert!(!reader.is_connected());
    }

    #[tokio::test]
    async fn test_wait_connected() {
        let status = ConnectionStatus::new();
        let writer = status.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set(true);
        });
        tokio::time::timeout(Duration::from_secs(1), status.wait_connected())
            .await
            .expect("connection never reported");
    }
}
