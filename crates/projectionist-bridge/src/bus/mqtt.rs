//! MQTT transport backed by rumqttc
//!
//! The transport owns the rumqttc event loop. It forwards broker events to
//! [`BusCallbacks`], renews the command subscription on every successful
//! connect and registers an `Offline` last will on the availability topic so
//! the hub learns about a crash.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Packet, QoS, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{
    BusCallbacks, BusPublishRequest, BusTransport, ConnectOutcome, PAYLOAD_OFFLINE,
};
use crate::config::ProjectionistConfig;
use crate::error::{BridgeError, Result};
use crate::mapper::TopicMapper;

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Pause between reconnection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// MQTT bus transport
pub struct MqttTransport {
    client: AsyncClient,
    name: String,
}

impl MqttTransport {
    /// Create the client and spawn its event loop
    ///
    /// The event loop connects in the background; progress is reported
    /// through `callbacks`. The returned handle ends after
    /// [`BusTransport::disconnect`].
    pub fn start(
        config: &ProjectionistConfig,
        callbacks: Arc<dyn BusCallbacks>,
    ) -> (Self, JoinHandle<()>) {
        let topics = TopicMapper::from_config(&config.topic);
        let options = Self::options(config, &topics);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let name = format!("mqtt:{}:{}", config.mqtt.hostname, config.mqtt.port);

        info!(
            host = %config.mqtt.hostname,
            port = config.mqtt.port,
            tls = config.mqtt.use_tls,
            client_id = config.client_id(),
            "Starting MQTT client"
        );

        let handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            topics.command_filter(),
            callbacks,
        ));

        (Self { client, name }, handle)
    }

    fn options(config: &ProjectionistConfig, topics: &TopicMapper) -> MqttOptions {
        let mut options = MqttOptions::new(
            config.client_id(),
            config.mqtt.hostname.clone(),
            config.mqtt.port,
        );
        options.set_keep_alive(config.mqtt.keepalive);
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics.availability_topic(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let Some(username) = &config.mqtt.username {
            let password = config.mqtt.password.clone().unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }

        if config.mqtt.use_tls {
            debug!("Enabling TLS for MQTT");
            options.set_transport(Transport::tls_with_default_config());
        }

        options
    }
}

/// Drive the rumqttc event loop until the client disconnects
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    command_filter: String,
    callbacks: Arc<dyn BusCallbacks>,
) {
    let mut connected = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                let outcome = map_return_code(code);
                if outcome.is_accepted() {
                    connected = true;
                    // Subscribing on every connect renews the subscription
                    // after a reconnect
                    if let Err(e) = client.try_subscribe(command_filter.as_str(), QoS::AtLeastOnce)
                    {
                        warn!(error = %e, filter = %command_filter, "Failed to subscribe");
                    } else {
                        debug!(filter = %command_filter, "Subscribed to command topics");
                    }
                }
                callbacks.on_connect(outcome);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message");
                callbacks.on_message(&publish.topic, publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                if connected {
                    connected = false;
                    callbacks.on_disconnect();
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!("MQTT client disconnecting");
                if connected {
                    callbacks.on_disconnect();
                }
                break;
            }
            Ok(event) => {
                trace!(?event, "MQTT event");
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                connected = false;
                callbacks.on_connect(map_return_code(code));
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(ConnectionError::RequestsDone) => {
                debug!("MQTT request channel closed");
                break;
            }
            Err(e) => {
                if connected {
                    connected = false;
                    callbacks.on_disconnect();
                }
                warn!(error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    info!("MQTT event loop stopped");
}

fn map_return_code(code: ConnectReturnCode) -> ConnectOutcome {
    match code {
        ConnectReturnCode::Success => ConnectOutcome::Accepted,
        ConnectReturnCode::RefusedProtocolVersion => ConnectOutcome::RefusedProtocolVersion,
        ConnectReturnCode::BadClientId => ConnectOutcome::RefusedClientId,
        ConnectReturnCode::ServiceUnavailable => ConnectOutcome::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => ConnectOutcome::BadCredentials,
        ConnectReturnCode::NotAuthorized => ConnectOutcome::NotAuthorized,
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn publish(&self, request: &BusPublishRequest) -> Result<()> {
        self.client
            .try_publish(
                request.topic.as_str(),
                QoS::AtLeastOnce,
                request.retain,
                request.payload.to_vec(),
            )
            .map_err(|e| BridgeError::PublishFailed {
                topic: request.topic.clone(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(|e| {
            error!(error = %e, "MQTT disconnect failed");
            BridgeError::PublishFailed {
                topic: String::new(),
                reason: e.to_string(),
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectionistConfigBuilder;

    #[test]
    fn test_return_code_mapping() {
        assert_eq!(
            map_return_code(ConnectReturnCode::Success),
            ConnectOutcome::Accepted
        );
        assert_eq!(
            map_return_code(ConnectReturnCode::BadUserNamePassword),
            ConnectOutcome::BadCredentials
        );
        assert_eq!(
            map_return_code(ConnectReturnCode::NotAuthorized),
            ConnectOutcome::NotAuthorized
        );
    }

    #[test]
    fn test_options_from_config() {
        let mut config = ProjectionistConfigBuilder::new()
            .broker("broker.local", 8883)
            .namespace("projector", "den", "benq")
            .build();
        config.mqtt.username = Some("user".to_string());
        config.mqtt.password = Some("pass".to_string());

        let topics = TopicMapper::from_config(&config.topic);
        let options = MqttTransport::options(&config, &topics);

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.client_id(), "den");
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
        let will = options.last_will().expect("last will");
        assert_eq!(will.topic, "projector/den/benq/LWT");
        assert!(will.retain);
    }
}
