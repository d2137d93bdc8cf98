//! Home-automation discovery and availability messages
//!
//! The bridge advertises two entities: a switch for power and a select for
//! the input source. Both configs are retained JSON documents on the hub's
//! discovery prefix and point back at the bridge's status, command and
//! availability topics.

use serde::Serialize;

use crate::bus::{BusPublishRequest, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::config::ProjectionistConfig;
use crate::error::Result;
use crate::mapper::TopicMapper;
use crate::translator::{Command, SourceInput};

const VALUE_TEMPLATE: &str = "{{ value }}";

/// Device block shared by every entity
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiscoveryDevice {
    /// Bridge node relaying for the device
    pub via_device: String,
    /// Manufacturer
    pub manufacturer: String,
    /// Model
    pub model: String,
    /// Identifiers the hub groups entities by
    pub identifiers: Vec<String>,
}

/// Fields common to every entity config
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityConfig {
    /// Entity name
    pub name: String,
    /// Where the current value is published
    pub state_topic: String,
    /// Where the hub sends commands
    pub command_topic: String,
    /// Template extracting the value from the state payload
    pub value_template: String,
    /// Bridge availability topic
    pub availability_topic: String,
    /// Payload meaning available
    pub payload_available: String,
    /// Payload meaning not available
    pub payload_not_available: String,
    /// Entity unique id
    pub unique_id: String,
    /// Owning device
    pub device: DiscoveryDevice,
}

/// Power switch config
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Common fields
    #[serde(flatten)]
    pub entity: EntityConfig,
    /// Payload switching on
    pub payload_on: String,
    /// Payload switching off
    pub payload_off: String,
}

/// Input source select config
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SelectConfig {
    /// Common fields
    #[serde(flatten)]
    pub entity: EntityConfig,
    /// Selectable values
    pub options: Vec<String>,
}

/// Builds discovery and availability publishes for one bridge
#[derive(Debug, Clone)]
pub struct DiscoveryBuilder {
    topics: TopicMapper,
    name: String,
    device: DiscoveryDevice,
}

impl DiscoveryBuilder {
    /// Create from configuration
    pub fn new(config: &ProjectionistConfig, topics: TopicMapper) -> Self {
        let device = DiscoveryDevice {
            via_device: config.topic.node_id.clone(),
            manufacturer: config.device.manufacturer.clone(),
            model: config.device.model.clone(),
            identifiers: vec![config.topic.unique_id.clone()],
        };
        Self {
            topics,
            name: config.topic.name.clone(),
            device,
        }
    }

    fn entity(&self, command: Command, label: &str) -> EntityConfig {
        EntityConfig {
            name: format!("{} {label}", self.name),
            state_topic: self.topics.status_topic(command.status_field()),
            command_topic: self.topics.command_topic(command.as_str()),
            value_template: VALUE_TEMPLATE.to_string(),
            availability_topic: self.topics.availability_topic().to_string(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            unique_id: format!("{}_{}", self.topics.unique_id(), command.as_str()),
            device: self.device.clone(),
        }
    }

    /// Power switch entity
    pub fn power_switch(&self) -> SwitchConfig {
        SwitchConfig {
            entity: self.entity(Command::Power, "Power"),
            payload_on: "ON".to_string(),
            payload_off: "OFF".to_string(),
        }
    }

    /// Source select entity
    pub fn source_select(&self) -> SelectConfig {
        SelectConfig {
            entity: self.entity(Command::Source, "Source"),
            options: SourceInput::OPTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Retained discovery configs, power first
    pub fn discovery_requests(&self) -> Result<Vec<BusPublishRequest>> {
        Ok(vec![
            BusPublishRequest::retained(
                self.topics.power_discovery_topic(),
                serde_json::to_vec(&self.power_switch())?,
            ),
            BusPublishRequest::retained(
                self.topics.source_discovery_topic(),
                serde_json::to_vec(&self.source_select())?,
            ),
        ])
    }

    /// Availability publish
    ///
    /// `Online` is sent unretained on every refresh; `Offline` is retained so
    /// it survives the bridge.
    pub fn availability(&self, online: bool) -> BusPublishRequest {
        if online {
            BusPublishRequest::new(self.topics.availability_topic(), PAYLOAD_ONLINE, false)
        } else {
            BusPublishRequest::retained(self.topics.availability_topic(), PAYLOAD_OFFLINE)
        }
    }
}
