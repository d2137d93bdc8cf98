//! Projector serial port to MQTT bridge
//!
//! This crate connects a projector's RS-232 control port to an MQTT broker.
//! It polls the projector's state, publishes it as retained topics,
//! announces the projector to a home-automation hub through discovery
//! messages and turns commands received over MQTT into serial frames.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Transports** - Serial port ([`interface`]) and MQTT client ([`bus`])
//! 2. **Protocol** - Frame encoding ([`protocol`]), response parsing
//!    ([`parser`]) and command translation ([`translator`])
//! 3. **Queues** - Bounded FIFOs decoupling producers from the single device
//!    writer and the single bus publisher ([`queue`])
//! 4. **Workers** - Five tasks orchestrated by [`ProjectorBridge`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: projectionist-bridge = { version = "0.1", features = ["full"] }
//!
//! use projectionist_bridge::{
//!     MqttTransport, ProjectionistConfig, ProjectorBridge, SerialInterface,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProjectionistConfig::load("config.toml")?;
//!
//!     let (bridge, handle) = ProjectorBridge::new(config.clone());
//!     let (mqtt, _events) = MqttTransport::start(&config, handle.callbacks());
//!     handle.wait_connected().await;
//!
//!     let (reader, writer) = SerialInterface::from_config(&config.serial).open()?;
//!     bridge.run(reader, writer, Arc::new(mqtt)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//! - `mqtt` - MQTT transport via rumqttc
//! - `full` - Enable both
//!
//! # Message Flow
//!
//! ## Projector → MQTT
//!
//! 1. The read loop reads a line such as `*POW=ON#`
//! 2. [`LineParser`] classifies it as a status report
//! 3. A retained publish to `<base>/power` goes on the bus queue
//! 4. The bus publisher delivers it, retrying until the broker accepts it
//!
//! ## MQTT → Projector
//!
//! 1. A message arrives on `<base>/power/set`
//! 2. [`translate`] produces `pow=on` followed by `pow=?`
//! 3. Both frames go on the device queue
//! 4. The device writer sends them one at a time, pausing in between

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod interface;
pub mod protocol;

pub mod bus;
pub mod discovery;
pub mod mapper;
pub mod parser;
pub mod queue;
pub mod translator;

pub mod bridge;
mod workers;

pub mod test_utils;

pub use config::{
    DeviceConfig, MqttConfig, ProjectionistConfig, ProjectionistConfigBuilder, SerialConfig,
    TopicConfig, WorkerConfig,
};
pub use error::{BridgeError, Result};
pub use interface::{ConnectionState, DeviceReader, DeviceWriter};

#[cfg(feature = "serial")]
pub use interface::{list_available_ports, SerialInterface, SerialReader, SerialWriter};

pub use bus::{
    BusCallbacks, BusPublishRequest, BusTransport, ConnectOutcome, ConnectionStatus,
    PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};

#[cfg(feature = "mqtt")]
pub use bus::MqttTransport;

pub use discovery::DiscoveryBuilder;
pub use mapper::TopicMapper;
pub use parser::{LineParser, ParsedLine};
pub use protocol::{DeviceCommandFrame, StatusField};
pub use queue::{outbound_queue, QueueReceiver, QueueSender};
pub use translator::{translate, Command, SourceInput};

pub use bridge::{BridgeCallbacks, BridgeHandle, BridgeStats, InboundMessage, ProjectorBridge};

pub use test_utils::{MockBus, MockDevice, MockDeviceHandle, TestFixture};

// Protocol constants re-exports
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_MQTT_PORT, DEFAULT_POWER_ON_ARTIFACT, DEFAULT_REFRESH_DELAY_SECS,
    DEFAULT_SERIAL_PORT, MAX_REFRESH_DELAY_SECS, QUEUE_TIMEOUT_FACTOR,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
