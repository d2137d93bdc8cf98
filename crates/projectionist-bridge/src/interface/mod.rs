//! Device transport for projector communication
//!
//! The serial line is full duplex, so the transport is split into two
//! halves with one owner each: [`DeviceWriter`] belongs to the device writer
//! worker, [`DeviceReader`] to the read loop.
//!
//! - [`serial::SerialInterface`] - Serial port communication (requires `serial` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: pulls in `tokio-serial`. Port enumeration with USB details
//!   additionally needs `libudev-dev` and `pkg-config` on Linux.

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{list_available_ports, SerialInterface, SerialReader, SerialWriter};

use crate::error::Result;
use crate::protocol::DeviceCommandFrame;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Receiving half of a device link
#[async_trait]
pub trait DeviceReader: Send {
    /// Read one line, terminator included
    ///
    /// Returns `None` if no complete line arrived within `timeout`.
    /// Returns `Err` when the link is gone. Must be cancel safe: a partially
    /// received line survives a dropped call.
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Sending half of a device link
#[async_trait]
pub trait DeviceWriter: Send {
    /// Write one frame and flush it
    async fn write_frame(&mut self, frame: &DeviceCommandFrame) -> Result<()>;

    /// Release the device
    async fn close(&mut self) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Successfully connected
    Connected,
    /// Closed by us
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
