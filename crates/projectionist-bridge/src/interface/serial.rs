//! Serial port interface for the projector's RS-232 port
//!
//! Uses tokio-serial at 8N1 with no flow control. The opened stream is split
//! so the read loop and the device writer never contend for it.

use crate::config::SerialConfig;
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, DeviceReader, DeviceWriter};
use crate::protocol::DeviceCommandFrame;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, error, info, trace};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 256;

/// Serial interface for the projector
///
/// Holds the port settings; [`SerialInterface::open`] yields the two halves.
#[derive(Debug, Clone)]
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>, baud_rate: u32) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate,
            name,
        }
    }

    /// Create from the `[serial]` config section
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(&config.port, config.baud_rate)
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the port and split it
    pub fn open(&self) -> Result<(SerialReader, SerialWriter)> {
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opening serial port");

        if !self.port_path.exists() {
            return Err(BridgeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| BridgeError::PortOpenFailed {
                port: self.port_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let (read_half, write_half) = tokio::io::split(stream);
        info!(port = %self.port_path.display(), "Serial port open");

        Ok((
            SerialReader {
                stream: read_half,
                buffer: BytesMut::with_capacity(READ_BUFFER_SIZE * 2),
                name: self.name.clone(),
            },
            SerialWriter {
                stream: Some(write_half),
                state: ConnectionState::Connected,
                name: self.name.clone(),
            },
        ))
    }
}

/// Receiving half of an open serial port
pub struct SerialReader {
    stream: ReadHalf<SerialStream>,
    buffer: BytesMut,
    name: String,
}

impl SerialReader {
    /// Split off the first complete line, terminator included
    fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        Some(self.buffer.split_to(pos + 1).freeze())
    }
}

#[async_trait]
impl DeviceReader for SerialReader {
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.take_line() {
                trace!(len = line.len(), "Read line from serial port");
                return Ok(Some(line));
            }

            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buffer)).await {
                // An unterminated fragment is handed over once the timeout runs out
                Err(_) if self.buffer.is_empty() => return Ok(None),
                Err(_) => {
                    debug!(len = self.buffer.len(), "Returning unterminated line");
                    return Ok(Some(self.buffer.split().freeze()));
                }
                Ok(Ok(0)) => return Err(BridgeError::Disconnected),
                Ok(Ok(n)) => trace!(bytes = n, "Read from serial port"),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Serial read error");
                    return Err(BridgeError::ReadError(e.to_string()));
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialReader")
            .field("name", &self.name)
            .field("buffer_len", &self.buffer.len())
            .finish()
    }
}

/// Sending half of an open serial port
pub struct SerialWriter {
    stream: Option<WriteHalf<SerialStream>>,
    state: ConnectionState,
    name: String,
}

impl SerialWriter {
    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl DeviceWriter for SerialWriter {
    async fn write_frame(&mut self, frame: &DeviceCommandFrame) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;

        debug!(frame = %frame, size = frame.len(), "Writing frame");

        if let Err(e) = stream.write_all(frame.as_bytes()).await {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            return Err(BridgeError::WriteError(e.to_string()));
        }

        stream
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(format!("Flush failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.state = ConnectionState::Closed;

        info!(name = %self.name, "Serial port closed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialWriter")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

/// Names of the serial ports present on this machine
pub fn list_available_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
