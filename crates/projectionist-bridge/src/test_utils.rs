//! Test utilities for running the bridge without hardware or a broker
//!
//! [`MockDevice`] stands in for the serial port and [`MockBus`] for the MQTT
//! client. Both record what the bridge sends and let tests inject input and
//! failures. [`TestFixture`] wires them into a running bridge.
//!
//! # Example
//!
//! ```rust,ignore
//! use projectionist_bridge::test_utils::{test_config, TestFixture};
//!
//! #[tokio::test]
//! async fn test_model_name() {
//!     let fixture = TestFixture::start_connected(test_config());
//!     fixture.device.push_line("*MODELNAME=W1070#");
//!     let published = fixture.bus.wait_for_topic("projector/projectionist/benq/modelname").await;
//!     assert_eq!(published.unwrap().payload_str(), "W1070");
//!     fixture.stop().await.unwrap();
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::bridge::{BridgeHandle, ProjectorBridge};
use crate::bus::{BusCallbacks, BusPublishRequest, BusTransport, ConnectOutcome};
use crate::config::{ProjectionistConfig, ProjectionistConfigBuilder};
use crate::error::{BridgeError, Result};
use crate::interface::{DeviceReader, DeviceWriter};
use crate::protocol::DeviceCommandFrame;

/// Polling interval of the `wait_for_*` helpers
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long the `wait_for_*` helpers wait by default
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Configuration with short delays suitable for tests
///
/// The refresh delay is long, so only the immediate first cycle runs unless a
/// test changes it.
pub fn test_config() -> ProjectionistConfig {
    ProjectionistConfigBuilder::new()
        .settle_time(Duration::from_millis(1))
        .read_timeout(Duration::from_millis(20))
        .refresh_delay(Duration::from_secs(3600))
        .publish_retry_delay(Duration::from_millis(10))
        .build()
}

#[derive(Debug, Default)]
struct DeviceShared {
    lines_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    written: Mutex<Vec<DeviceCommandFrame>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

/// Simulated projector serial port
pub struct MockDevice;

impl MockDevice {
    /// Create a connected reader/writer pair and the handle driving them
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MockReader, MockWriter, MockDeviceHandle) {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(DeviceShared {
            lines_tx: Mutex::new(Some(lines_tx)),
            ..DeviceShared::default()
        });

        (
            MockReader { lines_rx },
            MockWriter {
                shared: shared.clone(),
            },
            MockDeviceHandle { shared },
        )
    }
}

/// Test side of a [`MockDevice`]
#[derive(Debug, Clone)]
pub struct MockDeviceHandle {
    shared: Arc<DeviceShared>,
}

impl MockDeviceHandle {
    /// Make the device emit a line; a newline is appended
    pub fn push_line(&self, line: &str) {
        self.push_raw(format!("{line}\r\n").into_bytes());
    }

    /// Make the device emit raw bytes as one read
    pub fn push_raw(&self, raw: impl Into<Bytes>) {
        if let Some(tx) = self.shared.lines_tx.lock().unwrap().as_ref() {
            let _ = tx.send(raw.into());
        }
    }

    /// Simulate the cable being pulled
    ///
    /// Lines already pushed are still delivered first.
    pub fn disconnect(&self) {
        self.shared.lines_tx.lock().unwrap().take();
    }

    /// Frames written so far
    pub fn written(&self) -> Vec<DeviceCommandFrame> {
        self.shared.written.lock().unwrap().clone()
    }

    /// Bodies of the frames written so far
    pub fn written_bodies(&self) -> Vec<String> {
        self.written()
            .iter()
            .map(|frame| frame.body().to_string())
            .collect()
    }

    /// Forget recorded frames
    pub fn clear_written(&self) {
        self.shared.written.lock().unwrap().clear();
    }

    /// Make every following write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether the bridge closed the device
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` frames were written
    ///
    /// Returns whatever was written once `count` is reached or `timeout`
    /// runs out.
    pub async fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<DeviceCommandFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let written = self.written();
            if written.len() >= count || Instant::now() >= deadline {
                return written;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Reading half of a [`MockDevice`]
#[derive(Debug)]
pub struct MockReader {
    lines_rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl DeviceReader for MockReader {
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        match tokio::time::timeout(timeout, self.lines_rx.recv()).await {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => Err(BridgeError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    fn name(&self) -> &str {
        "mock-device"
    }
}

/// Writing half of a [`MockDevice`]
#[derive(Debug)]
pub struct MockWriter {
    shared: Arc<DeviceShared>,
}

#[async_trait]
impl DeviceWriter for MockWriter {
    async fn write_frame(&mut self, frame: &DeviceCommandFrame) -> Result<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::WriteError("Simulated error".to_string()));
        }
        self.shared.written.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock-device"
    }
}

#[derive(Debug, Default)]
struct BusShared {
    published: Mutex<Vec<BusPublishRequest>>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    disconnected: AtomicBool,
    publish_delay_ms: AtomicU64,
}

/// Simulated bus transport recording every accepted publish
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    shared: Arc<BusShared>,
}

impl MockBus {
    /// Create a new mock bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publish attempts
    pub fn fail_next(&self, count: usize) {
        self.shared.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Make every publish take `delay` before it is accepted
    pub fn set_publish_delay(&self, delay: Duration) {
        self.shared
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Accepted publishes, in order
    pub fn published(&self) -> Vec<BusPublishRequest> {
        self.shared.published.lock().unwrap().clone()
    }

    /// Accepted publishes on one topic, in order
    pub fn published_on(&self, topic: &str) -> Vec<BusPublishRequest> {
        self.published()
            .into_iter()
            .filter(|request| request.topic == topic)
            .collect()
    }

    /// Publish attempts, failed ones included
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Whether the bridge disconnected the bus
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` publishes were accepted
    pub async fn wait_for_publishes(&self, count: usize, timeout: Duration) -> Vec<BusPublishRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let published = self.published();
            if published.len() >= count || Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for the first publish on `topic`
    pub async fn wait_for_topic(&self, topic: &str) -> Option<BusPublishRequest> {
        let deadline = Instant::now() + DEFAULT_WAIT;
        loop {
            if let Some(request) = self.published_on(topic).into_iter().next() {
                return Some(request);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn publish(&self, request: &BusPublishRequest) -> Result<()> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.shared.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failing = self
            .shared
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::PublishFailed {
                topic: request.topic.clone(),
                reason: "Simulated error".to_string(),
            });
        }

        debug!(topic = %request.topic, "Mock publish");
        self.shared.published.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock-bus"
    }
}

/// A bridge running against mocks
pub struct TestFixture {
    /// Handle of the running bridge
    pub handle: BridgeHandle,
    /// Device side
    pub device: MockDeviceHandle,
    /// Bus side
    pub bus: MockBus,
    /// Configuration the bridge runs with
    pub config: ProjectionistConfig,
    task: JoinHandle<Result<()>>,
}

impl TestFixture {
    /// Start a bridge whose bus has not connected yet
    pub fn start(config: ProjectionistConfig) -> Self {
        let (bridge, handle) = ProjectorBridge::new(config.clone());
        let (reader, writer, device) = MockDevice::new();
        let bus = MockBus::new();

        let transport: Arc<dyn BusTransport> = Arc::new(bus.clone());
        let task = tokio::spawn(bridge.run(reader, writer, transport));

        Self {
            handle,
            device,
            bus,
            config,
            task,
        }
    }

    /// Start a bridge with the bus already connected
    pub fn start_connected(config: ProjectionistConfig) -> Self {
        let fixture = Self::start(config);
        fixture.connect();
        fixture
    }

    /// Report a successful bus connection
    pub fn connect(&self) {
        self.handle.callbacks().on_connect(ConnectOutcome::Accepted);
    }

    /// Deliver a bus message to the bridge
    pub fn deliver(&self, topic: &str, payload: &'static [u8]) {
        self.handle
            .callbacks()
            .on_message(topic, Bytes::from_static(payload));
    }

    /// Shut the bridge down and return what `run` returned
    pub async fn stop(self) -> Result<()> {
        // Fails only if the bridge already stopped on its own
        let _ = self.handle.shutdown().await;
        self.join().await
    }

    /// Wait for the bridge to stop on its own
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_device_lines_and_writes() {
        let (mut reader, mut writer, device) = MockDevice::new();

        device.push_line("*POW=ON#");
        let line = reader.read_line(Duration::from_millis(10)).await.unwrap();
        assert_eq!(line.as_deref(), Some(b"*POW=ON#\r\n".as_slice()));

        writer
            .write_frame(&DeviceCommandFrame::new("pow=?"))
            .await
            .unwrap();
        assert_eq!(device.written_bodies(), ["pow=?"]);

        device.set_fail_writes(true);
        assert!(writer
            .write_frame(&DeviceCommandFrame::new("pow=?"))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_reader_timeout_and_disconnect() {
        let (mut reader, _writer, device) = MockDevice::new();
        assert!(reader
            .read_line(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        device.disconnect();
        assert!(matches!(
            reader.read_line(Duration::from_millis(10)).await,
            Err(BridgeError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_mock_bus_scripted_failures() {
        let bus = MockBus::new();
        bus.fail_next(1);

        let request = BusPublishRequest::retained("a/b", "x");
        assert!(bus.publish(&request).await.is_err());
        assert!(bus.publish(&request).await.is_ok());
        assert_eq!(bus.attempts(), 2);
        assert_eq!(bus.published(), vec![request]);

        bus.disconnect().await.unwrap();
        assert!(bus.is_disconnected());
    }
}
