//! ProjectorBridge - worker orchestration
//!
//! The bridge owns two outbound queues and five workers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          ProjectorBridge                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  BusCallbacks ──► dispatch ──┐                   ┌──► bus publisher  │
//! │                              ▼                   │         │         │
//! │                      ┌──────────────┐   ┌──────────────┐   ▼         │
//! │           refresh ──►│ device queue │   │  bus queue   │◄─ refresh   │
//! │                      └──────────────┘   └──────────────┘             │
//! │                              │                   ▲                   │
//! │                              ▼                   │                   │
//! │                        device writer         read loop               │
//! │                              │                   ▲                   │
//! │                              └──► serial port ───┘                   │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the device writer touches the port's write half, and only the read
//! loop its read half. Every other worker talks to the device through the
//! device queue, which keeps frames strictly serialized.
//!
//! # Example
//!
//! ```rust,ignore
//! use projectionist_bridge::{MqttTransport, ProjectorBridge, SerialInterface};
//!
//! let (bridge, handle) = ProjectorBridge::new(config.clone());
//! let (mqtt, _events) = MqttTransport::start(&config, handle.callbacks());
//! handle.wait_connected().await;
//!
//! let (reader, writer) = SerialInterface::from_config(&config.serial).open()?;
//! bridge.run(reader, writer, Arc::new(mqtt)).await?;
//! ```

use bytes::Bytes;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{BusCallbacks, BusTransport, ConnectOutcome, ConnectionStatus};
use crate::config::ProjectionistConfig;
use crate::discovery::DiscoveryBuilder;
use crate::error::{BridgeError, Result};
use crate::interface::{DeviceReader, DeviceWriter};
use crate::mapper::TopicMapper;
use crate::parser::LineParser;
use crate::queue::{outbound_queue, BusQueueReceiver, DeviceQueueReceiver};
use crate::workers::{self, WorkerContext};

/// Capacity of the handle's command channel
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// A message delivered by the bus, waiting for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames written to the device
    pub frames_written: u64,
    /// Non-empty lines read from the device
    pub lines_read: u64,
    /// Requests the bus accepted
    pub messages_published: u64,
    /// Publish attempts that failed or found the bus disconnected
    pub publish_failures: u64,
    /// Failed requests put back for another attempt
    pub publish_retries: u64,
    /// Bus commands translated into device frames
    pub commands_dispatched: u64,
    /// Device lines nobody understood
    pub unknown_lines: u64,
    /// Bus messages on topics or commands we do not handle
    pub unknown_topics: u64,
    /// Completed refresh cycles
    pub refresh_cycles: u64,
}

/// Live counters behind [`BridgeStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub frames_written: AtomicU64,
    pub lines_read: AtomicU64,
    pub messages_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub publish_retries: AtomicU64,
    pub commands_dispatched: AtomicU64,
    pub unknown_lines: AtomicU64,
    pub unknown_topics: AtomicU64,
    pub refresh_cycles: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        BridgeStats {
            frames_written: load(&self.frames_written),
            lines_read: load(&self.lines_read),
            messages_published: load(&self.messages_published),
            publish_failures: load(&self.publish_failures),
            publish_retries: load(&self.publish_retries),
            commands_dispatched: load(&self.commands_dispatched),
            unknown_lines: load(&self.unknown_lines),
            unknown_topics: load(&self.unknown_topics),
            refresh_cycles: load(&self.refresh_cycles),
        }
    }
}

/// Commands that can be sent to the bridge
#[derive(Debug)]
enum BridgeCommand {
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bus event sink feeding the bridge
///
/// Runs on the transport's event loop, so nothing here blocks: the connected
/// flag is a watch channel and messages go through `try_send`.
#[derive(Debug)]
pub struct BridgeCallbacks {
    connection: ConnectionStatus,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl BusCallbacks for BridgeCallbacks {
    fn on_connect(&self, outcome: ConnectOutcome) {
        if outcome.is_accepted() {
            info!("Connected to MQTT broker");
            self.connection.set(true);
        } else {
            error!("MQTT connection {outcome}");
            self.connection.set(false);
        }
    }

    fn on_message(&self, topic: &str, payload: Bytes) {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload,
        };
        match self.inbound_tx.try_send(message) {
            Ok(()) => trace!(topic, "Inbound message queued"),
            Err(TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "Inbound channel full, dropping message")
            }
            Err(TrySendError::Closed(message)) => {
                debug!(topic = %message.topic, "Bridge stopped, dropping message")
            }
        }
    }

    fn on_disconnect(&self) {
        warn!("Disconnected from MQTT broker");
        self.connection.set(false);
    }
}

/// Handle for controlling the ProjectorBridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    callbacks: Arc<BridgeCallbacks>,
    connection: ConnectionStatus,
}

impl BridgeHandle {
    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::QueueClosed("command"))?;
        rx.await.map_err(|_| BridgeError::QueueClosed("command"))
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::QueueClosed("command"))
    }

    /// Callbacks for the bus transport
    pub fn callbacks(&self) -> Arc<dyn BusCallbacks> {
        self.callbacks.clone()
    }

    /// Whether the bus currently reports connected
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Wait for the bus to connect
    pub async fn wait_connected(&self) {
        self.connection.wait_connected().await
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Projector bridge service
pub struct ProjectorBridge {
    /// Configuration
    config: ProjectionistConfig,

    /// Discovery and availability messages
    discovery: DiscoveryBuilder,

    /// Device line classifier
    parser: LineParser,

    /// State shared by the workers
    context: WorkerContext,

    /// Consumer side of the device queue
    device_rx: DeviceQueueReceiver,

    /// Consumer side of the bus queue
    bus_rx: BusQueueReceiver,

    /// Messages from the bus callbacks
    inbound_rx: mpsc::Receiver<InboundMessage>,

    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,

    /// Stops every worker
    shutdown_tx: watch::Sender<bool>,
}

impl ProjectorBridge {
    /// Create a new bridge and its handle
    ///
    /// No transport is needed yet: start the bus with
    /// [`BridgeHandle::callbacks`], then hand both transports to
    /// [`ProjectorBridge::run`].
    pub fn new(config: ProjectionistConfig) -> (Self, BridgeHandle) {
        let capacity = config.worker.queue_capacity;
        let timeout = config.worker.queue_timeout();

        let (device_tx, device_rx) = outbound_queue("device", capacity, timeout);
        let (bus_tx, bus_rx) = outbound_queue("bus", capacity, timeout);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let topics = TopicMapper::from_config(&config.topic);
        let discovery = DiscoveryBuilder::new(&config, topics.clone());
        let parser = LineParser::new(config.serial.power_on_artifact.clone());
        let connection = ConnectionStatus::new();

        let context = WorkerContext {
            topics,
            device_tx,
            bus_tx,
            connection: connection.clone(),
            stats: Arc::new(StatsCounters::default()),
            shutdown: shutdown_rx,
        };

        let callbacks = Arc::new(BridgeCallbacks {
            connection: connection.clone(),
            inbound_tx,
        });

        let handle = BridgeHandle {
            command_tx,
            callbacks,
            connection,
        };

        let bridge = Self {
            config,
            discovery,
            parser,
            context,
            device_rx,
            bus_rx,
            inbound_rx,
            command_rx,
            shutdown_tx,
        };

        (bridge, handle)
    }

    /// Run the bridge until shutdown or the first fatal error
    ///
    /// On either path the shutdown sequence runs: stop dispatching bus
    /// commands, let the publisher finish its current request, publish
    /// `Offline`, close the device, disconnect the bus.
    /// A fatal error is returned after that.
    pub async fn run<R, W>(self, reader: R, writer: W, bus: Arc<dyn BusTransport>) -> Result<()>
    where
        R: DeviceReader + 'static,
        W: DeviceWriter + 'static,
    {
        let ProjectorBridge {
            config,
            discovery,
            parser,
            context,
            device_rx,
            bus_rx,
            inbound_rx,
            mut command_rx,
            shutdown_tx,
        } = self;

        info!(
            device = writer.name(),
            bus = bus.name(),
            base = context.topics.base(),
            refresh = ?config.worker.refresh_delay,
            "Starting projector bridge"
        );

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        let dispatch = spawn_worker(
            "dispatch",
            &fatal_tx,
            workers::dispatch_loop(inbound_rx, context.clone()),
        );
        let publisher = spawn_worker(
            "bus publisher",
            &fatal_tx,
            workers::bus_publisher(
                bus.clone(),
                bus_rx,
                config.worker.publish_retry_delay,
                context.clone(),
            ),
        );
        let device_writer = spawn_worker(
            "device writer",
            &fatal_tx,
            workers::device_writer(writer, device_rx, config.serial.settle_time, context.clone()),
        );
        let refresh = spawn_worker(
            "refresh",
            &fatal_tx,
            workers::refresh_worker(
                discovery.clone(),
                config.worker.refresh_delay,
                context.clone(),
            ),
        );
        let read_loop = spawn_worker(
            "read loop",
            &fatal_tx,
            workers::read_loop(reader, parser, config.serial.read_timeout, context.clone()),
        );
        drop(fatal_tx);

        let failure = loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(BridgeCommand::GetStats(reply)) => {
                        let _ = reply.send(context.stats.snapshot());
                    }
                    Some(BridgeCommand::Shutdown) | None => {
                        info!("Shutdown requested");
                        break None;
                    }
                },
                Some((worker, err)) = fatal_rx.recv() => {
                    error!(worker, error = %err, code = err.error_code(), "Worker failed");
                    break Some(err);
                }
            }
        };

        shutdown_tx.send_replace(true);

        // Dispatch goes first so no command reaches the device after this
        let _ = dispatch.await;

        // A publish still in flight must not land after Offline
        let _ = tokio::join!(refresh, publisher);

        let offline = discovery.availability(false);
        match bus.publish(&offline).await {
            Ok(()) => info!(topic = %offline.topic, "Published offline availability"),
            Err(e) => warn!(error = %e, "Failed to publish offline availability"),
        }

        let (writer, _reader) = tokio::join!(device_writer, read_loop);
        if let Ok(Some(mut writer)) = writer {
            if let Err(e) = writer.close().await {
                warn!(error = %e, device = writer.name(), "Failed to close device");
            }
        }

        if let Err(e) = bus.disconnect().await {
            warn!(error = %e, "Failed to disconnect from bus");
        }

        info!(stats = ?context.stats.snapshot(), "Projector bridge stopped");

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Spawn a worker, reporting its error or panic on `fatal_tx`
fn spawn_worker<T, F>(
    name: &'static str,
    fatal_tx: &mpsc::UnboundedSender<(&'static str, BridgeError)>,
    worker: F,
) -> JoinHandle<Option<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let fatal_tx = fatal_tx.clone();
    tokio::spawn(async move {
        debug!(worker = name, "Worker started");
        let outcome = match AssertUnwindSafe(worker).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Internal(format!("{name} worker panicked"))),
        };
        match outcome {
            Ok(value) => {
                debug!(worker = name, "Worker stopped");
                Some(value)
            }
            Err(err) => {
                let _ = fatal_tx.send((name, err));
                None
            }
        }
    })
}
