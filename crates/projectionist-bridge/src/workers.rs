//! Bridge worker loops
//!
//! Each worker runs until the shutdown signal flips or it hits a fatal
//! error, which it returns to the bridge. Bus trouble is never fatal here:
//! the publisher keeps retrying.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::bridge::{InboundMessage, StatsCounters};
use crate::bus::{BusPublishRequest, BusTransport, ConnectionStatus};
use crate::discovery::DiscoveryBuilder;
use crate::error::{BridgeError, Result};
use crate::interface::{DeviceReader, DeviceWriter};
use crate::mapper::TopicMapper;
use crate::parser::{LineParser, ParsedLine};
use crate::protocol::{DeviceCommandFrame, StatusField};
use crate::queue::{BusQueueReceiver, BusQueueSender, DeviceQueueReceiver, DeviceQueueSender};
use crate::translator::translate;

/// State every worker shares
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    pub topics: TopicMapper,
    pub device_tx: DeviceQueueSender,
    pub bus_tx: BusQueueSender,
    pub connection: ConnectionStatus,
    pub stats: Arc<StatsCounters>,
    pub shutdown: watch::Receiver<bool>,
}

/// Resolves once shutdown is requested or the bridge is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sole writer of the device: one frame at a time, then a settle pause
pub(crate) async fn device_writer<W: DeviceWriter>(
    mut writer: W,
    mut queue: DeviceQueueReceiver,
    settle_time: Duration,
    ctx: WorkerContext,
) -> Result<W> {
    let mut shutdown = ctx.shutdown.clone();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            frame = queue.pop() => frame?,
        };

        writer.write_frame(&frame).await?;
        StatsCounters::bump(&ctx.stats.frames_written);
        trace!(frame = %frame, "Frame written");

        tokio::time::sleep(settle_time).await;
    }

    debug!(pending = queue.len(), "Device writer stopped");
    Ok(writer)
}

/// Publish a request if the bus is up
async fn publish_once(
    bus: &dyn BusTransport,
    connection: &ConnectionStatus,
    request: &BusPublishRequest,
) -> Result<()> {
    if !connection.is_connected() {
        return Err(BridgeError::BusNotConnected);
    }
    bus.publish(request).await
}

/// Sole publisher on the bus, at least once per request
///
/// Nothing is dequeued while the bus is down. A request that fails is held
/// and retried before anything newer, which keeps the queue's FIFO order.
pub(crate) async fn bus_publisher(
    bus: Arc<dyn BusTransport>,
    mut queue: BusQueueReceiver,
    retry_delay: Duration,
    ctx: WorkerContext,
) -> Result<()> {
    let mut shutdown = ctx.shutdown.clone();
    let mut held: Option<BusPublishRequest> = None;

    loop {
        if !ctx.connection.is_connected() {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ctx.connection.wait_connected() => {}
            }
            debug!(held = held.is_some(), pending = queue.len(), "Bus connected, publishing");
        }

        let request = match held.take() {
            Some(request) => request,
            None => tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                request = queue.pop() => request?,
            },
        };

        match publish_once(bus.as_ref(), &ctx.connection, &request).await {
            Ok(()) => {
                StatsCounters::bump(&ctx.stats.messages_published);
                trace!(topic = %request.topic, retain = request.retain, "Published");
                continue;
            }
            Err(e) if e.is_retriable() => {
                StatsCounters::bump(&ctx.stats.publish_failures);
                warn!(topic = %request.topic, error = %e, "Publish failed, will retry");
            }
            Err(e) => return Err(e),
        }

        StatsCounters::bump(&ctx.stats.publish_retries);
        held = Some(request);

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }

    if let Some(request) = held {
        debug!(topic = %request.topic, "Dropping unpublished request on shutdown");
    }
    debug!(pending = queue.len(), "Bus publisher stopped");
    Ok(())
}

/// One refresh cycle: status queries, discovery, availability
async fn refresh_once(discovery: &DiscoveryBuilder, ctx: &WorkerContext) -> Result<()> {
    ctx.device_tx
        .push_all(StatusField::ALL.map(DeviceCommandFrame::query))
        .await?;
    ctx.bus_tx.push_all(discovery.discovery_requests()?).await?;
    ctx.bus_tx.push(discovery.availability(true)).await
}

/// Periodic refresh, first cycle immediately
pub(crate) async fn refresh_worker(
    discovery: DiscoveryBuilder,
    refresh_delay: Duration,
    ctx: WorkerContext,
) -> Result<()> {
    let mut shutdown = ctx.shutdown.clone();
    let mut ticker = tokio::time::interval(refresh_delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        debug!("Refreshing device status");
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = refresh_once(&discovery, &ctx) => result?,
        }
        StatsCounters::bump(&ctx.stats.refresh_cycles);
    }

    Ok(())
}

/// Enqueue whatever a parsed line asks for
async fn handle_line(parsed: &ParsedLine, ctx: &WorkerContext) -> Result<()> {
    if *parsed == ParsedLine::Unknown {
        StatsCounters::bump(&ctx.stats.unknown_lines);
    }
    if let Some(request) = parsed.publish_request(&ctx.topics) {
        ctx.bus_tx.push(request).await?;
    }
    if let Some(frame) = parsed.device_frame() {
        ctx.device_tx.push(frame).await?;
    }
    Ok(())
}

/// Sole reader of the device
pub(crate) async fn read_loop<R: DeviceReader>(
    mut reader: R,
    parser: LineParser,
    read_timeout: Duration,
    ctx: WorkerContext,
) -> Result<R> {
    let mut shutdown = ctx.shutdown.clone();
    info!(device = reader.name(), "Reading device responses");

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            line = reader.read_line(read_timeout) => line?,
        };
        let Some(raw) = line else { continue };

        let text = LineParser::decode(&raw);
        if text.is_empty() {
            continue;
        }
        StatsCounters::bump(&ctx.stats.lines_read);

        let parsed = parser.parse(&text);
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = handle_line(&parsed, &ctx) => result?,
        }
    }

    debug!("Read loop stopped");
    Ok(reader)
}

/// Translate one bus message into device frames
async fn dispatch_message(message: &InboundMessage, ctx: &WorkerContext) -> Result<()> {
    let Some(command) = ctx.topics.command_for_topic(&message.topic) else {
        StatsCounters::bump(&ctx.stats.unknown_topics);
        debug!(topic = %message.topic, "Ignoring message on unknown topic");
        return Ok(());
    };

    let frames = translate(command, &message.payload);
    if frames.is_empty() {
        StatsCounters::bump(&ctx.stats.unknown_topics);
        return Ok(());
    }

    debug!(command, frames = frames.len(), "Dispatching command");
    ctx.device_tx.push_all(frames).await?;
    StatsCounters::bump(&ctx.stats.commands_dispatched);
    Ok(())
}

/// Bus command dispatch, in arrival order
pub(crate) async fn dispatch_loop(
    mut inbound: mpsc::Receiver<InboundMessage>,
    ctx: WorkerContext,
) -> Result<()> {
    let mut shutdown = ctx.shutdown.clone();

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = dispatch_message(&message, &ctx) => result?,
        }
    }

    // Late messages are refused from here on
    inbound.close();
    debug!("Dispatch stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ConnectionStatus;
    use crate::config::ProjectionistConfigBuilder;
    use crate::queue::outbound_queue;
    use crate::test_utils::{MockBus, MockDevice};
    use bytes::Bytes;

    const QUEUE_TIMEOUT: Duration = Duration::from_secs(66);

    struct Harness {
        ctx: WorkerContext,
        device_rx: DeviceQueueReceiver,
        bus_rx: BusQueueReceiver,
        shutdown_tx: watch::Sender<bool>,
    }

    fn harness(capacity: usize) -> Harness {
        let (device_tx, device_rx) = outbound_queue("device", capacity, QUEUE_TIMEOUT);
        let (bus_tx, bus_rx) = outbound_queue("bus", capacity, QUEUE_TIMEOUT);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let config = ProjectionistConfigBuilder::new()
            .namespace("base", "node", "obj")
            .build();
        let ctx = WorkerContext {
            topics: TopicMapper::from_config(&config.topic),
            device_tx,
            bus_tx,
            connection: ConnectionStatus::new(),
            stats: Arc::new(StatsCounters::default()),
            shutdown,
        };
        Harness {
            ctx,
            device_rx,
            bus_rx,
            shutdown_tx,
        }
    }

    fn message(topic: &str, payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_dispatch_blank_off() {
        let mut h = harness(8);
        dispatch_message(&message("base/node/obj/blank/set", b"OFF"), &h.ctx)
            .await
            .unwrap();

        assert_eq!(h.device_rx.try_pop().unwrap().body(), "blank=off");
        assert_eq!(h.device_rx.try_pop().unwrap().body(), "blank=?");
        assert!(h.device_rx.is_empty());
        assert_eq!(h.ctx.stats.snapshot().commands_dispatched, 1);
    }

    #[tokio::test]
    async fn test_dispatch_ignores_unknown_topics() {
        let h = harness(8);
        for topic in [
            "base/node/obj/volume/set",
            "base/node/obj/power",
            "elsewhere/power/set",
        ] {
            dispatch_message(&message(topic, b"ON"), &h.ctx).await.unwrap();
        }
        assert!(h.device_rx.is_empty());
        assert_eq!(h.ctx.stats.snapshot().unknown_topics, 3);
    }

    #[tokio::test]
    async fn test_status_line_becomes_retained_publish() {
        let mut h = harness(8);
        let parsed = LineParser::default().parse("*MODELNAME=ABC123#");
        handle_line(&parsed, &h.ctx).await.unwrap();

        let request = h.bus_rx.try_pop().unwrap();
        assert_eq!(request, BusPublishRequest::retained("base/node/obj/modelname", "ABC123"));
        assert!(h.device_rx.is_empty());
    }

    #[tokio::test]
    async fn test_power_on_artifact_requeries_power() {
        let mut h = harness(8);
        let parsed = LineParser::default().parse("*Block item#");
        handle_line(&parsed, &h.ctx).await.unwrap();

        assert_eq!(h.device_rx.try_pop().unwrap().body(), "pow=?");
        assert!(h.bus_rx.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_cycle_traffic() {
        let mut h = harness(16);
        let config = ProjectionistConfigBuilder::new()
            .namespace("base", "node", "obj")
            .build();
        let discovery = DiscoveryBuilder::new(&config, h.ctx.topics.clone());
        refresh_once(&discovery, &h.ctx).await.unwrap();

        let bodies: Vec<String> = std::iter::from_fn(|| h.device_rx.try_pop())
            .map(|f| f.body().to_string())
            .collect();
        assert_eq!(bodies, ["modelname=?", "ltim=?", "pow=?", "sour=?", "blank=?"]);

        let topics: Vec<String> = std::iter::from_fn(|| h.bus_rx.try_pop())
            .map(|r| r.topic)
            .collect();
        assert_eq!(topics.len(), 3);
        assert!(topics[0].ends_with("_power/config"));
        assert!(topics[1].ends_with("_source/config"));
        assert_eq!(topics[2], "base/node/obj/LWT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_retries_until_delivered() {
        let h = harness(8);
        h.ctx.connection.set(true);
        let bus = MockBus::new();
        bus.fail_next(2);

        h.ctx
            .bus_tx
            .push(BusPublishRequest::retained("base/node/obj/power", "ON"))
            .await
            .unwrap();

        let task = tokio::spawn(bus_publisher(
            Arc::new(bus.clone()),
            h.bus_rx,
            Duration::from_secs(1),
            h.ctx.clone(),
        ));

        let published = bus.wait_for_publishes(1, Duration::from_secs(10)).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload_str(), "ON");
        assert_eq!(bus.attempts(), 3);

        let stats = h.ctx.stats.snapshot();
        assert_eq!(stats.publish_failures, 2);
        assert_eq!(stats.publish_retries, 2);
        assert_eq!(stats.messages_published, 1);

        h.shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_waits_for_connection() {
        let h = harness(8);
        let bus = MockBus::new();
        h.ctx
            .bus_tx
            .push(BusPublishRequest::retained("base/node/obj/blank", "OFF"))
            .await
            .unwrap();

        let task = tokio::spawn(bus_publisher(
            Arc::new(bus.clone()),
            h.bus_rx,
            Duration::from_secs(1),
            h.ctx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(bus.published().is_empty());
        assert_eq!(bus.attempts(), 0);

        h.ctx.connection.set(true);
        let published = bus.wait_for_publishes(1, Duration::from_secs(5)).await;
        assert_eq!(published[0].topic, "base/node/obj/blank");

        h.shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_keeps_order_across_reconnect() {
        let h = harness(8);
        let bus = MockBus::new();

        for payload in ["ON", "OFF"] {
            h.ctx
                .bus_tx
                .push(BusPublishRequest::retained("base/node/obj/power", payload))
                .await
                .unwrap();
        }

        let task = tokio::spawn(bus_publisher(
            Arc::new(bus.clone()),
            h.bus_rx,
            Duration::from_secs(1),
            h.ctx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.ctx.connection.set(true);

        let published = bus.wait_for_publishes(2, Duration::from_secs(10)).await;
        let payloads: Vec<_> = published.iter().map(|r| r.payload_str().into_owned()).collect();
        assert_eq!(payloads, ["ON", "OFF"]);
        assert_eq!(h.ctx.stats.snapshot().publish_failures, 0);

        h.shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_is_retried_before_newer_ones() {
        let h = harness(8);
        h.ctx.connection.set(true);
        let bus = MockBus::new();
        bus.fail_next(3);

        for (topic, payload) in [("power", "ON"), ("source", "HDMI"), ("power", "OFF")] {
            h.ctx
                .bus_tx
                .push(BusPublishRequest::retained(format!("base/node/obj/{topic}"), payload))
                .await
                .unwrap();
        }

        let task = tokio::spawn(bus_publisher(
            Arc::new(bus.clone()),
            h.bus_rx,
            Duration::from_secs(1),
            h.ctx.clone(),
        ));

        let published = bus.wait_for_publishes(3, Duration::from_secs(10)).await;
        let payloads: Vec<_> = published.iter().map(|r| r.payload_str().into_owned()).collect();
        assert_eq!(payloads, ["ON", "HDMI", "OFF"]);
        assert_eq!(bus.attempts(), 6);

        h.shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_writer_fails_on_write_error() {
        let h = harness(8);
        let (_reader, writer, device) = MockDevice::new();
        device.set_fail_writes(true);

        h.ctx.device_tx.push(DeviceCommandFrame::new("pow=?")).await.unwrap();
        let result = device_writer(writer, h.device_rx, Duration::from_millis(100), h.ctx.clone()).await;

        let err = result.unwrap_err();
        assert_eq!(err.error_code(), "WRITE_ERROR");
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_writer_times_out_without_producers() {
        let h = harness(8);
        let (_reader, writer, _device) = MockDevice::new();

        let result = device_writer(writer, h.device_rx, Duration::from_millis(100), h.ctx.clone()).await;
        assert_eq!(result.unwrap_err().error_code(), "QUEUE_TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_fails_when_device_disconnects() {
        let h = harness(8);
        let (reader, _writer, device) = MockDevice::new();
        device.push_line("*POW=ON#");
        device.disconnect();

        let result = read_loop(reader, LineParser::default(), Duration::from_secs(1), h.ctx.clone()).await;
        assert!(matches!(result, Err(BridgeError::Disconnected)));
        assert_eq!(h.ctx.stats.snapshot().lines_read, 1);
    }

    #[tokio::test]
    async fn test_dispatch_loop_stops_on_shutdown() {
        let h = harness(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let task = tokio::spawn(dispatch_loop(inbound_rx, h.ctx.clone()));

        h.shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
        assert!(inbound_tx
            .try_send(message("base/node/obj/power/set", b"ON"))
            .is_err());
    }
}
