//! Bounded outbound work queues
//!
//! Each queue is a FIFO with many producers and one consumer. Every blocking
//! operation carries a timeout: a producer that cannot enqueue, or a consumer
//! that receives nothing, within `timeout` gets a fatal error instead of
//! waiting forever on a dead peer.

use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::trace;

use crate::bus::BusPublishRequest;
use crate::error::{BridgeError, Result};
use crate::protocol::DeviceCommandFrame;

/// Producer half of the device queue
pub type DeviceQueueSender = QueueSender<DeviceCommandFrame>;

/// Consumer half of the device queue
pub type DeviceQueueReceiver = QueueReceiver<DeviceCommandFrame>;

/// Producer half of the bus queue
pub type BusQueueSender = QueueSender<BusPublishRequest>;

/// Consumer half of the bus queue
pub type BusQueueReceiver = QueueReceiver<BusPublishRequest>;

/// Create a bounded queue
///
/// `name` appears in logs and errors.
pub fn outbound_queue<T>(
    name: &'static str,
    capacity: usize,
    timeout: Duration,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueSender { name, tx, timeout },
        QueueReceiver { name, rx, timeout },
    )
}

/// Producer half; clone it for every producer
#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    timeout: Duration,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue, waiting at most the queue timeout for capacity
    pub async fn push(&self, item: T) -> Result<()> {
        match self.tx.send_timeout(item, self.timeout).await {
            Ok(()) => {
                trace!(queue = self.name, "Enqueued");
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(BridgeError::QueueStalled {
                queue: self.name,
                waited: self.timeout,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(BridgeError::QueueClosed(self.name)),
        }
    }

    /// Enqueue every item in order
    pub async fn push_all(&self, items: impl IntoIterator<Item = T>) -> Result<()> {
        for item in items {
            self.push(item).await?;
        }
        Ok(())
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Free slots right now
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half; owned by exactly one worker
#[derive(Debug)]
pub struct QueueReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    timeout: Duration,
}

impl<T> QueueReceiver<T> {
    /// Dequeue, waiting at most the queue timeout
    pub async fn pop(&mut self) -> Result<T> {
        match tokio::time::timeout(self.timeout, self.rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(BridgeError::QueueClosed(self.name)),
            Err(_) => Err(BridgeError::QueueTimeout {
                queue: self.name,
                waited: self.timeout,
            }),
        }
    }

    /// Dequeue if something is waiting
    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Items waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
