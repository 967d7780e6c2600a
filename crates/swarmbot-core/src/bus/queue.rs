//! Async message bus — bounded inbound/outbound queues plus a broadcast
//! fan-out for outbound observers.
//!
//! Publishers block when a queue is full; consumers block when it is empty.
//! Both wake with `KernelError::BusClosed` after `close()`, and with
//! `KernelError::Cancelled` when the caller's cancellation token fires.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{InboundMessage, OutboundMessage};
use crate::errors::KernelError;

/// Buffer size for outbound broadcast subscribers. A slow subscriber that
/// lags past this many messages skips ahead rather than stalling the bus.
const SUBSCRIBER_BUFFER: usize = 256;

/// The message bus connecting transports ↔ orchestration kernel.
///
/// - Transports publish to `inbound` (user messages arriving)
/// - The dispatcher consumes from `inbound`, processes, publishes to `outbound`
/// - Transports consume from `outbound` and deliver to the correct chat
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>,
    subscribers: broadcast::Sender<OutboundMessage>,
    closed: CancellationToken,
}

impl MessageBus {
    /// Create a new message bus with the given per-queue capacity.
    ///
    /// A capacity of zero is clamped to one; the queues are always bounded.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_BUFFER);

        MessageBus {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            subscribers,
            closed: CancellationToken::new(),
        }
    }

    /// Stamp `id` and `timestamp` if the publisher left them empty.
    fn stamp_inbound(msg: &mut InboundMessage) {
        if msg.id.is_empty() {
            msg.id = uuid::Uuid::new_v4().to_string();
        }
        if msg.timestamp.timestamp_millis() == 0 {
            msg.timestamp = chrono::Utc::now();
        }
    }

    fn stamp_outbound(msg: &mut OutboundMessage) {
        if msg.id.is_empty() {
            msg.id = uuid::Uuid::new_v4().to_string();
        }
        if msg.timestamp.timestamp_millis() == 0 {
            msg.timestamp = chrono::Utc::now();
        }
    }

    /// Publish a message from a transport to the kernel (inbound).
    ///
    /// Blocks while the queue is full. Fails with `BusClosed` after `close()`
    /// and `Cancelled` when `ctx` fires first.
    pub async fn publish_inbound(
        &self,
        ctx: &CancellationToken,
        mut msg: InboundMessage,
    ) -> Result<(), KernelError> {
        if msg.content.is_empty() && msg.media.is_empty() {
            return Err(KernelError::InvalidArgument(
                "inbound message has no content".into(),
            ));
        }
        Self::stamp_inbound(&mut msg);

        tokio::select! {
            _ = self.closed.cancelled() => Err(KernelError::BusClosed),
            _ = ctx.cancelled() => Err(KernelError::Cancelled),
            permit = self.inbound_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(msg);
                    Ok(())
                }
                Err(_) => Err(KernelError::BusClosed),
            },
        }
    }

    /// Consume the next inbound message.
    ///
    /// Blocks until a message arrives, the bus closes, or `ctx` fires.
    pub async fn consume_inbound(
        &self,
        ctx: &CancellationToken,
    ) -> Result<InboundMessage, KernelError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(KernelError::BusClosed),
            _ = ctx.cancelled() => Err(KernelError::Cancelled),
            msg = rx.recv() => msg.ok_or(KernelError::BusClosed),
        }
    }

    /// Publish a response from the kernel to a transport (outbound).
    ///
    /// Broadcast subscribers observe the message in publish order.
    pub async fn publish_outbound(
        &self,
        ctx: &CancellationToken,
        mut msg: OutboundMessage,
    ) -> Result<(), KernelError> {
        Self::stamp_outbound(&mut msg);

        tokio::select! {
            _ = self.closed.cancelled() => Err(KernelError::BusClosed),
            _ = ctx.cancelled() => Err(KernelError::Cancelled),
            permit = self.outbound_tx.reserve() => match permit {
                Ok(permit) => {
                    // Fan out before queueing so subscribers see publish order.
                    let _ = self.subscribers.send(msg.clone());
                    permit.send(msg);
                    Ok(())
                }
                Err(_) => Err(KernelError::BusClosed),
            },
        }
    }

    /// Consume the next outbound message.
    pub async fn consume_outbound(
        &self,
        ctx: &CancellationToken,
    ) -> Result<OutboundMessage, KernelError> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(KernelError::BusClosed),
            _ = ctx.cancelled() => Err(KernelError::Cancelled),
            msg = rx.recv() => msg.ok_or(KernelError::BusClosed),
        }
    }

    /// Subscribe to the outbound stream.
    ///
    /// The subscription yields every outbound message published after this
    /// call, and terminates once the bus closes.
    pub fn subscribe_outbound(&self) -> OutboundSubscription {
        OutboundSubscription {
            rx: self.subscribers.subscribe(),
            closed: self.closed.clone(),
        }
    }

    /// Close the bus. Idempotent; pending consumers wake with `BusClosed`.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("message bus closing");
            self.closed.cancel();
        }
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Get a clone of the inbound sender (for transports to use directly).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }
}

/// A live subscription to the outbound stream.
pub struct OutboundSubscription {
    rx: broadcast::Receiver<OutboundMessage>,
    closed: CancellationToken,
}

impl OutboundSubscription {
    /// Receive the next outbound message, or `None` once the bus is closed.
    ///
    /// A subscriber that falls more than the buffer behind skips the missed
    /// messages and keeps going.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                msg = self.rx.recv() => match msg {
                    Ok(msg) => return Some(msg),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "outbound subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// Build a throttled "queued" acknowledgement for a backlogged session.
pub fn queued_ack(channel: &str, chat_id: &str, position: usize) -> OutboundMessage {
    let content = if position == 1 {
        "Got it — one message ahead of yours, I'll reply shortly.".to_string()
    } else {
        format!("Got it — {position} messages ahead of yours, I'll reply shortly.")
    };
    let mut msg = OutboundMessage::new(channel, chat_id, content);
    msg.metadata
        .insert("kind".into(), serde_json::Value::String("queued_ack".into()));
    msg
}
