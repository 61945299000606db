//! Client event stream.
//!
//! Connection lifecycle, pub/sub traffic and monitor feed lines are all
//! delivered as [`ClientEvent`]s on a broadcast channel. The stream is
//! best-effort: a receiver that falls behind loses the oldest events, never
//! command completions (those travel through sinks).

use crate::error::ClientError;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default broadcast buffer per subscriber.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The TCP stream is established; the ready check has not run yet.
    Connect,
    /// The server passed the ready check; queued commands are flowing.
    Ready,
    /// A reconnect attempt is scheduled.
    Reconnecting {
        delay_ms: u64,
        attempt: u64,
        error: Option<String>,
        total_retry_time_ms: u64,
        times_connected: u64,
    },
    Error(Arc<ClientError>),
    /// The connection went down. Emitted once per outage.
    End,
    /// The transport accepted all buffered writes again.
    Drain,
    Warning(String),
    /// One line of the `MONITOR` feed.
    Monitor {
        timestamp: String,
        args: Vec<String>,
        raw: String,
    },
    /// A pub/sub message on a subscribed channel.
    Message { channel: String, payload: Bytes },
    /// A pub/sub message matched by a subscribed pattern.
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Subscribe { channel: String, count: usize },
    Unsubscribe { channel: String, count: usize },
    PSubscribe { pattern: String, count: usize },
    PUnsubscribe { pattern: String, count: usize },
}

/// Broadcast fan-out for [`ClientEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers. Lossy by design: with no
    /// subscriber the event is dropped.
    pub fn emit(&self, event: ClientEvent) {
        tracing::trace!(?event, "emit");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
