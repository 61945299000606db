//! The two FIFO queues at the heart of the pipeline.
//!
//! `offline` holds commands submitted while the client is not ready;
//! `in_flight` holds commands whose bytes are on the wire but whose reply
//! has not arrived. A command lives in exactly one queue between creation
//! and completion.

use crate::command::Command;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CommandQueues {
    pub offline: VecDeque<Command>,
    pub in_flight: VecDeque<Command>,
}

impl CommandQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move every in-flight command back onto the head of the offline
    /// queue, preserving submission order. Used when
    /// `retry_unfulfilled_commands` is set and the connection drops.
    pub fn requeue_in_flight(&mut self) {
        while let Some(cmd) = self.in_flight.pop_back() {
            self.offline.push_front(cmd);
        }
    }

    /// Drain both queues, in-flight first, for fatal-transition flushing.
    pub fn drain_in_flight(&mut self) -> VecDeque<Command> {
        std::mem::take(&mut self.in_flight)
    }

    pub fn drain_offline(&mut self) -> VecDeque<Command> {
        std::mem::take(&mut self.offline)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
