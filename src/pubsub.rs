//! Pub/sub mode overlay.
//!
//! `mode` is an integer, not an enum: 0 means not in pub/sub, 1 means fully
//! active, and N > 1 means entry is pending with N−1 normal replies still
//! owed to commands that were in flight when the first subscribe was written.
//! The subscription set is the canonical record of channels and patterns,
//! and survives reconnects so the controller can restore it.

use crate::queue::CommandQueues;
use std::collections::HashSet;

/// Channel subscriptions vs pattern subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubKind {
    Channel,
    Pattern,
}

impl SubKind {
    /// The command that re-establishes a subscription of this kind.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Channel => "subscribe",
            Self::Pattern => "psubscribe",
        }
    }
}

/// Classify a command name. Returns `(kind, adds)` where `adds` is true for
/// subscribe and false for unsubscribe.
pub fn subscribe_family(name: &str) -> Option<(SubKind, bool)> {
    match name {
        "subscribe" => Some((SubKind::Channel, true)),
        "unsubscribe" => Some((SubKind::Channel, false)),
        "psubscribe" => Some((SubKind::Pattern, true)),
        "punsubscribe" => Some((SubKind::Pattern, false)),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct SubscriberState {
    /// 0 = off, 1 = active, N > 1 = pending entry countdown.
    pub mode: usize,
    subs: HashSet<(SubKind, String)>,
}

impl SubscriberState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.mode != 0
    }

    /// Arm entry counting when the first subscribe-family command is
    /// written: every normal reply still owed decrements the counter before
    /// pub/sub routing takes over.
    pub fn enter_pending(&mut self, in_flight_len: usize) {
        if self.mode == 0 {
            self.mode = in_flight_len + 1;
        }
    }

    /// Consume one pending normal reply. Returns true when the reply should
    /// go to the normal dispatcher.
    pub fn countdown(&mut self) -> bool {
        if self.mode > 1 {
            self.mode -= 1;
            true
        } else {
            false
        }
    }

    /// Record an acknowledged subscription change.
    pub fn record_ack(&mut self, kind: SubKind, adds: bool, channel: &str) {
        if adds {
            self.subs.insert((kind, channel.to_string()));
        } else {
            self.subs.remove(&(kind, channel.to_string()));
        }
    }

    /// After an unsubscribe ack reports zero remaining subscriptions, the
    /// mode is re-derived from the in-flight queue: the first pending
    /// subscribe-family command keeps the overlay alive at its position.
    pub fn rederive_mode(&mut self, queues: &CommandQueues) {
        self.mode = 0;
        for (idx, cmd) in queues.in_flight.iter().enumerate() {
            if subscribe_family(&cmd.name).is_some() {
                self.mode = idx + 1;
                break;
            }
        }
    }

    /// Drop the mode on disconnect. Subscriptions themselves survive so
    /// they can be restored on the next ready transition.
    pub fn reset_mode(&mut self) {
        self.mode = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Snapshot of the subscription set, for resubscribe-on-reconnect.
    pub fn entries(&self) -> Vec<(SubKind, String)> {
        self.subs.iter().cloned().collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn classify_subscribe_family() {
        assert_eq!(subscribe_family("subscribe"), Some((SubKind::Channel, true)));
        assert_eq!(subscribe_family("unsubscribe"), Some((SubKind::Channel, false)));
        assert_eq!(subscribe_family("psubscribe"), Some((SubKind::Pattern, true)));
        assert_eq!(subscribe_family("punsubscribe"), Some((SubKind::Pattern, false)));
        assert_eq!(subscribe_family("get"), None);
    }

    #[test]
    fn enter_pending_counts_in_flight() {
        let mut state = SubscriberState::new();
        state.enter_pending(2);
        assert_eq!(state.mode, 3);
        // Already armed: a second subscribe does not re-arm.
        state.enter_pending(5);
        assert_eq!(state.mode, 3);
    }

    #[test]
    fn countdown_until_active() {
        let mut state = SubscriberState::new();
        state.enter_pending(2);
        assert!(state.countdown());
        assert!(state.countdown());
        assert_eq!(state.mode, 1);
        // Fully active: replies are no longer owed to normal commands.
        assert!(!state.countdown());
        assert_eq!(state.mode, 1);
    }

    #[test]
    fn record_ack_updates_set() {
        let mut state = SubscriberState::new();
        state.record_ack(SubKind::Channel, true, "a");
        state.record_ack(SubKind::Pattern, true, "news.*");
        assert_eq!(state.entries().len(), 2);

        state.record_ack(SubKind::Channel, false, "a");
        assert_eq!(
            state.entries(),
            vec![(SubKind::Pattern, "news.*".to_string())]
        );
    }

    #[test]
    fn channel_and_pattern_keys_are_distinct() {
        let mut state = SubscriberState::new();
        state.record_ack(SubKind::Channel, true, "x");
        state.record_ack(SubKind::Pattern, true, "x");
        assert_eq!(state.entries().len(), 2);
        state.record_ack(SubKind::Channel, false, "x");
        assert_eq!(state.entries(), vec![(SubKind::Pattern, "x".to_string())]);
    }

    #[test]
    fn rederive_mode_finds_pending_subscribe() {
        let mut state = SubscriberState::new();
        state.mode = 1;

        let mut queues = CommandQueues::new();
        queues.in_flight.push_back(Command::new("get", vec!["k".into()]));
        queues.in_flight.push_back(Command::new("subscribe", vec!["a".into()]));

        state.rederive_mode(&queues);
        assert_eq!(state.mode, 2);
    }

    #[test]
    fn rederive_mode_clears_when_no_subscribe_pending() {
        let mut state = SubscriberState::new();
        state.mode = 1;
        let queues = CommandQueues::new();
        state.rederive_mode(&queues);
        assert_eq!(state.mode, 0);
    }

    #[test]
    fn reset_mode_keeps_subscriptions() {
        let mut state = SubscriberState::new();
        state.record_ack(SubKind::Channel, true, "a");
        state.mode = 1;
        state.reset_mode();
        assert_eq!(state.mode, 0);
        assert!(!state.is_empty());
    }

    #[test]
    fn entries_snapshot() {
        let mut state = SubscriberState::new();
        state.record_ack(SubKind::Channel, true, "a");
        state.record_ack(SubKind::Channel, true, "b");
        let mut entries = state.entries();
        entries.sort_by(|x, y| x.1.cmp(&y.1));
        assert_eq!(
            entries,
            vec![
                (SubKind::Channel, "a".to_string()),
                (SubKind::Channel, "b".to_string()),
            ]
        );
    }
}
