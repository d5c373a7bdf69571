//! Subscription loop detection.
//!
//! Two misbehaving clients that auto-acknowledge each other's `subscribed`
//! and `unsubscribed` presences can bounce them back and forth forever. A
//! burst of more than [`LOOP_WINDOW_EVENTS`] events from one peer inside
//! [`LOOP_WINDOW`] is treated as such a loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::warn;

pub const LOOP_WINDOW_EVENTS: usize = 5;
pub const LOOP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Subscribed,
    Unsubscribed,
}

/// Sliding window of recent event times per (peer, kind).
#[derive(Debug, Default)]
pub struct SubscriptionEventLog {
    windows: HashMap<(String, SubscriptionKind), VecDeque<Instant>>,
}

impl SubscriptionEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event at `now`; `true` when it completes a loop burst.
    pub fn record(&mut self, jid: &str, kind: SubscriptionKind, now: Instant) -> bool {
        let window = self.windows.entry((jid.to_string(), kind)).or_default();
        window.push_back(now);

        if window.len() <= LOOP_WINDOW_EVENTS {
            return false;
        }

        let looping = window
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) < LOOP_WINDOW);
        window.pop_front();

        if looping {
            warn!(jid = %jid, ?kind, "subscription loop detected");
        }
        looping
    }

    pub fn len(&self, jid: &str, kind: SubscriptionKind) -> usize {
        self.windows
            .get(&(jid.to_string(), kind))
            .map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}
