//! Connection event log.
//!
//! Append-only, bounded history of connection lifecycle events. The
//! monitoring side only ever reads snapshots; loops append as things happen.

use crate::stats::unix_millis;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Default number of retained events
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Link or session established
    Connected,
    /// Link or session closed
    Disconnected,
    /// Session removed by the idle sweep
    Reaped,
    /// Connection refused at the session ceiling
    Rejected,
    /// Client moved to another relay endpoint
    Switched,
    /// Relay endpoint failed probing
    Unreachable,
}

/// One logged event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unix milliseconds
    pub timestamp_ms: u64,
    /// Event type
    pub kind: EventKind,
    /// What the event is about (session id, endpoint name, peer address)
    pub subject: String,
    /// Optional detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Bounded event history; oldest events are dropped first
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventLog {
    /// Create a log retaining at most `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024))),
        }
    }

    /// Append an event
    pub fn append(&self, kind: EventKind, subject: impl Into<String>) {
        self.push(Event {
            timestamp_ms: unix_millis(),
            kind,
            subject: subject.into(),
            detail: None,
        });
    }

    /// Append an event with a detail message
    pub fn append_with_detail(
        &self,
        kind: EventKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.push(Event {
            timestamp_ms: unix_millis(),
            kind,
            subject: subject.into(),
            detail: Some(detail.into()),
        });
    }

    fn push(&self, event: Event) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy of all retained events, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }

    /// The `n` most recent events, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    /// Number of retained events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
