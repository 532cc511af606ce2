//! Bounded, append-only history of accepted changes.

use std::collections::VecDeque;

use crate::clock::Timestamp;
use crate::event::StateEvent;

pub const DEFAULT_CAPACITY: usize = 1000;

/// FIFO ring of the most recent `StateEvent`s.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<StateEvent>,
    capacity: usize,
    /// Timestamp of the newest event ever evicted; 0 while nothing has been.
    evicted_through: Timestamp,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            evicted_through: 0,
        }
    }

    /// Append an event, evicting the oldest one if the log is full.
    pub fn append(&mut self, event: StateEvent) {
        if self.events.len() == self.capacity {
            if let Some(old) = self.events.pop_front() {
                self.evicted_through = old.timestamp;
            }
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.events.front().map(|e| e.timestamp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateEvent> {
        self.events.iter()
    }

    /// Events with `timestamp > since`, oldest first.
    ///
    /// Returns `None` when an event newer than `since` may already have been
    /// evicted, meaning the caller has to fall back to a full snapshot.
    pub fn since(&self, since: Timestamp) -> Option<Vec<StateEvent>> {
        if self.evicted_through > since {
            return None;
        }
        Some(
            self.events
                .iter()
                .filter(|e| e.timestamp > since)
                .cloned()
                .collect(),
        )
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.evicted_through = 0;
    }

    /// Drop every event and refuse queries from before `horizon`.
    ///
    /// Used when the session is swapped out wholesale, so that callers
    /// holding an older timestamp resynchronize from a full snapshot.
    pub fn reset_to(&mut self, horizon: Timestamp) {
        self.events.clear();
        self.evicted_through = horizon;
    }
}
