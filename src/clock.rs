//! Wall-clock timestamps in nanoseconds since the Unix epoch.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Nanosecond timestamp. Zero means "never".
pub type Timestamp = i64;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Current wall-clock time in nanoseconds.
pub fn now_nanos() -> Timestamp {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000)
}

/// Hands out strictly increasing timestamps.
///
/// Two mutations applied within the same clock tick still get distinct
/// stamps, so "modified after T" queries never tie.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Timestamp {
        let wall = now_nanos();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Raise the floor so later stamps stay ahead of `ts` (used after a load).
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }
}
