//! Monotonic counters used to derive request and notification ids

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter starting at zero
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment and return the new value
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Counts subscribe sessions and session-less API calls
pub(crate) static SUBSCRIBE_COUNTER: Counter = Counter::new();

/// Counts keyspace notifications processed
pub(crate) static NOTIFICATION_COUNTER: Counter = Counter::new();
