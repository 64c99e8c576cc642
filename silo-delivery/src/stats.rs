//! Delivery statistics
//!
//! Plain atomic counters shared through the delivery context.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    /// Messages accepted by intake
    stored: AtomicU64,
    /// Messages delivered from the store
    dumped_messages: AtomicU64,
    /// Messages that exhausted their retries
    failed_messages: AtomicU64,
    /// Reminders delivered
    dumped_reminders: AtomicU64,
    /// Reminders that failed
    failed_reminders: AtomicU64,
    /// Delivery retries scheduled
    retried: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub stored: u64,
    pub dumped_messages: u64,
    pub failed_messages: u64,
    pub dumped_reminders: u64,
    pub failed_reminders: u64,
    pub retried: u64,
}

impl Stats {
    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one reconciled outcome
    pub fn record_outcome(&self, reminder: bool, delivered: bool) {
        let counter = match (reminder, delivered) {
            (false, true) => &self.dumped_messages,
            (false, false) => &self.failed_messages,
            (true, true) => &self.dumped_reminders,
            (true, false) => &self.failed_reminders,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            stored: self.stored.load(Ordering::Relaxed),
            dumped_messages: self.dumped_messages.load(Ordering::Relaxed),
            failed_messages: self.failed_messages.load(Ordering::Relaxed),
            dumped_reminders: self.dumped_reminders.load(Ordering::Relaxed),
            failed_reminders: self.failed_reminders.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}
