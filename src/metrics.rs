//! Run-scoped counters

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one batch run; reset at the start of every run
#[derive(Default)]
pub struct RunMetrics {
    /// (service, position) pairs attempted
    queries_attempted: AtomicU64,
    /// Attempts whose record carries an error message
    queries_failed: AtomicU64,
    /// Successful `one_result` deliveries, summed over writers
    records_delivered: AtomicU64,
    /// Failed `one_result` deliveries, summed over writers
    delivery_failures: AtomicU64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.queries_attempted.store(0, Ordering::Relaxed);
        self.queries_failed.store(0, Ordering::Relaxed);
        self.records_delivered.store(0, Ordering::Relaxed);
        self.delivery_failures.store(0, Ordering::Relaxed);
    }

    pub fn inc_attempted(&self) {
        self.queries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivered(&self) {
        self.records_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivery_failures(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            queries_attempted: self.queries_attempted.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    pub queries_attempted: u64,
    pub queries_failed: u64,
    pub records_delivered: u64,
    pub delivery_failures: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} queries ({} with errors), {} records delivered, {} delivery failures",
            self.queries_attempted, self.queries_failed, self.records_delivered, self.delivery_failures
        )
    }
}
