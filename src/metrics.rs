//! Driver observability counters and summaries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Snapshot of driver counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverMetricsSnapshot {
    /// Compaction requests acknowledged by servers.
    pub dispatched: u64,
    /// Individual request attempts that failed.
    pub request_failures: u64,
    /// Tasks re-enqueued after a transient failure.
    pub retries: u64,
    /// Tasks forwarded to another server's queue because the region moved.
    pub forwarded: u64,
    /// Pairs that exhausted their retries or failed permanently.
    pub failed_pairs: u64,
    /// Pairs observed at or below the fragment threshold.
    pub converged_pairs: u64,
    /// Fragment-count polls issued.
    pub polls: u64,
    /// Fragment-count polls that returned an error.
    pub poll_errors: u64,
}

/// Shared driver counters.
#[derive(Debug, Default)]
pub struct DriverMetrics {
    dispatched: AtomicU64,
    request_failures: AtomicU64,
    retries: AtomicU64,
    forwarded: AtomicU64,
    failed_pairs: AtomicU64,
    converged_pairs: AtomicU64,
    polls: AtomicU64,
    poll_errors: AtomicU64,
}

impl DriverMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> DriverMetricsSnapshot {
        DriverMetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed_pairs: self.failed_pairs.load(Ordering::Relaxed),
            converged_pairs: self.converged_pairs.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dispatch(&self) {
        add_saturating(&self.dispatched, 1);
    }

    pub(crate) fn record_request_failure(&self) {
        add_saturating(&self.request_failures, 1);
    }

    pub(crate) fn record_retry(&self, forwarded: bool) {
        add_saturating(&self.retries, 1);
        if forwarded {
            add_saturating(&self.forwarded, 1);
        }
    }

    pub(crate) fn record_failed_pair(&self) {
        add_saturating(&self.failed_pairs, 1);
    }

    pub(crate) fn record_converged(&self) {
        add_saturating(&self.converged_pairs, 1);
    }

    pub(crate) fn record_poll(&self, ok: bool) {
        add_saturating(&self.polls, 1);
        if !ok {
            add_saturating(&self.poll_errors, 1);
        }
    }
}

/// Current and peak number of in-flight requests against one server.
#[derive(Debug, Default)]
pub(crate) struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    /// Count one request in flight until the returned guard drops.
    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        InFlightGuard { gauge: self }
    }

    pub(crate) fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

pub(crate) struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::AcqRel);
    }
}

fn add_saturating(counter: &AtomicU64, delta: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_add(delta))
    });
}
