//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed_permanently: u64,
    pub claim_errors: u64,
    pub finalize_errors: u64,
    pub timeouts: u64,
    pub released_on_backpressure: u64,
}

/// Lock-free counters shared by the driver and the worker threads.
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub claimed: AtomicU64,
    pub succeeded: AtomicU64,
    pub retried: AtomicU64,
    pub failed_permanently: AtomicU64,
    pub claim_errors: AtomicU64,
    pub finalize_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub released_on_backpressure: AtomicU64,
}

impl EngineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed_permanently: self.failed_permanently.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
            finalize_errors: self.finalize_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            released_on_backpressure: self.released_on_backpressure.load(Ordering::Relaxed),
        }
    }
}
