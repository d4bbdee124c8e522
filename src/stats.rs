//! Allocation counters.
//!
//! All counters use `Relaxed` ordering. A snapshot taken while other threads are allocating may
//! be transiently inconsistent across counters (e.g. `allocations` ahead of the sum of the hits).
//! They are diagnostics; nothing in the allocator reads them back to make a decision.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    allocations: AtomicU64,
    private_hits: AtomicU64,
    overflow_hits: AtomicU64,
    failed: AtomicU64,
    releases: AtomicU64,
    bindings: AtomicU64,
    overflow_used: AtomicBool,
}

/// Plain copy of the counters at one moment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Every call to `allocate`, including the ones that failed.
    pub allocations: u64,
    pub private_hits: u64,
    pub overflow_hits: u64,
    pub failed: u64,
    pub releases: u64,
    pub bindings: u64,
    pub overflow_first_use: bool,
}

impl StatsSnapshot {
    /// Blocks handed out and not yet released.
    pub fn outstanding(&self) -> u64 {
        (self.private_hits + self.overflow_hits).saturating_sub(self.releases)
    }
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            private_hits: AtomicU64::new(0),
            overflow_hits: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            bindings: AtomicU64::new(0),
            overflow_used: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn private_hit(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.private_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true the first time the overflow arena serves anything.
    #[inline]
    pub fn overflow_hit(&self) -> bool {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.overflow_hits.fetch_add(1, Ordering::Relaxed);
        !self.overflow_used.load(Ordering::Relaxed) && !self.overflow_used.swap(true, Ordering::Relaxed)
    }

    #[inline]
    pub fn failed(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bound(&self) {
        self.bindings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            private_hits: self.private_hits.load(Ordering::Relaxed),
            overflow_hits: self.overflow_hits.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            bindings: self.bindings.load(Ordering::Relaxed),
            overflow_first_use: self.overflow_used.load(Ordering::Relaxed),
        }
    }
}
