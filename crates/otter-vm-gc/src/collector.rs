//! Collection bookkeeping

use std::time::Duration;

/// What happened during one collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Objects reached from roots
    pub marked: usize,
    /// Objects freed by the sweep
    pub swept: usize,
    /// Weak slots cleared because their target died
    pub weak_cleared: usize,
    /// Objects whose storage moved during compaction
    pub relocated: usize,
}

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of collections
    pub collections: u64,
    /// Total time spent in GC (nanoseconds)
    pub total_time_ns: u64,
    /// Summary of the last collection
    pub last: CycleSummary,
    /// Allocations since the last collection
    pub allocations_since_gc: usize,
}

impl GcStats {
    /// Count one allocation toward the next trigger
    pub fn note_allocation(&mut self) {
        self.allocations_since_gc += 1;
    }

    /// True once `threshold` allocations happened since the last collection.
    /// A threshold of zero disables automatic collection.
    pub fn should_collect(&self, threshold: usize) -> bool {
        threshold != 0 && self.allocations_since_gc >= threshold
    }

    /// Record a finished collection.
    pub fn record(&mut self, summary: CycleSummary, elapsed: Duration) {
        self.collections += 1;
        self.total_time_ns += elapsed.as_nanos() as u64;
        self.last = summary;
        self.allocations_since_gc = 0;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            collection = self.collections,
            marked = summary.marked,
            swept = summary.swept,
            weak_cleared = summary.weak_cleared,
            relocated = summary.relocated,
            pause_us = elapsed.as_micros() as u64,
            "GC cycle complete"
        );
    }
}
