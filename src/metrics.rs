//! Engine counters for observability.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub batches_committed: AtomicU64,
    pub records_written: AtomicU64,
    pub wal_bytes: AtomicU64,
    pub stalls: AtomicU64,
    pub flushes: AtomicU64,
    pub memtable_rotations: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            wal_bytes: self.wal_bytes.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            memtable_rotations: self.memtable_rotations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches_committed: u64,
    pub records_written: u64,
    pub wal_bytes: u64,
    pub stalls: u64,
    pub flushes: u64,
    pub memtable_rotations: u64,
}
