//! Per-stream counters.
//!
//! Fire-and-forget atomics updated on the hot path; read through
//! [`StreamStats::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StreamStats {
    pub(crate) packets: AtomicU64,
    pub(crate) rejected_packets: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) complete_heaps: AtomicU64,
    pub(crate) incomplete_heaps: AtomicU64,
    pub(crate) dropped_heaps: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            rejected_packets: self.rejected_packets.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            complete_heaps: self.complete_heaps.load(Ordering::Relaxed),
            incomplete_heaps: self.incomplete_heaps.load(Ordering::Relaxed),
            dropped_heaps: self.dropped_heaps.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of a stream's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Packets accepted by `add_packet`.
    pub packets: u64,
    /// Packets rejected (duplicate, malformed against existing state).
    pub rejected_packets: u64,
    /// Receive batches processed by readers.
    pub batches: u64,
    /// Complete heaps handed to the sink.
    pub complete_heaps: u64,
    /// Incomplete heaps handed to the sink (evicted or flushed early).
    pub incomplete_heaps: u64,
    /// Heaps dropped before reaching a consumer (non-contiguous, or pushed
    /// into a stopped ring).
    pub dropped_heaps: u64,
}
