//! Monotonic counters and on-demand gauges (§3 Data Model). Owned directly
//! by `Proxy`, not process-global — the lineage's own design note (§9)
//! reserves process-wide state for the logger alone, and this crate has no
//! logger-level global either now that logging goes through `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    accepted_packets: AtomicU64,
    rejected_packets: AtomicU64,
}

impl Counters {
    pub fn record_accepted(&self) {
        self.accepted_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted_packets(&self) -> u64 {
        self.accepted_packets.load(Ordering::Relaxed)
    }

    pub fn rejected_packets(&self) -> u64 {
        self.rejected_packets.load(Ordering::Relaxed)
    }
}
