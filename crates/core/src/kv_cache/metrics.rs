//! Lifetime counters for KV cache operations.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for monitoring cache behavior over the process
/// lifetime. Occupancy-style numbers (free blocks, fullness) live on the
/// cache itself; these only ever increase.
#[derive(Default)]
pub struct KvCacheMetrics {
    /// Successful allocation requests.
    allocations: AtomicU64,
    /// Allocation requests refused for lack of space.
    allocation_failures: AtomicU64,
    /// Total blocks handed out.
    blocks_allocated: AtomicU64,
    /// Total blocks returned.
    blocks_freed: AtomicU64,
    /// Decode cursor advances across all sequences.
    tokens_appended: AtomicU64,
}

impl KvCacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&self, num_blocks: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, num_blocks: usize) {
        self.blocks_freed
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_append(&self) {
        self.tokens_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures.load(Ordering::Relaxed)
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_freed(&self) -> u64 {
        self.blocks_freed.load(Ordering::Relaxed)
    }

    pub fn tokens_appended(&self) -> u64 {
        self.tokens_appended.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: self.allocations(),
            allocation_failures: self.allocation_failures(),
            blocks_allocated: self.blocks_allocated(),
            blocks_freed: self.blocks_freed(),
            tokens_appended: self.tokens_appended(),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub allocation_failures: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub tokens_appended: u64,
}
