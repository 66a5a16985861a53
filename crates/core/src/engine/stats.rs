//! Engine counters, updated only from the engine loop.

use std::time::Duration;

use serde::Serialize;

/// Point-in-time view of the engine's lifetime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Tokens sampled and emitted across all requests.
    pub tokens_processed: u64,
    /// Requests that reached Finished.
    pub requests_completed: u64,
    /// Requests that reached Failed.
    pub requests_failed: u64,
    /// Running average rows per non-empty batch (prefill and decode).
    pub avg_batch_size: f32,
    /// Sum of submit-to-terminal durations over retired requests.
    pub total_latency_ms: u64,
}

/// Accumulator behind the engine's stats mutex.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub tokens_processed: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub num_batches: u64,
    pub batch_rows: u64,
    pub total_latency: Duration,
}

impl StatsInner {
    pub fn record_batch(&mut self, rows: usize) {
        self.num_batches += 1;
        self.batch_rows += rows as u64;
    }

    pub fn snapshot(&self) -> EngineStats {
        let avg_batch_size = if self.num_batches == 0 {
            0.0
        } else {
            self.batch_rows as f32 / self.num_batches as f32
        };
        EngineStats {
            tokens_processed: self.tokens_processed,
            requests_completed: self.requests_completed,
            requests_failed: self.requests_failed,
            avg_batch_size,
            total_latency_ms: self.total_latency.as_millis() as u64,
        }
    }
}
