mod block_allocator;
pub mod config;
mod error;
pub mod metrics;

pub use block_allocator::{
    AllocatorKind, BlockAllocator, BlockHandle, BlockId, BuddyAllocator, FirstFitAllocator,
};
pub use config::CacheConfig;
pub use error::CacheError;
pub use metrics::{KvCacheMetrics, MetricsSnapshot};

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

/// Per-sequence cache bookkeeping: the owned block run and the write cursor.
#[derive(Debug, Clone, Copy)]
pub struct SequenceEntry {
    handle: BlockHandle,
    tokens_used: usize,
    max_allowed: usize,
}

impl SequenceEntry {
    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    pub fn tokens_used(&self) -> usize {
        self.tokens_used
    }

    pub fn max_allowed(&self) -> usize {
        self.max_allowed
    }
}

/// Read view over one sequence's K or V data for a single layer.
///
/// Logical shape `[num_heads, tokens_used, head_dim]`. The view aliases the
/// arena; its lifetime is a borrow of the cache, so the entry cannot be
/// freed while the view is live.
pub struct KvView<'a> {
    data: &'a [f32],
    num_heads: usize,
    tokens_used: usize,
    head_dim: usize,
    block_size: usize,
}

impl<'a> KvView<'a> {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.num_heads, self.tokens_used, self.head_dim)
    }

    /// The head-dim vector stored for `(head, pos)`.
    pub fn token(&self, head: usize, pos: usize) -> &'a [f32] {
        let offset = token_offset(head, pos, self.num_heads, self.block_size, self.head_dim);
        &self.data[offset..offset + self.head_dim]
    }

    /// Raw backing slice covering the sequence's whole block run.
    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }
}

/// Write view over one sequence's K or V data for a single layer.
pub struct KvViewMut<'a> {
    data: &'a mut [f32],
    num_heads: usize,
    tokens_used: usize,
    head_dim: usize,
    block_size: usize,
}

impl KvViewMut<'_> {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.num_heads, self.tokens_used, self.head_dim)
    }

    pub fn token_mut(&mut self, head: usize, pos: usize) -> &mut [f32] {
        let offset = token_offset(head, pos, self.num_heads, self.block_size, self.head_dim);
        &mut self.data[offset..offset + self.head_dim]
    }

    /// Copy a head-dim vector into position `(head, pos)`.
    pub fn write_token(&mut self, head: usize, pos: usize, values: &[f32]) {
        self.token_mut(head, pos).copy_from_slice(values);
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.data
    }
}

/// Position of `(head, pos)` within a sequence's block run.
///
/// Consecutive token offsets within a block are adjacent per (layer, head);
/// crossing a block boundary jumps to the next block's segment.
fn token_offset(
    head: usize,
    pos: usize,
    num_heads: usize,
    block_size: usize,
    head_dim: usize,
) -> usize {
    let block = pos / block_size;
    let offset = pos % block_size;
    block * num_heads * block_size * head_dim + head * block_size * head_dim + offset * head_dim
}

/// Occupancy snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub num_sequences: usize,
    pub fullness: f32,
    pub fragmentation: f32,
}

/// The paged KV cache: both arenas, the block allocator, and the
/// `request id -> SequenceEntry` map.
///
/// Owned exclusively by the engine thread. Views borrow the cache, so the
/// borrow checker enforces that no view survives a `free_for`.
pub struct KvCache {
    config: CacheConfig,
    allocator: BlockAllocator,
    entries: HashMap<String, SequenceEntry>,
    k_arena: Vec<f32>,
    v_arena: Vec<f32>,
    metrics: Arc<KvCacheMetrics>,
}

impl KvCache {
    /// Allocate both arenas up front. Arena size is fixed for the process
    /// lifetime; running out of host memory here aborts, which is the only
    /// fatal allocation in the cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_metrics(config, Arc::new(KvCacheMetrics::new()))
    }

    pub fn with_metrics(config: CacheConfig, metrics: Arc<KvCacheMetrics>) -> Self {
        let arena_len = config.arena_len();
        Self {
            allocator: BlockAllocator::new(config.allocator, config.total_blocks),
            entries: HashMap::new(),
            k_arena: vec![0.0; arena_len],
            v_arena: vec![0.0; arena_len],
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Create an entry sized for `initial_tokens` prompt positions.
    ///
    /// A sequence always owns at least one block so that decode has a slot
    /// to write even for an empty prompt.
    pub fn allocate_for(&mut self, id: &str, initial_tokens: usize) -> Result<(), CacheError> {
        if self.entries.contains_key(id) {
            return Err(CacheError::DuplicateSequence { id: id.to_string() });
        }
        let needed = initial_tokens.div_ceil(self.config.block_size).max(1);
        let Some(handle) = self.allocator.allocate(needed) else {
            self.metrics.record_allocation_failure();
            return Err(CacheError::OutOfBlocks {
                requested: needed,
                available: self.allocator.free_blocks(),
            });
        };
        self.metrics.record_allocation(handle.num_blocks());
        self.entries.insert(
            id.to_string(),
            SequenceEntry {
                handle,
                tokens_used: initial_tokens,
                max_allowed: handle.num_blocks() * self.config.block_size,
            },
        );
        Ok(())
    }

    /// Remove a sequence and return its blocks. Unknown ids are a no-op.
    pub fn free_for(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            self.metrics.record_free(entry.handle.num_blocks());
            self.allocator.free(entry.handle);
        }
    }

    /// Advance the write cursor by one token.
    pub fn append_token(&mut self, id: &str) -> Result<(), CacheError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| CacheError::UnknownSequence { id: id.to_string() })?;
        if entry.tokens_used >= entry.max_allowed {
            return Err(CacheError::CapacityExhausted {
                id: id.to_string(),
                max_allowed: entry.max_allowed,
            });
        }
        entry.tokens_used += 1;
        self.metrics.record_append();
        Ok(())
    }

    pub fn has_sequence(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entry(&self, id: &str) -> Option<&SequenceEntry> {
        self.entries.get(id)
    }

    pub fn used_tokens(&self, id: &str) -> Option<usize> {
        self.entries.get(id).map(|e| e.tokens_used)
    }

    pub fn token_offset_in_block(&self, id: &str) -> Option<usize> {
        self.entries
            .get(id)
            .map(|e| e.tokens_used % self.config.block_size)
    }

    pub fn remaining_capacity(&self, id: &str) -> Option<usize> {
        self.entries.get(id).map(|e| e.max_allowed - e.tokens_used)
    }

    pub fn k_view(&self, id: &str, layer: usize) -> Result<KvView<'_>, CacheError> {
        let range = self.layer_range(id, layer)?;
        Ok(self.make_view(&self.k_arena[range], self.entries[id].tokens_used))
    }

    pub fn v_view(&self, id: &str, layer: usize) -> Result<KvView<'_>, CacheError> {
        let range = self.layer_range(id, layer)?;
        Ok(self.make_view(&self.v_arena[range], self.entries[id].tokens_used))
    }

    /// Mutable K and V views for the same (sequence, layer), for the
    /// backend's writes during prefill and decode.
    pub fn views_mut(
        &mut self,
        id: &str,
        layer: usize,
    ) -> Result<(KvViewMut<'_>, KvViewMut<'_>), CacheError> {
        let range = self.layer_range(id, layer)?;
        let tokens_used = self.entries[id].tokens_used;
        let config = &self.config;
        let k = KvViewMut {
            data: &mut self.k_arena[range.clone()],
            num_heads: config.num_heads,
            tokens_used,
            head_dim: config.head_dim,
            block_size: config.block_size,
        };
        let v = KvViewMut {
            data: &mut self.v_arena[range],
            num_heads: config.num_heads,
            tokens_used,
            head_dim: config.head_dim,
            block_size: config.block_size,
        };
        Ok((k, v))
    }

    pub fn num_sequences(&self) -> usize {
        self.entries.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.allocator.free_blocks()
    }

    pub fn used_blocks(&self) -> usize {
        self.allocator.used_blocks()
    }

    pub fn total_blocks(&self) -> usize {
        self.allocator.total_blocks()
    }

    pub fn is_full(&self) -> bool {
        self.allocator.free_blocks() == 0
    }

    pub fn fullness(&self) -> f32 {
        let total = self.allocator.total_blocks();
        if total == 0 {
            return 0.0;
        }
        self.allocator.used_blocks() as f32 / total as f32
    }

    pub fn fragmentation(&self) -> f32 {
        self.allocator.fragmentation()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_blocks: self.total_blocks(),
            free_blocks: self.free_blocks(),
            used_blocks: self.used_blocks(),
            num_sequences: self.num_sequences(),
            fullness: self.fullness(),
            fragmentation: self.fragmentation(),
        }
    }

    pub fn metrics(&self) -> &Arc<KvCacheMetrics> {
        &self.metrics
    }

    /// Check the structural invariants: cursor within capacity, handle
    /// ranges in bounds and pairwise disjoint, free count conservation.
    pub fn validate(&self) -> Result<(), CacheError> {
        let total = self.config.total_blocks;
        let mut claimed = vec![false; total];
        let mut held = 0usize;
        for (id, entry) in &self.entries {
            if entry.tokens_used > entry.max_allowed {
                return Err(CacheError::InvariantViolated(format!(
                    "sequence {id} cursor {} past capacity {}",
                    entry.tokens_used, entry.max_allowed
                )));
            }
            if entry.handle.range().end > total {
                return Err(CacheError::InvariantViolated(format!(
                    "sequence {id} handle {:?} out of bounds",
                    entry.handle.range()
                )));
            }
            for b in entry.handle.range() {
                if claimed[b] {
                    return Err(CacheError::InvariantViolated(format!(
                        "block {b} owned by two sequences"
                    )));
                }
                claimed[b] = true;
            }
            held += entry.handle.num_blocks();
        }
        if self.allocator.free_blocks() + held != total {
            return Err(CacheError::InvariantViolated(format!(
                "free {} + held {held} != total {total}",
                self.allocator.free_blocks()
            )));
        }
        Ok(())
    }

    fn layer_range(&self, id: &str, layer: usize) -> Result<std::ops::Range<usize>, CacheError> {
        let config = &self.config;
        if layer >= config.num_layers {
            return Err(CacheError::LayerOutOfRange {
                layer,
                num_layers: config.num_layers,
            });
        }
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| CacheError::UnknownSequence { id: id.to_string() })?;
        let block_stride = config.num_heads * config.block_size * config.head_dim;
        let layer_base = layer * config.total_blocks * block_stride;
        let start = layer_base + entry.handle.start() * block_stride;
        let end = start + entry.handle.num_blocks() * block_stride;
        if end > self.k_arena.len() {
            warn!(id, layer, "kv view range exceeds arena");
            return Err(CacheError::InvariantViolated(format!(
                "view range {start}..{end} exceeds arena {}",
                self.k_arena.len()
            )));
        }
        Ok(start..end)
    }

    fn make_view<'a>(&self, data: &'a [f32], tokens_used: usize) -> KvView<'a> {
        KvView {
            data,
            num_heads: self.config.num_heads,
            tokens_used,
            head_dim: self.config.head_dim,
            block_size: self.config.block_size,
        }
    }
}
