use super::block_allocator::AllocatorKind;

/// Size of one arena element. The arenas store f32.
const ELEM_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Token positions per block.
    pub block_size: usize,
    /// Total blocks in the arena, shared by all sequences.
    pub total_blocks: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub allocator: AllocatorKind,
}

impl CacheConfig {
    /// Compute `total_blocks` from an available memory budget.
    ///
    /// bytes_per_block = 2 (K+V) * num_layers * num_heads * block_size *
    /// head_dim * elem_size
    pub fn from_memory_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_heads: usize,
        head_dim: usize,
        block_size: usize,
    ) -> Self {
        let per_block = 2 * num_layers * num_heads * block_size * head_dim * ELEM_SIZE;
        let total_blocks = if per_block > 0 {
            budget_bytes / per_block
        } else {
            0
        };
        Self {
            block_size,
            total_blocks,
            num_layers,
            num_heads,
            head_dim,
            allocator: AllocatorKind::default(),
        }
    }

    /// Elements in one arena (K or V).
    pub fn arena_len(&self) -> usize {
        self.num_layers * self.total_blocks * self.num_heads * self.block_size * self.head_dim
    }

    pub fn bytes_per_block(&self) -> usize {
        2 * self.num_layers * self.num_heads * self.block_size * self.head_dim * ELEM_SIZE
    }

    pub fn total_memory_bytes(&self) -> usize {
        self.bytes_per_block() * self.total_blocks
    }

    /// Token capacity of the whole arena.
    pub fn total_token_slots(&self) -> usize {
        self.total_blocks * self.block_size
    }
}
