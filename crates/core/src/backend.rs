//! The model backend boundary.
//!
//! The engine treats the numeric forward pass and the sampler kernels as
//! external collaborators behind this trait. Implementations own the model
//! weights and compute; the engine owns scheduling and KV bookkeeping.

use std::path::Path;

use candle_core::Tensor;

use crate::kv_cache::KvCache;
use crate::sampling::{self, SamplerState, SamplingError, SamplingParams};
use crate::scheduler::Batch;

/// A loaded autoregressive model plus its sampler.
///
/// # KV coordination contract
///
/// The backend reads and writes cache memory exclusively through the views
/// of the sequences in the batch it was handed; every row has a live entry.
///
/// - `prefill`: for each row the flat `tokens` slice carries the prompt at
///   `[offsets[i], offsets[i + 1])` (see [`Batch::offsets`]); the backend
///   writes K/V for positions `[0, prompt_len)` across all layers and
///   returns the last position's logits per row.
/// - `decode`: `last_tokens[i]` advances row `i` by one position. The
///   backend reads all prior positions and writes the new position at the
///   row's current cursor (`KvCache::used_tokens`, i.e. offset
///   `token_offset_in_block` of its current block). The engine advances
///   the cursor after the call returns.
pub trait ModelBackend: Send {
    fn is_loaded(&self) -> bool;

    /// Load weights from disk. Idempotent: loading an already-loaded model
    /// is a no-op.
    fn load_model(&mut self, path: &Path) -> candle_core::Result<()>;

    /// Optional dummy forward pass to pay one-time compilation and
    /// first-touch costs before serving.
    fn warmup(&mut self, cache: &mut KvCache) -> candle_core::Result<()> {
        let _ = cache;
        Ok(())
    }

    /// One forward pass over all prompt tokens of the batch. Returns
    /// last-position logits shaped `[batch, vocab]`.
    fn prefill(
        &mut self,
        batch: &Batch,
        tokens: &[u32],
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor>;

    /// One forward pass advancing every row by a single token. Returns
    /// logits shaped `[batch, vocab]`.
    fn decode(
        &mut self,
        batch: &Batch,
        last_tokens: &[u32],
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor>;

    /// Select a token id in `[0, vocab)` from one logits row. The default
    /// delegates to the library sampler; GPU backends may override with a
    /// fused kernel.
    fn sample_token(
        &mut self,
        logits: &[f32],
        params: &SamplingParams,
        history: &[u32],
        state: &mut SamplerState,
    ) -> Result<u32, SamplingError> {
        sampling::sample(logits, params, history, state)
    }

    fn hidden_size(&self) -> usize;
    fn num_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Minimal backend proving the default `sample_token` wiring.
    struct NullBackend;

    impl ModelBackend for NullBackend {
        fn is_loaded(&self) -> bool {
            true
        }

        fn load_model(&mut self, _path: &Path) -> candle_core::Result<()> {
            Ok(())
        }

        fn prefill(
            &mut self,
            batch: &Batch,
            _tokens: &[u32],
            _cache: &mut KvCache,
        ) -> candle_core::Result<Tensor> {
            Tensor::zeros((batch.len(), 4), candle_core::DType::F32, &Device::Cpu)
        }

        fn decode(
            &mut self,
            batch: &Batch,
            _last_tokens: &[u32],
            _cache: &mut KvCache,
        ) -> candle_core::Result<Tensor> {
            Tensor::zeros((batch.len(), 4), candle_core::DType::F32, &Device::Cpu)
        }

        fn hidden_size(&self) -> usize {
            8
        }

        fn num_layers(&self) -> usize {
            1
        }

        fn vocab_size(&self) -> usize {
            4
        }
    }

    #[test]
    fn default_sample_token_uses_library_sampler() {
        let mut backend = NullBackend;
        let mut state = SamplerState::new(Some(0));
        let token = backend
            .sample_token(
                &[0.0, 5.0, 1.0, 2.0],
                &SamplingParams::greedy(),
                &[],
                &mut state,
            )
            .unwrap();
        assert_eq!(token, 1);
    }
}
