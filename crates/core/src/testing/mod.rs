//! Deterministic mock backend for engine tests.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::backend::ModelBackend;
use crate::kv_cache::KvCache;
use crate::sampling::{SamplerState, SamplingError, SamplingParams};
use crate::scheduler::Batch;

enum TokenMode {
    /// Every sampling call yields the same token.
    Fixed(u32),
    /// Successive sampling calls walk the sequence, repeating the last
    /// element once exhausted.
    Sequence(Vec<u32>),
}

/// Scriptable backend: fixed or scripted token stream, injectable
/// failures, and real KV writes through the cache views so engine tests
/// exercise the coordination contract.
pub struct MockBackend {
    vocab_size: usize,
    loaded: bool,
    mode: TokenMode,
    sample_calls: usize,
    fail_prefill: bool,
    fail_decode: bool,
    fail_sampling_on: Option<usize>,
    device: Device,
}

impl MockBackend {
    pub fn fixed_token(token: u32, vocab_size: usize) -> Self {
        Self::with_mode(TokenMode::Fixed(token), vocab_size)
    }

    pub fn token_sequence(tokens: Vec<u32>, vocab_size: usize) -> Self {
        assert!(!tokens.is_empty(), "token sequence must be non-empty");
        Self::with_mode(TokenMode::Sequence(tokens), vocab_size)
    }

    fn with_mode(mode: TokenMode, vocab_size: usize) -> Self {
        Self {
            vocab_size,
            loaded: true,
            mode,
            sample_calls: 0,
            fail_prefill: false,
            fail_decode: false,
            fail_sampling_on: None,
            device: Device::Cpu,
        }
    }

    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// Make every `prefill` call fail.
    pub fn fail_prefill(&mut self) {
        self.fail_prefill = true;
    }

    /// Make every `decode` call fail.
    pub fn fail_decode(&mut self) {
        self.fail_decode = true;
    }

    /// Fail the `n`-th sampling call (1-based), once.
    pub fn fail_sampling_on_call(&mut self, n: usize) {
        self.fail_sampling_on = Some(n);
    }

    fn zero_logits(&self, batch_size: usize) -> candle_core::Result<Tensor> {
        Tensor::zeros((batch_size, self.vocab_size), DType::F32, &self.device)
    }

    fn next_token(&mut self) -> u32 {
        let idx = self.sample_calls - 1;
        match &self.mode {
            TokenMode::Fixed(token) => *token,
            TokenMode::Sequence(tokens) => *tokens.get(idx).unwrap_or_else(|| {
                tokens.last().expect("sequence is non-empty")
            }),
        }
    }

    fn write_prompt_kv(
        &self,
        batch: &Batch,
        tokens: &[u32],
        cache: &mut KvCache,
    ) -> candle_core::Result<()> {
        let num_layers = cache.config().num_layers;
        let num_heads = cache.config().num_heads;
        let offsets = batch.offsets();
        for (row, request) in batch.requests.iter().enumerate() {
            let prompt = &tokens[offsets[row]..offsets[row + 1]];
            for layer in 0..num_layers {
                let (mut k, mut v) = cache
                    .views_mut(request.id(), layer)
                    .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
                for (pos, &token) in prompt.iter().enumerate() {
                    for head in 0..num_heads {
                        k.token_mut(head, pos).fill(token as f32);
                        v.token_mut(head, pos).fill(token as f32 + 0.5);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_decode_kv(
        &self,
        batch: &Batch,
        last_tokens: &[u32],
        cache: &mut KvCache,
    ) -> candle_core::Result<()> {
        let num_layers = cache.config().num_layers;
        let num_heads = cache.config().num_heads;
        for (row, request) in batch.requests.iter().enumerate() {
            let pos = cache
                .used_tokens(request.id())
                .ok_or_else(|| candle_core::Error::Msg(format!("no entry for {}", request.id())))?;
            for layer in 0..num_layers {
                let (mut k, mut v) = cache
                    .views_mut(request.id(), layer)
                    .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
                for head in 0..num_heads {
                    k.token_mut(head, pos).fill(last_tokens[row] as f32);
                    v.token_mut(head, pos).fill(last_tokens[row] as f32 + 0.5);
                }
            }
        }
        Ok(())
    }
}

impl ModelBackend for MockBackend {
    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn load_model(&mut self, _path: &Path) -> candle_core::Result<()> {
        self.loaded = true;
        Ok(())
    }

    fn prefill(
        &mut self,
        batch: &Batch,
        tokens: &[u32],
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        if self.fail_prefill {
            return Err(candle_core::Error::Msg("injected prefill failure".to_string()));
        }
        self.write_prompt_kv(batch, tokens, cache)?;
        self.zero_logits(batch.len())
    }

    fn decode(
        &mut self,
        batch: &Batch,
        last_tokens: &[u32],
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        if self.fail_decode {
            return Err(candle_core::Error::Msg("injected decode failure".to_string()));
        }
        self.write_decode_kv(batch, last_tokens, cache)?;
        self.zero_logits(batch.len())
    }

    fn sample_token(
        &mut self,
        _logits: &[f32],
        _params: &SamplingParams,
        _history: &[u32],
        _state: &mut SamplerState,
    ) -> Result<u32, SamplingError> {
        self.sample_calls += 1;
        if self.fail_sampling_on == Some(self.sample_calls) {
            return Err(SamplingError::InvalidParams("injected sampling failure".into()));
        }
        Ok(self.next_token())
    }

    fn hidden_size(&self) -> usize {
        64
    }

    fn num_layers(&self) -> usize {
        1
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(backend: &mut MockBackend) -> Result<u32, SamplingError> {
        let mut state = SamplerState::new(Some(0));
        backend.sample_token(&[0.0; 4], &SamplingParams::greedy(), &[], &mut state)
    }

    #[test]
    fn fixed_mode_repeats_token() {
        let mut backend = MockBackend::fixed_token(7, 16);
        assert_eq!(sample(&mut backend).unwrap(), 7);
        assert_eq!(sample(&mut backend).unwrap(), 7);
    }

    #[test]
    fn sequence_mode_walks_then_repeats_last() {
        let mut backend = MockBackend::token_sequence(vec![1, 2, 3], 16);
        let drawn: Vec<u32> = (0..5).map(|_| sample(&mut backend).unwrap()).collect();
        assert_eq!(drawn, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn injected_sampling_failure_fires_once() {
        let mut backend = MockBackend::fixed_token(7, 16);
        backend.fail_sampling_on_call(2);
        assert!(sample(&mut backend).is_ok());
        assert!(sample(&mut backend).is_err());
        assert!(sample(&mut backend).is_ok());
    }
}
