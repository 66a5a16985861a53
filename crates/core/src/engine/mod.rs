//! The engine loop: couples the scheduler to the KV cache and drives
//! `prefill -> allocate -> promote -> decode -> sample -> emit -> retire`.
//!
//! One engine thread runs the loop to completion each tick; clients submit
//! and cancel from other threads and observe results through request
//! callbacks. Control (pause/resume/shutdown, stats) goes through a
//! cloneable [`EngineHandle`].

mod stats;

pub use stats::EngineStats;
pub(crate) use stats::StatsInner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use candle_core::{DType, Tensor};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::ModelBackend;
use crate::kv_cache::{CacheError, KvCache};
use crate::request::{FinishReason, Request};
use crate::scheduler::{Batch, Scheduler};

/// Sleep between ticks when the scheduler has nothing to run.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("backend is not loaded")]
    BackendNotLoaded,

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Default)]
struct ControlFlags {
    running: AtomicBool,
    paused: AtomicBool,
    shutdown: AtomicBool,
}

/// Cloneable control surface for a running engine. Safe from any thread.
#[derive(Clone)]
pub struct EngineHandle {
    control: Arc<ControlFlags>,
    stats: Arc<Mutex<StatsInner>>,
    scheduler: Arc<Scheduler>,
}

impl EngineHandle {
    /// Stop scheduling without exiting the loop; requests stay queued.
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Relaxed)
    }

    /// Ask the loop to exit after the current tick.
    pub fn shutdown(&self) {
        self.control.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.control.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().unwrap().snapshot()
    }

    pub fn num_active_requests(&self) -> usize {
        self.scheduler.num_active_requests()
    }
}

/// The inference engine. Owns the backend and the KV cache; shares the
/// scheduler with clients.
pub struct Engine<B: ModelBackend> {
    backend: B,
    scheduler: Arc<Scheduler>,
    cache: KvCache,
    control: Arc<ControlFlags>,
    stats: Arc<Mutex<StatsInner>>,
}

impl<B: ModelBackend> Engine<B> {
    pub fn new(backend: B, scheduler: Arc<Scheduler>, cache: KvCache) -> Self {
        Self {
            backend,
            scheduler,
            cache,
            control: Arc::new(ControlFlags::default()),
            stats: Arc::new(Mutex::new(StatsInner::default())),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            control: Arc::clone(&self.control),
            stats: Arc::clone(&self.stats),
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().unwrap().snapshot()
    }

    /// Verify the backend and warm it up. Optional; `run` does not require
    /// it.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if !self.backend.is_loaded() {
            return Err(EngineError::BackendNotLoaded);
        }
        self.backend
            .warmup(&mut self.cache)
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        info!(
            total_blocks = self.cache.total_blocks(),
            block_size = self.cache.block_size(),
            "engine initialized"
        );
        Ok(())
    }

    /// Run the loop until the scheduler drains or shutdown is requested.
    /// While paused the loop idles without scheduling and does not exit.
    pub fn run(&mut self) {
        self.control.running.store(true, Ordering::Relaxed);
        info!("engine loop started");

        loop {
            if self.control.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if self.control.paused.load(Ordering::Relaxed) {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }

            self.tick();

            if !self.scheduler.has_work() {
                // One idle beat so racing submits are not dropped at exit.
                std::thread::sleep(IDLE_SLEEP);
                if !self.scheduler.has_work() && !self.control.paused.load(Ordering::Relaxed) {
                    break;
                }
            }
        }

        self.control.running.store(false, Ordering::Relaxed);
        let snapshot = self.stats();
        info!(
            tokens = snapshot.tokens_processed,
            completed = snapshot.requests_completed,
            failed = snapshot.requests_failed,
            "engine loop exited"
        );
    }

    /// One scheduling round: admit, prefill, decode, retire, validate.
    fn tick(&mut self) {
        self.scheduler.accept_new_requests();

        // KV entries of requests that reached a terminal state this tick.
        let mut retired: Vec<String> = Vec::new();

        let prefill = self.scheduler.build_prefill_batch();
        if !prefill.is_empty() {
            self.stats.lock().unwrap().record_batch(prefill.len());
            self.process_prefill(&prefill, &mut retired);
        }

        let decode = self.scheduler.build_decode_batch();
        if !decode.is_empty() {
            self.stats.lock().unwrap().record_batch(decode.len());
            self.process_decode(&decode, &mut retired);
        }

        self.cleanup(retired);
        self.validate_memory_state();
    }

    /// Allocate KV for every Prefilling request, run one prompt pass over
    /// the survivors, promote them to Decoding, and sample each row's
    /// first token from the prefill logits.
    ///
    /// Allocation happens before the forward pass so the backend can write
    /// prompt KV through the sequences' views.
    fn process_prefill(&mut self, batch: &Batch, retired: &mut Vec<String>) {
        let mut live = Batch {
            requests: Vec::with_capacity(batch.len()),
            sequence_lengths: Vec::with_capacity(batch.len()),
            is_prefill: true,
        };
        let total: usize = batch.sequence_lengths.iter().sum();
        let mut tokens: Vec<u32> = Vec::with_capacity(total);

        for request in &batch.requests {
            if request.is_cancelled() {
                // Cancelled before any work: no entry exists yet.
                self.retire_failed(request, "cancelled", false, retired);
                continue;
            }
            match self.cache.allocate_for(request.id(), request.prompt_len()) {
                Ok(()) => {
                    tokens.extend_from_slice(request.prompt_tokens());
                    live.sequence_lengths.push(request.prompt_len());
                    live.requests.push(Arc::clone(request));
                }
                Err(e @ CacheError::OutOfBlocks { .. }) => {
                    self.handle_oom();
                    // No entry was created; nothing to reclaim for this id.
                    self.retire_failed(request, &e.to_string(), false, retired);
                }
                Err(e) => {
                    // DuplicateSequence is a programmer error. The live
                    // entry belongs to another request and must survive.
                    self.retire_failed(request, &e.to_string(), false, retired);
                }
            }
        }
        if live.is_empty() {
            return;
        }

        let logits = match self.backend.prefill(&live, &tokens, &mut self.cache) {
            Ok(logits) => logits,
            Err(e) => {
                self.handle_backend_failure(&live, &e.to_string(), retired);
                return;
            }
        };

        for (row, request) in live.requests.iter().enumerate() {
            self.scheduler.mark_request_ready(request.id());
            match self.sample_row(&logits, row, request) {
                Ok(token) => {
                    self.emit_token(request, token);
                    self.apply_stopping(request, token, retired);
                }
                Err(message) => self.retire_failed(request, &message, true, retired),
            }
        }
    }

    /// Advance every Decoding request in the batch by one token.
    fn process_decode(&mut self, batch: &Batch, retired: &mut Vec<String>) {
        // Pre-pass: observe cancellation early and refuse rows whose KV is
        // already full, so a failed request never carries a token that had
        // no slot.
        let mut live = Batch {
            requests: Vec::with_capacity(batch.len()),
            sequence_lengths: Vec::with_capacity(batch.len()),
            is_prefill: false,
        };
        let mut last_tokens: Vec<u32> = Vec::with_capacity(batch.len());
        for (request, &seq_len) in batch.requests.iter().zip(&batch.sequence_lengths) {
            if request.is_cancelled() {
                self.retire_failed(request, "cancelled", true, retired);
                continue;
            }
            match self.cache.remaining_capacity(request.id()) {
                Some(0) => {
                    let message = CacheError::CapacityExhausted {
                        id: request.id().to_string(),
                        max_allowed: self.cache.entry(request.id()).map_or(0, |e| e.max_allowed()),
                    }
                    .to_string();
                    self.retire_failed(request, &message, true, retired);
                }
                Some(_) => match request.generated_tokens().last() {
                    Some(&last) => {
                        live.requests.push(Arc::clone(request));
                        live.sequence_lengths.push(seq_len);
                        last_tokens.push(last);
                    }
                    None => {
                        self.retire_failed(request, "no generated token to decode from", true, retired)
                    }
                },
                None => self.retire_failed(request, "no kv entry for decode", false, retired),
            }
        }
        if live.is_empty() {
            return;
        }

        let logits = match self.backend.decode(&live, &last_tokens, &mut self.cache) {
            Ok(logits) => logits,
            Err(e) => {
                self.handle_backend_failure(&live, &e.to_string(), retired);
                return;
            }
        };

        for (row, request) in live.requests.iter().enumerate() {
            // The backend just wrote this row's new KV position; advance
            // the cursor to cover it.
            if let Err(e) = self.cache.append_token(request.id()) {
                self.retire_failed(request, &e.to_string(), true, retired);
                continue;
            }
            match self.sample_row(&logits, row, request) {
                Ok(token) => {
                    self.emit_token(request, token);
                    self.apply_stopping(request, token, retired);
                }
                Err(message) => self.retire_failed(request, &message, true, retired),
            }
        }
    }

    /// Stopping conditions in priority order; first match retires the
    /// request. Returns true if the request went terminal.
    fn apply_stopping(&self, request: &Arc<Request>, token: u32, retired: &mut Vec<String>) -> bool {
        if request.is_cancelled() {
            self.retire_failed(request, "cancelled", true, retired);
            return true;
        }
        if request.stop_tokens().contains(&token) {
            self.retire_finished(request, FinishReason::Stop, retired);
            return true;
        }
        if request.generated_len() >= request.max_tokens() {
            self.retire_finished(request, FinishReason::Length, retired);
            return true;
        }
        false
    }

    fn retire_finished(&self, request: &Arc<Request>, reason: FinishReason, retired: &mut Vec<String>) {
        self.scheduler.mark_request_finished(request.id(), reason);
        let mut stats = self.stats.lock().unwrap();
        stats.requests_completed += 1;
        stats.total_latency += request.arrival_time().elapsed();
        retired.push(request.id().to_string());
        debug!(id = request.id(), ?reason, "request finished");
    }

    /// `owns_entry` controls KV reclamation: requests refused by
    /// `allocate_for` never created an entry, and freeing by their id
    /// could hit another sequence's blocks.
    fn retire_failed(
        &self,
        request: &Arc<Request>,
        message: &str,
        owns_entry: bool,
        retired: &mut Vec<String>,
    ) {
        self.scheduler.mark_request_failed(request.id(), message);
        let mut stats = self.stats.lock().unwrap();
        stats.requests_failed += 1;
        stats.total_latency += request.arrival_time().elapsed();
        if owns_entry {
            retired.push(request.id().to_string());
        }
        warn!(id = request.id(), error = message, "request failed");
    }

    /// A failed forward pass abandons the whole batch: every row fails and
    /// the loop continues with other work.
    fn handle_backend_failure(&self, batch: &Batch, message: &str, retired: &mut Vec<String>) {
        error!(
            batch_size = batch.len(),
            is_prefill = batch.is_prefill,
            error = message,
            "backend forward pass failed"
        );
        for request in &batch.requests {
            let owns_entry = self.cache.has_sequence(request.id());
            self.retire_failed(request, &format!("backend error: {message}"), owns_entry, retired);
        }
    }

    fn handle_oom(&self) {
        warn!(
            free_blocks = self.cache.free_blocks(),
            total_blocks = self.cache.total_blocks(),
            fragmentation = self.cache.fragmentation(),
            "kv cache out of blocks"
        );
    }

    /// Extract row `row` of `[batch, vocab]` logits and sample with the
    /// request's parameters, history, and RNG.
    fn sample_row(&mut self, logits: &Tensor, row: usize, request: &Arc<Request>) -> Result<u32, String> {
        let logits_row: Vec<f32> = logits
            .narrow(0, row, 1)
            .and_then(|t| t.squeeze(0))
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| format!("logits extraction failed: {e}"))?;

        let backend = &mut self.backend;
        request.with_sampler(|params, history, sampler| {
            backend
                .sample_token(&logits_row, params, history, sampler)
                .map_err(|e| format!("sampling failed: {e}"))
        })
    }

    fn emit_token(&self, request: &Arc<Request>, token: u32) {
        request.add_generated_token(token);
        self.stats.lock().unwrap().tokens_processed += 1;
    }

    /// Free KV entries of requests retired this tick.
    fn cleanup(&mut self, retired: Vec<String>) {
        for id in retired {
            self.cache.free_for(&id);
        }
    }

    /// Invariant checks at the tick boundary. Violations abort in debug
    /// builds and are logged in release.
    fn validate_memory_state(&self) {
        if let Err(e) = self.cache.validate() {
            debug_assert!(false, "kv invariant violated: {e}");
            error!(error = %e, "kv invariant violated");
        }
        for request in self.scheduler.active_requests() {
            let state = request.state();
            if !state.is_running() {
                debug_assert!(false, "active request {} in state {state:?}", request.id());
                error!(id = request.id(), ?state, "active request in non-running state");
            }
            if !self.cache.has_sequence(request.id()) && state == crate::request::RequestState::Decoding {
                debug_assert!(false, "decoding request {} has no kv entry", request.id());
                error!(id = request.id(), "decoding request has no kv entry");
            }
        }
        if self.cache.is_full() {
            warn!("kv cache is full");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::{AllocatorKind, CacheConfig};
    use crate::scheduler::SchedulerConfig;
    use crate::testing::MockBackend;

    fn small_cache() -> KvCache {
        // Generous block size: decode headroom comes from the slack in a
        // sequence's last block, so tests that exercise generation length
        // need room past the prompt.
        KvCache::new(CacheConfig {
            block_size: 16,
            total_blocks: 16,
            num_layers: 1,
            num_heads: 1,
            head_dim: 4,
            allocator: AllocatorKind::FirstFit,
        })
    }

    fn engine_with(backend: MockBackend, max_batch_size: usize) -> Engine<MockBackend> {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
            max_batch_size,
            max_pending: 0,
        }));
        Engine::new(backend, scheduler, small_cache())
    }

    #[test]
    fn run_completes_single_request() {
        let mut engine = engine_with(MockBackend::fixed_token(42, 100), 4);
        let request = Request::new("r1", vec![7, 8, 9], 4);
        engine.scheduler().submit(Arc::clone(&request)).unwrap();

        engine.run();

        assert!(request.is_finished());
        assert_eq!(request.generated_tokens(), vec![42, 42, 42, 42]);
        assert_eq!(request.finish_reason(), Some(FinishReason::Length));
        let stats = engine.stats();
        assert_eq!(stats.tokens_processed, 4);
        assert_eq!(stats.requests_completed, 1);
        assert_eq!(engine.cache().num_sequences(), 0);
    }

    #[test]
    fn initialize_rejects_unloaded_backend() {
        let mut backend = MockBackend::fixed_token(1, 10);
        backend.set_loaded(false);
        let mut engine = engine_with(backend, 2);
        assert!(matches!(engine.initialize(), Err(EngineError::BackendNotLoaded)));
    }

    #[test]
    fn initialize_warms_up_loaded_backend() {
        let mut engine = engine_with(MockBackend::fixed_token(1, 10), 2);
        engine.initialize().unwrap();
    }

    #[test]
    fn oom_fails_only_the_starved_request() {
        // 2 blocks of 4 tokens: one 5-token prompt takes both.
        let cache = KvCache::new(CacheConfig {
            block_size: 4,
            total_blocks: 2,
            num_layers: 1,
            num_heads: 1,
            head_dim: 4,
            allocator: AllocatorKind::FirstFit,
        });
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        let mut engine = Engine::new(MockBackend::fixed_token(3, 100), scheduler, cache);

        let a = Request::new("a", vec![1, 2, 3, 4, 5], 1);
        let b = Request::new("b", vec![1, 2, 3, 4, 5], 1);
        engine.scheduler().submit(Arc::clone(&a)).unwrap();
        engine.scheduler().submit(Arc::clone(&b)).unwrap();

        engine.run();

        // Same prompt length: FIFO tie-break admits "a" first.
        assert!(a.is_finished());
        assert!(b.is_failed());
        let message = b.error_message().unwrap();
        assert!(message.contains("blocks"), "unexpected error: {message}");
        assert_eq!(engine.stats().requests_failed, 1);
        assert_eq!(engine.cache().free_blocks(), 2);
    }

    #[test]
    fn sampling_failure_fails_single_row() {
        let mut backend = MockBackend::fixed_token(5, 100);
        // Prefill orders shortest-first: call 1 samples "good", call 2
        // samples "bad" and is the one that errors.
        backend.fail_sampling_on_call(2);
        let mut engine = engine_with(backend, 4);

        let good = Request::new("good", vec![1], 2);
        let bad = Request::new("bad", vec![1, 2], 2);
        engine.scheduler().submit(Arc::clone(&good)).unwrap();
        engine.scheduler().submit(Arc::clone(&bad)).unwrap();

        engine.run();

        assert!(good.is_finished());
        assert!(bad.is_failed());
        assert!(bad.error_message().unwrap().contains("sampling failed"));
        assert_eq!(engine.cache().num_sequences(), 0);
    }

    #[test]
    fn backend_failure_abandons_batch() {
        let mut backend = MockBackend::fixed_token(5, 100);
        backend.fail_prefill();
        let mut engine = engine_with(backend, 4);

        let a = Request::new("a", vec![1], 3);
        let b = Request::new("b", vec![2], 3);
        engine.scheduler().submit(Arc::clone(&a)).unwrap();
        engine.scheduler().submit(Arc::clone(&b)).unwrap();

        engine.run();

        assert!(a.is_failed());
        assert!(b.is_failed());
        assert_eq!(engine.stats().requests_failed, 2);
        assert_eq!(engine.cache().num_sequences(), 0);
    }

    #[test]
    fn stop_token_finishes_request() {
        let mut engine = engine_with(MockBackend::token_sequence(vec![10, 11, 42, 12], 100), 2);
        let request = Request::new("r1", vec![1], 50);
        request.set_stop_tokens(vec![42]);
        engine.scheduler().submit(Arc::clone(&request)).unwrap();

        engine.run();

        assert!(request.is_finished());
        assert_eq!(request.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(request.generated_tokens(), vec![10, 11, 42]);
    }

    #[test]
    fn kv_capacity_pre_check_fails_before_sampling() {
        // One block of 4 tokens: 3-token prompt + first token fills it
        // after one decode; the next decode tick has no slot left.
        let cache = KvCache::new(CacheConfig {
            block_size: 4,
            total_blocks: 1,
            num_layers: 1,
            num_heads: 1,
            head_dim: 4,
            allocator: AllocatorKind::FirstFit,
        });
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        let mut engine = Engine::new(MockBackend::fixed_token(3, 100), scheduler, cache);

        let request = Request::new("r1", vec![1, 2, 3], 50);
        engine.scheduler().submit(Arc::clone(&request)).unwrap();
        engine.run();

        assert!(request.is_failed());
        assert!(request.error_message().unwrap().contains("capacity"));
        // Prefill token + 1 decode token; the refused tick added nothing.
        assert_eq!(request.generated_len(), 2);
        assert_eq!(engine.cache().free_blocks(), 1);
    }

    #[test]
    fn paused_engine_idles_until_resumed() {
        let mut engine = engine_with(MockBackend::fixed_token(1, 10), 2);
        let request = Request::new("r1", vec![1], 3);
        engine.scheduler().submit(Arc::clone(&request)).unwrap();

        let handle = engine.handle();
        handle.pause();
        let worker = std::thread::spawn(move || {
            engine.run();
            engine
        });
        while !handle.is_running() {
            std::thread::yield_now();
        }
        // Paused: the loop ticks nothing and does not exit.
        std::thread::sleep(Duration::from_millis(30));
        assert!(handle.is_running());
        assert_eq!(request.state(), crate::request::RequestState::Pending);

        handle.resume();
        let engine = worker.join().unwrap();
        assert!(request.is_finished());
        assert_eq!(engine.stats().requests_completed, 1);
    }

    #[test]
    fn shutdown_exits_with_pending_work() {
        let mut engine = engine_with(MockBackend::fixed_token(1, 10), 2);
        let request = Request::new("r1", vec![1], 100);
        engine.scheduler().submit(Arc::clone(&request)).unwrap();

        let handle = engine.handle();
        handle.pause();
        let worker = std::thread::spawn(move || {
            engine.run();
            engine
        });
        while !handle.is_running() {
            std::thread::yield_now();
        }
        handle.shutdown();
        let engine = worker.join().unwrap();
        assert!(!engine.handle().is_running());
        // Nothing ran: the request was never scheduled.
        assert_eq!(request.state(), crate::request::RequestState::Pending);
    }
}
