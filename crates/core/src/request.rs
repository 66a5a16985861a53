use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::sampling::{SamplerState, SamplingParams};

/// Invoked with `(token, finished)`: once per emitted token with
/// `finished = false`, then exactly once with `finished = true` on the
/// terminal transition.
pub type TokenCallback = Arc<dyn Fn(u32, bool) + Send + Sync>;

/// Lifecycle of a request. Only moves forward:
/// Pending -> Prefilling -> Decoding -> (Finished | Failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Prefilling,
    Decoding,
    Finished,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Prefilling | Self::Decoding)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Prefilling => 1,
            Self::Decoding => 2,
            Self::Finished | Self::Failed => 3,
        }
    }
}

/// Why a request reached Finished. Failures carry an error message instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was generated.
    Stop,
    /// The max-tokens budget was reached.
    Length,
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid sampling parameters: {0}")]
    InvalidSamplingParams(String),

    #[error("request {id} is {state:?}; sampling parameters can only change while Pending")]
    NotPending { id: String, state: RequestState },
}

struct RequestInner {
    state: RequestState,
    generated: Vec<u32>,
    error: Option<String>,
    finish_reason: Option<FinishReason>,
    sampling: SamplingParams,
    stop_tokens: Vec<u32>,
    stop_string: Option<String>,
    streaming: bool,
    callback: Option<TokenCallback>,
    sampler: SamplerState,
}

/// One inference request: immutable client input plus mutable execution
/// state.
///
/// Shared as `Arc<Request>` between the client, the scheduler, and
/// transient batches. Execution state is written only by the engine
/// thread; clients observe through accessors and may set the cancel flag
/// from any thread.
pub struct Request {
    id: String,
    prompt_tokens: Vec<u32>,
    max_tokens: usize,
    arrival: Instant,
    cancelled: AtomicBool,
    inner: Mutex<RequestInner>,
}

impl Request {
    /// `max_tokens` is clamped to at least 1.
    pub fn new(id: impl Into<String>, prompt_tokens: Vec<u32>, max_tokens: usize) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            prompt_tokens,
            max_tokens: max_tokens.max(1),
            arrival: Instant::now(),
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(RequestInner {
                state: RequestState::Pending,
                generated: Vec::new(),
                error: None,
                finish_reason: None,
                sampling: SamplingParams::default(),
                stop_tokens: Vec::new(),
                stop_string: None,
                streaming: true,
                callback: None,
                sampler: SamplerState::new(None),
            }),
        })
    }

    // ─── Immutable input ──────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_tokens.len()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival
    }

    // ─── Configuration ────────────────────────────────────────────────────

    /// Replace the sampling parameters. Valid only while Pending; on
    /// rejection the previous parameters stay in effect.
    pub fn set_sampling_params(&self, params: SamplingParams) -> Result<(), RequestError> {
        params
            .validate()
            .map_err(|e| RequestError::InvalidSamplingParams(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RequestState::Pending {
            return Err(RequestError::NotPending {
                id: self.id.clone(),
                state: inner.state,
            });
        }
        inner.sampler = SamplerState::new(params.seed);
        inner.sampling = params;
        Ok(())
    }

    pub fn sampling_params(&self) -> SamplingParams {
        self.inner.lock().unwrap().sampling.clone()
    }

    pub fn set_stop_tokens(&self, tokens: Vec<u32>) {
        self.inner.lock().unwrap().stop_tokens = tokens;
    }

    pub fn stop_tokens(&self) -> Vec<u32> {
        self.inner.lock().unwrap().stop_tokens.clone()
    }

    pub fn set_stop_string(&self, stop: impl Into<String>) {
        self.inner.lock().unwrap().stop_string = Some(stop.into());
    }

    pub fn stop_string(&self) -> Option<String> {
        self.inner.lock().unwrap().stop_string.clone()
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.inner.lock().unwrap().streaming = streaming;
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().unwrap().streaming
    }

    pub fn set_token_callback(&self, callback: impl Fn(u32, bool) + Send + Sync + 'static) {
        self.inner.lock().unwrap().callback = Some(Arc::new(callback));
    }

    // ─── Cancellation ─────────────────────────────────────────────────────

    /// Request termination. Safe from any thread; the engine observes the
    /// flag at the next decode step and performs the transition.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    // ─── Observation ──────────────────────────────────────────────────────

    pub fn state(&self) -> RequestState {
        self.inner.lock().unwrap().state
    }

    pub fn generated_tokens(&self) -> Vec<u32> {
        self.inner.lock().unwrap().generated.clone()
    }

    pub fn generated_len(&self) -> usize {
        self.inner.lock().unwrap().generated.len()
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.inner.lock().unwrap().finish_reason
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RequestState::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RequestState::Failed
    }

    // ─── Engine-facing state (crate-internal) ─────────────────────────────

    /// Advance the lifecycle. Backward transitions and writes to terminal
    /// requests are ignored.
    pub(crate) fn set_state(&self, next: RequestState) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() || next.rank() < inner.state.rank() {
            return;
        }
        inner.state = next;
    }

    /// Append a generated token and notify the callback with
    /// `finished = false`. Silently drops tokens past `max_tokens` and
    /// tokens for terminal requests.
    pub(crate) fn add_generated_token(&self, token: u32) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() || inner.generated.len() >= self.max_tokens {
                return;
            }
            inner.generated.push(token);
            inner.callback.clone()
        };
        if let Some(cb) = callback {
            cb(token, false);
        }
    }

    /// Terminal transition to Finished. Fires the callback once with
    /// `finished = true`; repeat calls are no-ops.
    pub(crate) fn finish(&self, reason: FinishReason) {
        self.complete(RequestState::Finished, Some(reason), None);
    }

    /// Terminal transition to Failed with an error message.
    pub(crate) fn fail(&self, message: impl Into<String>) {
        self.complete(RequestState::Failed, None, Some(message.into()));
    }

    fn complete(&self, state: RequestState, reason: Option<FinishReason>, error: Option<String>) {
        let notify = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                None
            } else {
                inner.state = state;
                inner.finish_reason = reason;
                inner.error = error;
                let last = inner.generated.last().copied().unwrap_or(0);
                inner.callback.clone().map(|cb| (cb, last))
            }
        };
        if let Some((cb, last)) = notify {
            cb(last, true);
        }
    }

    /// Run `f` with the sampling configuration, the generation history,
    /// and the request's RNG. Engine-only; used to drive the sampler.
    pub(crate) fn with_sampler<R>(
        &self,
        f: impl FnOnce(&SamplingParams, &[u32], &mut SamplerState) -> R,
    ) -> R {
        let inner = &mut *self.inner.lock().unwrap();
        f(&inner.sampling, &inner.generated, &mut inner.sampler)
    }
}
