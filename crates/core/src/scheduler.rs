use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::request::{FinishReason, Request, RequestState};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("pending queue is full (limit {limit})")]
    QueueFull { limit: usize },

    #[error("request id {id} is already tracked")]
    DuplicateId { id: String },
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Upper bound on the active set and on any batch. At least 1.
    pub max_batch_size: usize,
    /// Pending-queue cap for backpressure. 0 = unbounded.
    pub max_pending: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_pending: 0,
        }
    }
}

/// One tick's worth of same-stage work. Holds owned handles so the
/// scheduler mutex is released while the engine runs the batch.
pub struct Batch {
    pub requests: Vec<Arc<Request>>,
    pub sequence_lengths: Vec<usize>,
    pub is_prefill: bool,
}

impl Batch {
    fn new(is_prefill: bool) -> Self {
        Self {
            requests: Vec::new(),
            sequence_lengths: Vec::new(),
            is_prefill,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Prefix-sum offsets into the flat token slice handed to the backend:
    /// row `i` owns `[offsets[i], offsets[i + 1])`.
    pub fn offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.sequence_lengths.len() + 1);
        let mut acc = 0;
        offsets.push(0);
        for &len in &self.sequence_lengths {
            acc += len;
            offsets.push(acc);
        }
        offsets
    }
}

struct SchedulerInner {
    pending: VecDeque<Arc<Request>>,
    active: Vec<Arc<Request>>,
    /// Terminal requests retained for retrieval until `clear_finished`.
    finished: Vec<Arc<Request>>,
    known_ids: HashSet<String>,
}

/// Admission control, active-set management, and batch construction.
///
/// All fields sit behind one mutex; every public operation is
/// mutex-serialized and non-blocking. Clients submit from any thread, the
/// engine drives the rest.
pub struct Scheduler {
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config: SchedulerConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            inner: Mutex::new(SchedulerInner {
                pending: VecDeque::new(),
                active: Vec::new(),
                finished: Vec::new(),
                known_ids: HashSet::new(),
            }),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// Enqueue a request for admission. FIFO; fails past the configured
    /// pending cap or on a duplicate id.
    pub fn submit(&self, request: Arc<Request>) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        if self.config.max_pending > 0 && inner.pending.len() >= self.config.max_pending {
            return Err(SchedulerError::QueueFull {
                limit: self.config.max_pending,
            });
        }
        if !inner.known_ids.insert(request.id().to_string()) {
            return Err(SchedulerError::DuplicateId {
                id: request.id().to_string(),
            });
        }
        inner.pending.push_back(request);
        Ok(())
    }

    /// Move pending requests into the active set while capacity allows,
    /// promoting them to Prefilling.
    pub fn accept_new_requests(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.active.len() < self.config.max_batch_size {
            let Some(request) = inner.pending.pop_front() else {
                break;
            };
            request.set_state(RequestState::Prefilling);
            debug!(id = request.id(), "request admitted");
            inner.active.push(request);
        }
    }

    /// Prefilling requests, shortest prompt first (stable arrival
    /// tie-break), capped at the batch limit.
    pub fn build_prefill_batch(&self) -> Batch {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<Arc<Request>> = inner
            .active
            .iter()
            .filter(|r| r.state() == RequestState::Prefilling)
            .cloned()
            .collect();
        candidates.sort_by_key(|r| (r.prompt_len(), r.arrival_time()));
        candidates.truncate(self.config.max_batch_size);

        let mut batch = Batch::new(true);
        for request in candidates {
            batch.sequence_lengths.push(request.prompt_len());
            batch.requests.push(request);
        }
        batch
    }

    /// Decoding requests, fewest generated tokens first (stable arrival
    /// tie-break), capped at the batch limit. Lengths are the full
    /// attended sequence length per row.
    pub fn build_decode_batch(&self) -> Batch {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<Arc<Request>> = inner
            .active
            .iter()
            .filter(|r| r.state() == RequestState::Decoding)
            .cloned()
            .collect();
        candidates.sort_by_key(|r| (r.generated_len(), r.arrival_time()));
        candidates.truncate(self.config.max_batch_size);

        let mut batch = Batch::new(false);
        for request in candidates {
            batch
                .sequence_lengths
                .push(request.prompt_len() + request.generated_len());
            batch.requests.push(request);
        }
        batch
    }

    /// Prefilling -> Decoding. Unknown ids and other states are no-ops.
    pub fn mark_request_ready(&self, id: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(request) = inner.active.iter().find(|r| r.id() == id) {
            if request.state() == RequestState::Prefilling {
                request.set_state(RequestState::Decoding);
            }
        }
    }

    /// Decoding -> Finished; the request moves to the finished set.
    pub fn mark_request_finished(&self, id: &str, reason: FinishReason) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.active.iter().position(|r| r.id() == id) {
            let request = inner.active.remove(pos);
            request.finish(reason);
            inner.finished.push(request);
        }
    }

    /// Prefilling | Decoding -> Failed; removed from the active set but
    /// retained for retrieval.
    pub fn mark_request_failed(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.active.iter().position(|r| r.id() == id) {
            let request = inner.active.remove(pos);
            request.fail(message);
            inner.finished.push(request);
        }
    }

    pub fn has_work(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.pending.is_empty() || !inner.active.is_empty()
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn num_active_requests(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    /// Look up a request among pending, active, and retained terminal
    /// requests.
    pub fn get_request(&self, id: &str) -> Option<Arc<Request>> {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .iter()
            .chain(inner.active.iter())
            .chain(inner.finished.iter())
            .find(|r| r.id() == id)
            .cloned()
    }

    /// Snapshot of the active set, in admission order.
    pub fn active_requests(&self) -> Vec<Arc<Request>> {
        self.inner.lock().unwrap().active.clone()
    }

    /// Drop retained terminal requests and forget their ids.
    pub fn clear_finished(&self) {
        let mut inner = self.inner.lock().unwrap();
        let finished = std::mem::take(&mut inner.finished);
        for request in &finished {
            inner.known_ids.remove(request.id());
        }
    }
}
