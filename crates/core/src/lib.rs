//! Continuous-batching inference runtime for autoregressive models.
//!
//! Requests stream in concurrently, get interleaved through shared prefill
//! and decode forward passes, and emit tokens through callbacks until each
//! hits its own stopping condition. The pieces:
//!
//! - [`scheduler::Scheduler`]: admission, batch assembly, lifecycle.
//! - [`kv_cache::KvCache`]: block-allocated K/V arenas with zero-copy
//!   per-layer views.
//! - [`engine::Engine`]: the single-threaded loop coupling both to a
//!   [`backend::ModelBackend`].

pub mod backend;
pub mod engine;
pub mod kv_cache;
pub mod request;
pub mod sampling;
pub mod scheduler;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backend::ModelBackend;
pub use engine::{Engine, EngineHandle, EngineStats};
pub use kv_cache::{CacheConfig, KvCache};
pub use request::{FinishReason, Request, RequestState};
pub use sampling::SamplingParams;
pub use scheduler::{Batch, Scheduler, SchedulerConfig};
