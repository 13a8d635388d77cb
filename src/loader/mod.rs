//! Bounded-concurrency fetch-and-decode pipeline.
//!
//! # Architecture
//!
//! ```text
//!  submit(id, priority) ──► JobQueue (dedup by TileId, priority heap)
//!                                │ pop
//!                                ▼
//!                     worker 1..N (tokio tasks)
//!                      │ disk cache ─► source fetcher (timeout) ─► decode (blocking pool)
//!                      ▼
//!                  TileCache::put ──► LoaderEvent ──► controller
//!                      │ on retryable failure
//!                      ▼
//!                  backoff sleep ──► requeue
//! ```
//!
//! # Components
//!
//! - [`TileLoader`]: the worker pool handle
//! - [`JobQueue`]: deduplicating priority queue, one job per tile
//! - [`Priority`]: higher is served first, ties are FIFO
//! - [`RetryPolicy`]: exponential backoff, `max_retries + 1` attempts in total
//! - [`LoaderEvent`]: completion notice delivered over a channel

mod policy;
mod pool;
mod queue;

pub use policy::{
    Priority, RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF_MS,
    DEFAULT_MAX_BACKOFF_SECS, DEFAULT_MAX_RETRIES,
};
pub use pool::{
    LoadOutcome, LoaderConfig, LoaderEvent, TileLoader, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_WORKERS,
};
pub use queue::{FetchJob, JobQueue, SubmitOutcome};
