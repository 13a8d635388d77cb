use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use super::policy::{Priority, RetryPolicy};
use super::queue::{FetchJob, JobQueue, SubmitOutcome};
use crate::error::{ConfigError, FetchError};
use crate::io::{DiskCache, FetchResponse, TileFetcher};
use crate::projection::TileId;
use crate::source::TileSource;
use crate::tile::{decode_image, Tile, TileCache, TileState};

/// Default number of concurrent fetch workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-attempt fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Configuration and events
// =============================================================================

/// Loader settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Number of worker tasks, the bound on concurrent fetches
    pub workers: usize,
    /// Budget for one attempt, network and body transfer included
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "fetch timeout",
            });
        }
        Ok(())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The tile is now `Loaded` in the cache
    Loaded,
    /// Retries are exhausted or the error is permanent; the tile is `Error`
    Failed { error: FetchError, attempts: u32 },
}

/// Completion notice sent to the controller, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderEvent {
    pub id: TileId,
    pub outcome: LoadOutcome,
}

// =============================================================================
// TileLoader
// =============================================================================

struct ActiveSource {
    source: Arc<dyn TileSource>,
    /// Bumped on every swap, including one that keeps the source id
    generation: u64,
}

struct Shared {
    queue: Mutex<JobQueue>,
    wake: Notify,
    source: RwLock<ActiveSource>,
    fetcher: Arc<dyn TileFetcher>,
    cache: Arc<TileCache>,
    disk: Option<DiskCache>,
    config: LoaderConfig,
    events: mpsc::UnboundedSender<LoaderEvent>,
    shutdown: AtomicBool,
    handle: Handle,
}

impl Shared {
    fn active_source(&self) -> (Arc<dyn TileSource>, u64) {
        let active = self.source.read();
        (Arc::clone(&active.source), active.generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.source.read().generation == generation
    }

    fn cancel_outstanding(&self) -> usize {
        let cancelled = self.queue.lock().cancel_where(|_| true);
        for id in &cancelled {
            self.forget_placeholder(id);
        }
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "cancelled outstanding fetch jobs");
        }
        cancelled.len()
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_outstanding();
        self.wake.notify_waiters();
        debug!("tile loader shutting down");
    }

    /// Drop the image-less `Loading` entry left behind by a cancelled job.
    fn forget_placeholder(&self, id: &TileId) {
        self.cache.remove_if(id, |tile| {
            tile.state == TileState::Loading && tile.image.is_none()
        });
    }
}

/// Shuts the pool down once the last [`TileLoader`] clone is gone.
///
/// Workers hold `Shared` directly, so without this they would park forever
/// and keep the cache and fetcher alive.
struct PoolGuard {
    shared: Arc<Shared>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Bounded worker pool that fetches, decodes and caches tiles.
///
/// Jobs are deduplicated by [`TileId`]: while a job for a tile is pending,
/// running or waiting to retry, further submissions only raise its priority.
/// Workers take the highest-priority pending job, try the disk cache, then the
/// source's fetcher, decode on the blocking pool and publish the result into
/// the shared [`TileCache`]. Every settled job produces one [`LoaderEvent`].
///
/// The loader is a cheap handle; clones share the same pool. Workers run on
/// the runtime passed to [`TileLoader::new`] and stop on
/// [`shutdown`](Self::shutdown) or when the last clone is dropped.
#[derive(Clone)]
pub struct TileLoader {
    guard: Arc<PoolGuard>,
}

impl TileLoader {
    /// Start the worker pool.
    ///
    /// Returns the loader and the receiving end of its completion events.
    pub fn new(
        config: LoaderConfig,
        source: Arc<dyn TileSource>,
        fetcher: Arc<dyn TileFetcher>,
        cache: Arc<TileCache>,
        disk: Option<DiskCache>,
        handle: Handle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LoaderEvent>), ConfigError> {
        config.validate()?;
        source.validate()?;

        let (events, receiver) = mpsc::unbounded_channel();
        let workers = config.workers;
        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue::new()),
            wake: Notify::new(),
            source: RwLock::new(ActiveSource {
                source,
                generation: 0,
            }),
            fetcher,
            cache,
            disk,
            config,
            events,
            shutdown: AtomicBool::new(false),
            handle,
        });

        for worker in 0..workers {
            let shared = Arc::clone(&shared);
            shared.handle.clone().spawn(worker_loop(shared, worker));
        }
        debug!(workers, "tile loader started");

        let guard = Arc::new(PoolGuard { shared });
        Ok((Self { guard }, receiver))
    }

    fn shared(&self) -> &Shared {
        &self.guard.shared
    }

    /// Request a tile. See [`SubmitOutcome`] for the possible results.
    ///
    /// A new job marks the tile `Loading` in the cache immediately.
    pub fn submit(&self, id: TileId, priority: Priority) -> SubmitOutcome {
        self.submit_inner(id, priority, false)
    }

    /// Request a tile, bypassing the disk cache.
    pub fn submit_forced(&self, id: TileId, priority: Priority) -> SubmitOutcome {
        self.submit_inner(id, priority, true)
    }

    fn submit_inner(&self, id: TileId, priority: Priority, forced: bool) -> SubmitOutcome {
        let shared = self.shared();
        if shared.shutdown.load(Ordering::Acquire) {
            return SubmitOutcome::Rejected;
        }
        {
            let active = shared.source.read();
            let source = &active.source;
            if id.source_arc() != source.source_id()
                || id.zoom() < source.min_zoom()
                || id.zoom() > source.max_zoom()
            {
                trace!(tile = %id, "rejected tile outside current source");
                return SubmitOutcome::Rejected;
            }
        }

        let outcome = {
            // Lock order: queue, then cache. The placeholder must be in place
            // before a worker can pop the job and settle it.
            let mut queue = shared.queue.lock();
            let outcome = queue.submit(id.clone(), priority, forced);
            if outcome == SubmitOutcome::Enqueued {
                shared
                    .cache
                    .upsert(&id, || Tile::loading(id.clone()), Tile::mark_loading);
            }
            outcome
        };
        if outcome == SubmitOutcome::Enqueued {
            shared.wake.notify_one();
            trace!(tile = %id, priority = priority.0, forced, "enqueued fetch job");
        }
        outcome
    }

    /// Cancel a job that has not started yet.
    ///
    /// Returns `false` if there was no such job or it is already running.
    pub fn cancel(&self, id: &TileId) -> bool {
        let cancelled = self.shared().queue.lock().cancel(id);
        if cancelled {
            self.shared().forget_placeholder(id);
            trace!(tile = %id, "cancelled pending fetch job");
        }
        cancelled
    }

    /// Cancel every job that has not started. Running fetches complete.
    pub fn cancel_outstanding(&self) -> usize {
        self.shared().cancel_outstanding()
    }

    /// Switch to a new source.
    ///
    /// Pending jobs for other source ids are dropped and results of running
    /// ones are discarded. A running fetch for a source that kept its id is
    /// restarted against the new source.
    pub fn set_source(&self, source: Arc<dyn TileSource>) -> Result<(), ConfigError> {
        source.validate()?;
        let source_id = Arc::clone(source.source_id());
        let generation = {
            let mut active = self.shared().source.write();
            active.source = source;
            active.generation += 1;
            active.generation
        };

        let cancelled = self
            .shared()
            .queue
            .lock()
            .cancel_where(|id| id.source_arc() != &source_id);
        debug!(
            source = %source_id,
            generation,
            cancelled = cancelled.len(),
            "tile source changed"
        );
        Ok(())
    }

    pub fn source(&self) -> Arc<dyn TileSource> {
        Arc::clone(&self.shared().source.read().source)
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.shared().cache
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared().config
    }

    /// Whether any job is pending, running or waiting to retry.
    pub fn has_outstanding_jobs(&self) -> bool {
        !self.shared().queue.lock().is_empty()
    }

    /// Whether a job for `id` is pending, running or waiting to retry.
    pub fn is_outstanding(&self, id: &TileId) -> bool {
        self.shared().queue.lock().contains(id)
    }

    /// Jobs waiting for a worker or for a retry.
    pub fn pending_count(&self) -> usize {
        self.shared().queue.lock().pending_count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared().queue.lock().in_flight_count()
    }

    /// Stop the workers once their current job finishes.
    ///
    /// Pending jobs are dropped and later submissions are rejected.
    pub fn shutdown(&self) {
        self.shared().shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared().shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileLoader")
            .field("workers", &self.shared().config.workers)
            .field("pending", &self.pending_count())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// A decoded tile and the payload it came from.
struct Fetched {
    image: DynamicImage,
    response: FetchResponse,
    from_disk: bool,
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    trace!(worker, "worker started");
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let job = shared.queue.lock().pop();
        if let Some(job) = job {
            run_job(&shared, job).await;
            continue;
        }

        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // Re-check after registering so a submit between pop and enable is not missed
        if shared.shutdown.load(Ordering::Acquire) || shared.queue.lock().has_ready() {
            continue;
        }
        notified.await;
    }
    trace!(worker, "worker stopped");
}

async fn run_job(shared: &Arc<Shared>, job: FetchJob) {
    let (source, generation) = shared.active_source();
    if job.id.source_arc() != source.source_id() {
        shared.queue.lock().complete(&job.id);
        trace!(tile = %job.id, "dropped job for replaced source");
        return;
    }

    if job.attempt > 1 {
        shared.cache.upsert(
            &job.id,
            || Tile::loading(job.id.clone()),
            Tile::mark_loading,
        );
    }

    let result = load_tile(shared, source.as_ref(), &job).await;

    if let (Ok(fetched), Some(disk)) = (&result, &shared.disk) {
        if !fetched.from_disk && source.uses_disk_cache() && shared.is_current(generation) {
            if let Err(e) = disk.write(&job.id, &fetched.response).await {
                warn!(tile = %job.id, error = %e, "failed to write tile to disk cache");
            }
        }
    }

    settle(shared, job, generation, result);
}

/// Apply a finished attempt to the cache and the queue.
///
/// Holds the source read lock throughout, so a swap either happens before the
/// staleness check or after the tile is published.
fn settle(
    shared: &Arc<Shared>,
    job: FetchJob,
    generation: u64,
    result: Result<Fetched, FetchError>,
) {
    let active = shared.source.read();
    let source = active.source.as_ref();

    if job.id.source_arc() != source.source_id() {
        shared.queue.lock().complete(&job.id);
        debug!(tile = %job.id, "discarded result for replaced source");
        return;
    }
    if active.generation != generation {
        if shared.queue.lock().restart(&job.id) {
            shared.wake.notify_one();
        }
        debug!(tile = %job.id, "source replaced during fetch, restarting job");
        return;
    }

    match result {
        Ok(fetched) => {
            let metadata = source.tile_metadata(&fetched.response);
            let tile = Tile::loaded(
                job.id.clone(),
                Arc::new(fetched.image),
                fetched.response.expires_at,
            )
            .with_metadata(metadata);
            shared.cache.put(job.id.clone(), tile);
            shared.queue.lock().complete(&job.id);
            debug!(
                tile = %job.id,
                attempt = job.attempt,
                from_disk = fetched.from_disk,
                "tile loaded"
            );
            publish(shared, job.id, LoadOutcome::Loaded);
        }
        Err(error) => {
            shared.cache.upsert(
                &job.id,
                || Tile::loading(job.id.clone()),
                |tile| tile.mark_failed(error.clone()),
            );

            let retry = retry_policy(&shared.config.retry, source);
            if error.is_retryable() && retry.should_retry(job.attempt) {
                let delay = retry.delay_for(job.attempt);
                shared.queue.lock().start_backoff(&job.id);
                warn!(
                    tile = %job.id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "tile fetch failed, will retry"
                );
                schedule_retry(shared, job.id, delay);
            } else {
                shared.queue.lock().complete(&job.id);
                warn!(
                    tile = %job.id,
                    attempts = job.attempt,
                    error = %error,
                    "tile fetch failed"
                );
                publish(
                    shared,
                    job.id,
                    LoadOutcome::Failed {
                        error,
                        attempts: job.attempt,
                    },
                );
            }
        }
    }
}

/// The loader's policy, with the source's retry count if it sets one.
fn retry_policy(configured: &RetryPolicy, source: &dyn TileSource) -> RetryPolicy {
    match source.max_retries() {
        Some(max_retries) => RetryPolicy {
            max_retries,
            ..configured.clone()
        },
        None => configured.clone(),
    }
}

fn schedule_retry(shared: &Arc<Shared>, id: TileId, delay: Duration) {
    let shared = Arc::clone(shared);
    shared.handle.clone().spawn(async move {
        tokio::time::sleep(delay).await;
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if shared.queue.lock().requeue(&id) {
            shared.wake.notify_one();
        } else {
            trace!(tile = %id, "retry cancelled during backoff");
        }
    });
}

fn publish(shared: &Shared, id: TileId, outcome: LoadOutcome) {
    if shared.events.send(LoaderEvent { id, outcome }).is_err() {
        trace!("completion receiver dropped");
    }
}

/// One attempt: disk cache first unless forced, then the source's fetcher.
async fn load_tile(
    shared: &Shared,
    source: &dyn TileSource,
    job: &FetchJob,
) -> Result<Fetched, FetchError> {
    if !job.forced && source.uses_disk_cache() {
        if let Some(disk) = &shared.disk {
            if let Some(fetched) = load_from_disk(disk, &job.id).await {
                return Ok(fetched);
            }
        }
    }

    let url = source.url_for(&job.id);
    let fetcher = source
        .fetcher()
        .unwrap_or_else(|| Arc::clone(&shared.fetcher));
    let timeout = shared.config.fetch_timeout;
    let response = tokio::time::timeout(timeout, fetcher.fetch(&url))
        .await
        .map_err(|_| FetchError::Timeout {
            millis: timeout.as_millis() as u64,
        })??;

    if source.is_no_tile(&response) {
        return Err(FetchError::NotFound(format!("{url}: no tile marker")));
    }

    let image = decode_off_thread(&response).await?;
    Ok(Fetched {
        image,
        response,
        from_disk: false,
    })
}

/// Read and decode a fresh disk copy. Any failure falls back to the network.
async fn load_from_disk(disk: &DiskCache, id: &TileId) -> Option<Fetched> {
    let response = match disk.read_fresh(id).await {
        Ok(Some(response)) => response,
        Ok(None) => return None,
        Err(e) => {
            warn!(tile = %id, error = %e, "disk cache read failed");
            return None;
        }
    };

    match decode_off_thread(&response).await {
        Ok(image) => {
            trace!(tile = %id, "loaded tile from disk cache");
            Some(Fetched {
                image,
                response,
                from_disk: true,
            })
        }
        Err(e) => {
            warn!(tile = %id, error = %e, "discarding undecodable disk cache entry");
            if let Err(e) = disk.remove(id).await {
                warn!(tile = %id, error = %e, "failed to remove disk cache entry");
            }
            None
        }
    }
}

async fn decode_off_thread(response: &FetchResponse) -> Result<DynamicImage, FetchError> {
    let body = response.body.clone();
    tokio::task::spawn_blocking(move || decode_image(&body))
        .await
        .map_err(|e| FetchError::Decode(format!("decode task failed: {e}")))?
}
