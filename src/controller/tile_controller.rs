use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use image::DynamicImage;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace};

use super::listener::{
    AncestorImage, DisplayTile, PixelRegion, ProcessedEvents, TileReadyListener, ViewportUpdate,
};
use crate::config::TileConfig;
use crate::error::{ConfigError, FetchError};
use crate::io::{HttpFetcher, TileFetcher};
use crate::loader::{LoadOutcome, LoaderEvent, Priority, SubmitOutcome, TileLoader};
use crate::projection::{screen_rect, tile_bounds, visible_tiles, GeoBounds, TileId, Viewport};
use crate::source::{Attribution, TileSource};
use crate::tile::{CacheStats, Tile, TileCache, TileState};

/// Orchestrates viewport changes, the cache and the loader.
///
/// The controller lives on the render thread and never blocks: it reads the
/// cache, submits jobs, and drains completion events in
/// [`process_events`](Self::process_events), which the render loop calls
/// once per frame (or whenever it is woken).
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tile_mosaic::config::TileConfig;
/// use tile_mosaic::controller::TileController;
/// use tile_mosaic::projection::{TileId, ScreenRect, Viewport};
/// use tile_mosaic::source::TemplateSource;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = tokio::runtime::Runtime::new()?;
/// let source = Arc::new(TemplateSource::openstreetmap()?);
/// let mut controller = TileController::with_http(
///     TileConfig::default(),
///     source,
///     |id: &TileId, region: ScreenRect| println!("repaint {id} at {region:?}"),
///     runtime.handle().clone(),
/// )?;
///
/// let update = controller.on_viewport_changed(Viewport::new(52.5, 13.4, 12, 1280, 720));
/// println!("{} tiles visible, {} requested", update.visible.len(), update.requested);
///
/// // In the render loop
/// controller.process_events();
/// # Ok(())
/// # }
/// ```
pub struct TileController {
    config: TileConfig,
    cache: Arc<TileCache>,
    loader: TileLoader,
    source: Arc<dyn TileSource>,
    events: UnboundedReceiver<LoaderEvent>,
    listener: Box<dyn TileReadyListener>,

    viewport: Option<Viewport>,
    visible_order: Vec<TileId>,
    visible: HashSet<TileId>,
    /// Tiles that left the view, and when
    departed: HashMap<TileId, Instant>,
}

impl TileController {
    /// Build a controller and start its loader on `handle`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an invalid configuration or source.
    pub fn new<L>(
        config: TileConfig,
        source: Arc<dyn TileSource>,
        fetcher: Arc<dyn TileFetcher>,
        listener: L,
        handle: Handle,
    ) -> Result<Self, ConfigError>
    where
        L: TileReadyListener + 'static,
    {
        config.validate()?;
        source.validate()?;

        let cache = Arc::new(TileCache::new(config.cache_capacity)?);
        let (loader, events) = TileLoader::new(
            config.loader.clone(),
            Arc::clone(&source),
            fetcher,
            Arc::clone(&cache),
            config.disk_cache(),
            handle,
        )?;

        info!(
            source = %source.source_id(),
            capacity = config.cache_capacity,
            workers = config.loader.workers,
            disk_cache = config.disk_cache_dir.is_some(),
            "tile controller ready"
        );

        Ok(Self {
            config,
            cache,
            loader,
            source,
            events,
            listener: Box::new(listener),
            viewport: None,
            visible_order: Vec::new(),
            visible: HashSet::new(),
            departed: HashMap::new(),
        })
    }

    /// Build a controller that fetches over HTTP.
    pub fn with_http<L>(
        config: TileConfig,
        source: Arc<dyn TileSource>,
        listener: L,
        handle: Handle,
    ) -> Result<Self, ConfigError>
    where
        L: TileReadyListener + 'static,
    {
        let fetcher = HttpFetcher::new(config.loader.fetch_timeout, &config.user_agent)?;
        Self::new(config, source, Arc::new(fetcher), listener, handle)
    }

    // =========================================================================
    // Viewport handling
    // =========================================================================

    /// Recompute the visible set and request what is missing.
    ///
    /// The zoom is clamped to the source's bounds. Tiles are requested
    /// center-out. Failed tiles are resubmitted only once the error retry
    /// interval has passed since their last attempt, and never when the
    /// provider reported them missing. Expired tiles are refetched past the
    /// disk cache while their stale image stays on screen.
    pub fn on_viewport_changed(&mut self, viewport: Viewport) -> ViewportUpdate {
        let viewport = viewport.clamped_zoom(self.source.min_zoom(), self.source.max_zoom());
        let visible = visible_tiles(&viewport, self.source.source_id(), self.source.tile_size());

        let now = SystemTime::now();
        let count = visible.len();
        let mut hits = Vec::new();
        let mut requested = 0;

        for (index, id) in visible.iter().enumerate() {
            let priority = Priority((count - index) as u32);
            let outcome = match self.cache.get(id) {
                None => Some(self.loader.submit(id.clone(), priority)),
                Some(tile) => {
                    if tile.image.is_some() {
                        hits.push(id.clone());
                    }
                    self.resubmit_cached(&tile, priority, now)
                }
            };
            if outcome == Some(SubmitOutcome::Enqueued) {
                requested += 1;
            }
        }

        self.track_departures(&visible);
        self.cancel_departed();

        debug!(
            zoom = viewport.zoom,
            visible = count,
            hits = hits.len(),
            requested,
            "viewport changed"
        );

        self.viewport = Some(viewport);
        self.visible = visible.iter().cloned().collect();
        self.visible_order = visible.clone();

        ViewportUpdate {
            viewport,
            visible,
            hits,
            requested,
        }
    }

    fn resubmit_cached(
        &self,
        tile: &Tile,
        priority: Priority,
        now: SystemTime,
    ) -> Option<SubmitOutcome> {
        let id = &tile.id;
        match tile.state {
            TileState::Loaded if tile.is_expired_at(now) => {
                self.cache.update(id, |t| t.state = TileState::Expired);
                trace!(tile = %id, "tile expired, refreshing");
                Some(self.loader.submit_forced(id.clone(), priority))
            }
            TileState::Loaded => None,
            TileState::Expired => Some(self.loader.submit_forced(id.clone(), priority)),
            // Coalesces with the running job, or revives a cancelled one
            TileState::Loading => Some(self.loader.submit(id.clone(), priority)),
            // Permanently missing; only retry() or refresh() ask again
            TileState::Error if matches!(tile.last_error, Some(FetchError::NotFound(_))) => None,
            TileState::Error => {
                let due = tile
                    .since_last_attempt()
                    .map_or(true, |elapsed| elapsed > self.config.error_retry_interval);
                due.then(|| self.loader.submit(id.clone(), priority))
            }
        }
    }

    fn track_departures(&mut self, visible: &[TileId]) {
        let now = Instant::now();
        let incoming: HashSet<&TileId> = visible.iter().collect();

        for id in &self.visible {
            if !incoming.contains(id) {
                self.departed.entry(id.clone()).or_insert(now);
            }
        }
        for id in visible {
            self.departed.remove(id);
        }
    }

    /// Cancel pending jobs of tiles that have been out of view past the grace
    /// period.
    fn cancel_departed(&mut self) {
        let grace = self.config.cancel_grace;
        let loader = &self.loader;
        self.departed.retain(|id, since| {
            if since.elapsed() < grace {
                return true;
            }
            if loader.cancel(id) {
                trace!(tile = %id, "cancelled fetch for tile out of view");
            }
            false
        });
    }

    // =========================================================================
    // Completions
    // =========================================================================

    /// Drain completion events and notify the listener for visible tiles.
    ///
    /// Completions for tiles that left the view are cached but not repainted.
    /// Also cancels jobs whose tiles have been out of view past the grace
    /// period.
    pub fn process_events(&mut self) -> ProcessedEvents {
        let mut processed = ProcessedEvents::default();

        while let Ok(event) = self.events.try_recv() {
            match event.outcome {
                LoadOutcome::Loaded => {
                    processed.loaded += 1;
                    if self.notify_if_visible(&event.id) {
                        processed.repaints += 1;
                    } else {
                        trace!(tile = %event.id, "stale completion cached without repaint");
                    }
                }
                LoadOutcome::Failed { error, attempts } => {
                    processed.failed += 1;
                    debug!(tile = %event.id, attempts, error = %error, "tile failed");
                }
            }
        }

        self.cancel_departed();
        processed
    }

    fn notify_if_visible(&mut self, id: &TileId) -> bool {
        if !self.visible.contains(id) {
            return false;
        }
        let Some(viewport) = self.viewport else {
            return false;
        };
        match screen_rect(&viewport, id, self.source.tile_size()) {
            Some(region) => {
                self.listener.on_tile_ready(id, region);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Display
    // =========================================================================

    /// What to draw for `id` right now.
    ///
    /// A tile with an image is ready even when stale or failed on refresh.
    /// Otherwise the nearest cached ancestor, if any, is offered as a
    /// scaled-up placeholder.
    pub fn tile_for_display(&self, id: &TileId) -> DisplayTile {
        if let Some(image) = self.cache.get(id).and_then(|tile| tile.image) {
            return DisplayTile::Ready(image);
        }

        let min_zoom = self.source.min_zoom();
        let mut current = id.parent();
        while let Some(ancestor) = current {
            if ancestor.zoom() < min_zoom {
                break;
            }
            if let Some(image) = self.cache.peek(&ancestor).and_then(|tile| tile.image) {
                if let Some(region) = ancestor_region(id, &ancestor, &image) {
                    return DisplayTile::Placeholder {
                        ancestor: Some(AncestorImage {
                            id: ancestor,
                            image,
                            region,
                        }),
                    };
                }
                break;
            }
            current = ancestor.parent();
        }

        DisplayTile::Placeholder { ancestor: None }
    }

    // =========================================================================
    // Manual control
    // =========================================================================

    /// Retry a tile now, ignoring the error retry interval.
    pub fn retry(&self, id: &TileId) -> SubmitOutcome {
        self.loader.submit(id.clone(), Priority::HIGHEST)
    }

    /// Refetch a tile past the disk cache, keeping its current image meanwhile.
    pub fn refresh(&self, id: &TileId) -> SubmitOutcome {
        self.loader.submit_forced(id.clone(), Priority::HIGHEST)
    }

    /// Swap the tile source.
    ///
    /// Outstanding jobs are cancelled, every tile of the old source is
    /// invalidated, and the current viewport is requested again from the new
    /// source. Returns the number of invalidated tiles.
    pub fn set_tile_source(&mut self, source: Arc<dyn TileSource>) -> Result<usize, ConfigError> {
        source.validate()?;

        let old = Arc::clone(&self.source);
        self.loader.cancel_outstanding();
        self.loader.set_source(Arc::clone(&source))?;
        self.source = source;

        let invalidated = self.cache.invalidate_source(old.source_id());
        self.visible.clear();
        self.visible_order.clear();
        self.departed.clear();

        info!(
            from = %old.source_id(),
            to = %self.source.source_id(),
            invalidated,
            "tile source switched"
        );

        if let Some(viewport) = self.viewport {
            self.on_viewport_changed(viewport);
        }
        Ok(invalidated)
    }

    /// Drop cached tiles overlapping `bounds`. Running fetches are unaffected.
    pub fn invalidate_region(&self, bounds: GeoBounds) -> usize {
        self.cache
            .invalidate_region(|id, _| tile_bounds(id).intersects(&bounds))
    }

    /// Cancel every job that has not started.
    pub fn cancel_outstanding_jobs(&mut self) -> usize {
        self.departed.clear();
        self.loader.cancel_outstanding()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn loader(&self) -> &TileLoader {
        &self.loader
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        &self.source
    }

    pub fn attribution(&self) -> Option<Attribution> {
        self.source.attribution().cloned()
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    /// The last viewport, after zoom clamping.
    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Visible tiles of the last viewport, nearest to the center first.
    pub fn visible_tiles(&self) -> &[TileId] {
        &self.visible_order
    }

    pub fn is_visible(&self, id: &TileId) -> bool {
        self.visible.contains(id)
    }

    pub fn has_outstanding_jobs(&self) -> bool {
        self.loader.has_outstanding_jobs()
    }

    /// Whether every visible tile has settled into `Loaded` or `Error`.
    pub fn is_settled(&self) -> bool {
        self.visible_order.iter().all(|id| {
            self.cache.peek(id).is_some_and(|tile| {
                matches!(tile.state, TileState::Loaded | TileState::Error)
                    && !self.loader.is_outstanding(id)
            })
        })
    }

    /// Time until the next departed tile's grace period ends, if any.
    pub fn next_cancel_deadline(&self) -> Option<Duration> {
        self.departed
            .values()
            .map(|since| self.config.cancel_grace.saturating_sub(since.elapsed()))
            .min()
    }
}

impl Drop for TileController {
    fn drop(&mut self) {
        self.loader.shutdown();
    }
}

impl std::fmt::Debug for TileController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileController")
            .field("source", &self.source.source_id())
            .field("viewport", &self.viewport)
            .field("visible", &self.visible_order.len())
            .field("cache", &self.cache)
            .field("loader", &self.loader)
            .finish()
    }
}

/// Part of `ancestor`'s image that covers `id`, or `None` below one pixel.
fn ancestor_region(id: &TileId, ancestor: &TileId, image: &DynamicImage) -> Option<PixelRegion> {
    let dz = id.zoom().checked_sub(ancestor.zoom())?;
    let scale = 1u32 << dz;
    let width = image.width() / scale;
    let height = image.height() / scale;
    if width == 0 || height == 0 {
        return None;
    }

    let dx = id.column() - (ancestor.column() << dz);
    let dy = id.row() - (ancestor.row() << dz);
    Some(PixelRegion {
        x: dx * width,
        y: dy * height,
        width,
        height,
    })
}
