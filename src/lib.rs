//! # tile-mosaic
//!
//! Tile fetching and caching for slippy-map viewers.
//!
//! Given a viewport (center, zoom, pixel size), the crate works out which
//! Web Mercator tiles are visible, serves the ones already in memory, and
//! fetches the rest from a URL-templated tile server or a local MBTiles file
//! on a bounded pool of background workers. When a visible tile arrives, the
//! render layer is told which screen rectangle to repaint.
//!
//! ## Features
//!
//! - **Center-out loading**: tiles nearest the viewport center are fetched first
//! - **Deduplicated fetches**: one in-flight job per tile, however often it is requested
//! - **Two-level caching**: an LRU of decoded images, plus an optional disk cache
//! - **Retries with backoff**: transient failures are retried, missing tiles are not
//! - **Progressive display**: a cached ancestor stands in while a tile loads
//!
//! ## Architecture
//!
//! - [`projection`] - Web Mercator math, tile ids and visible-set computation
//! - [`tile`] - Tile state and the in-memory LRU cache
//! - [`source`] - Tile source abstraction, URL templates and MBTiles files
//! - [`io`] - HTTP fetching and the disk cache
//! - [`loader`] - Deduplicating job queue and worker pool
//! - [`controller`] - Viewport orchestration and repaint notification
//! - [`config`] - Configuration and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tile_mosaic::{NoopListener, TemplateSource, TileConfig, TileController, Viewport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(TemplateSource::openstreetmap()?);
//!     let mut controller = TileController::with_http(
//!         TileConfig::default(),
//!         source,
//!         NoopListener,
//!         tokio::runtime::Handle::current(),
//!     )?;
//!
//!     controller.on_viewport_changed(Viewport::new(48.8566, 2.3522, 13, 800, 600));
//!     while controller.has_outstanding_jobs() {
//!         tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!         controller.process_events();
//!     }
//!     println!("{:?}", controller.cache_stats());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod io;
pub mod loader;
pub mod projection;
pub mod source;
pub mod tile;

// Re-export commonly used types
pub use config::{Cli, Command, LocateArgs, OutputFormat, PrefetchArgs, TileConfig};
pub use controller::{
    AncestorImage, DisplayTile, NoopListener, PixelRegion, ProcessedEvents, TileController,
    TileReadyListener, ViewportUpdate,
};
pub use error::{ConfigError, DiskCacheError, FetchError};
pub use io::{DiskCache, FetchResponse, HttpFetcher, TileFetcher};
pub use loader::{
    LoadOutcome, LoaderConfig, LoaderEvent, Priority, RetryPolicy, SubmitOutcome, TileLoader,
};
pub use projection::{
    project, screen_rect, tile_bounds, visible_tiles, GeoBounds, ScreenRect, TileId, TilePosition,
    TileRange, Viewport, DEFAULT_TILE_SIZE, MAX_ZOOM,
};
pub use source::{Attribution, MbTilesSource, NoTilePolicy, TemplateSource, TileSource};
pub use tile::{CacheStats, Tile, TileCache, TileState};
