//! Viewport-driven orchestration of the cache and the loader.
//!
//! # Architecture
//!
//! ```text
//!   render thread                         worker pool
//!   ─────────────                         ───────────
//!   on_viewport_changed(viewport)
//!     │ visible_tiles (center-out)
//!     │ TileCache::get ── hit ──► ViewportUpdate::hits
//!     │            └── miss ──► TileLoader::submit ──► fetch, decode
//!     │                                                   │
//!     │                                       TileCache::put, LoaderEvent
//!   process_events() ◄───────── channel ──────────────────┘
//!     │ still visible?
//!     └──► TileReadyListener::on_tile_ready(id, screen rect)
//! ```
//!
//! Completions are delivered on the render thread through
//! [`TileController::process_events`]; the listener is never called from a
//! worker.

mod listener;
mod tile_controller;

pub use listener::{
    AncestorImage, DisplayTile, NoopListener, PixelRegion, ProcessedEvents, TileReadyListener,
    ViewportUpdate,
};
pub use tile_controller::TileController;

pub use crate::projection::ScreenRect;
