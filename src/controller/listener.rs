use std::sync::Arc;

use image::DynamicImage;

use crate::projection::{ScreenRect, TileId, Viewport};

/// Receives repaint requests from the controller.
///
/// Calls happen on the thread that drives
/// [`TileController::process_events`](super::TileController::process_events),
/// never on a worker, so implementations may touch render state freely.
pub trait TileReadyListener: Send {
    /// A visible tile finished loading; `region` is where it sits on screen.
    fn on_tile_ready(&mut self, id: &TileId, region: ScreenRect);
}

impl<F> TileReadyListener for F
where
    F: FnMut(&TileId, ScreenRect) + Send,
{
    fn on_tile_ready(&mut self, id: &TileId, region: ScreenRect) {
        self(id, region)
    }
}

/// Listener that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl TileReadyListener for NoopListener {
    fn on_tile_ready(&mut self, _id: &TileId, _region: ScreenRect) {}
}

/// Pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A cached ancestor standing in for a missing tile.
#[derive(Debug, Clone)]
pub struct AncestorImage {
    pub id: TileId,
    pub image: Arc<DynamicImage>,
    /// Part of `image` covering the requested tile; scale it up to draw
    pub region: PixelRegion,
}

/// What the render layer should draw for a tile.
#[derive(Debug, Clone)]
pub enum DisplayTile {
    /// The tile's own image, possibly stale while a refresh runs
    Ready(Arc<DynamicImage>),
    /// No image yet; draw the ancestor crop if there is one
    Placeholder { ancestor: Option<AncestorImage> },
}

impl DisplayTile {
    pub fn is_ready(&self) -> bool {
        matches!(self, DisplayTile::Ready(_))
    }
}

/// Result of a viewport change.
#[derive(Debug, Clone)]
pub struct ViewportUpdate {
    /// The viewport after zoom clamping
    pub viewport: Viewport,
    /// Visible tiles, nearest to the center first
    pub visible: Vec<TileId>,
    /// Visible tiles that can be drawn immediately
    pub hits: Vec<TileId>,
    /// New fetch jobs created by this change
    pub requested: usize,
}

/// Counts from one [`process_events`](super::TileController::process_events) call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessedEvents {
    pub loaded: usize,
    pub failed: usize,
    /// Listener notifications; loaded tiles no longer visible are not repainted
    pub repaints: usize,
}

impl ProcessedEvents {
    pub fn is_empty(&self) -> bool {
        self.loaded == 0 && self.failed == 0
    }
}
