//! Value types for tile addressing and viewport geometry.

use std::fmt;
use std::sync::Arc;

/// Maximum zoom level supported by tile addressing.
pub const MAX_ZOOM: u8 = 22;

/// Northern limit of the spherical-Mercator projection in degrees.
pub const MAX_LAT: f64 = 85.051_128_779_806_59;

/// Southern limit of the spherical-Mercator projection in degrees.
pub const MIN_LAT: f64 = -MAX_LAT;

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Number of tiles along one axis at `zoom`.
#[inline]
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom
}

// =============================================================================
// TileId
// =============================================================================

/// Identifies one tile of one source.
///
/// Equality and hashing cover all four fields, so the same grid position from
/// two different sources never collides in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileId {
    source_id: Arc<str>,
    zoom: u8,
    column: u32,
    row: u32,
}

impl TileId {
    /// Create a tile id, returning `None` when the position is outside the
    /// grid for `zoom` or `zoom` exceeds [`MAX_ZOOM`].
    pub fn new(source_id: impl Into<Arc<str>>, zoom: u8, column: u32, row: u32) -> Option<Self> {
        if zoom > MAX_ZOOM {
            return None;
        }
        let n = tiles_per_axis(zoom);
        if column >= n || row >= n {
            return None;
        }
        Some(Self {
            source_id: source_id.into(),
            zoom,
            column,
            row,
        })
    }

    /// Create a tile id from unbounded grid coordinates.
    ///
    /// The column wraps around the antimeridian. Rows above the north pole or
    /// below the south pole have no tile and yield `None`.
    pub fn wrapping(
        source_id: impl Into<Arc<str>>,
        zoom: u8,
        column: i64,
        row: i64,
    ) -> Option<Self> {
        if zoom > MAX_ZOOM {
            return None;
        }
        let n = i64::from(tiles_per_axis(zoom));
        if !(0..n).contains(&row) {
            return None;
        }
        Some(Self {
            source_id: source_id.into(),
            zoom,
            column: column.rem_euclid(n) as u32,
            row: row as u32,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Shared handle to the source id, cheap to clone into sibling ids.
    pub fn source_arc(&self) -> &Arc<str> {
        &self.source_id
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    /// The tile one zoom level up that contains this one.
    pub fn parent(&self) -> Option<TileId> {
        if self.zoom == 0 {
            return None;
        }
        Some(Self {
            source_id: Arc::clone(&self.source_id),
            zoom: self.zoom - 1,
            column: self.column >> 1,
            row: self.row >> 1,
        })
    }

    /// Whether this tile lies within `outer` (same source, same or deeper zoom).
    pub fn is_inside(&self, outer: &TileId) -> bool {
        if self.source_id != outer.source_id || self.zoom < outer.zoom {
            return false;
        }
        let dz = self.zoom - outer.zoom;
        self.column >> dz == outer.column && self.row >> dz == outer.row
    }

    /// The block of tiles at `zoom` that covers the same area as this tile.
    ///
    /// Zooming out yields the single ancestor; zooming in yields a
    /// `2^dz x 2^dz` block of descendants.
    pub fn covering_range(&self, zoom: u8) -> TileRange {
        if zoom <= self.zoom {
            let dz = self.zoom - zoom;
            let column = self.column >> dz;
            let row = self.row >> dz;
            TileRange {
                zoom,
                min_column: column,
                min_row: row,
                max_column: column,
                max_row: row,
            }
        } else {
            let dz = zoom - self.zoom;
            let min_column = self.column << dz;
            let min_row = self.row << dz;
            TileRange {
                zoom,
                min_column,
                min_row,
                max_column: min_column + (1 << dz) - 1,
                max_row: min_row + (1 << dz) - 1,
            }
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.source_id, self.zoom, self.column, self.row
        )
    }
}

// =============================================================================
// TileRange
// =============================================================================

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_column: u32,
    pub min_row: u32,
    pub max_column: u32,
    pub max_row: u32,
}

impl TileRange {
    /// Number of tiles in the range.
    pub fn len(&self) -> usize {
        (self.max_column - self.min_column + 1) as usize
            * (self.max_row - self.min_row + 1) as usize
    }

    /// Always false: a range holds at least one tile.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether the grid position lies inside the range.
    pub fn contains(&self, column: u32, row: u32) -> bool {
        (self.min_column..=self.max_column).contains(&column)
            && (self.min_row..=self.max_row).contains(&row)
    }

    /// Materialize the range as tile ids of `source_id`, row-major.
    pub fn tile_ids(&self, source_id: &Arc<str>) -> Vec<TileId> {
        let mut ids = Vec::with_capacity(self.len());
        for row in self.min_row..=self.max_row {
            for column in self.min_column..=self.max_column {
                ids.push(TileId {
                    source_id: Arc::clone(source_id),
                    zoom: self.zoom,
                    column,
                    row,
                });
            }
        }
        ids
    }
}

// =============================================================================
// Geographic and screen geometry
// =============================================================================

/// Position of a geographic point inside the tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePosition {
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
    /// Pixel offset from the tile's left edge
    pub pixel_x: u32,
    /// Pixel offset from the tile's top edge
    pub pixel_y: u32,
}

impl TilePosition {
    /// Attach a source to this position.
    pub fn tile_id(&self, source_id: impl Into<Arc<str>>) -> TileId {
        TileId {
            source_id: source_id.into(),
            zoom: self.zoom,
            column: self.column,
            row: self.row,
        }
    }
}

/// Latitude/longitude rectangle in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub lat_min: f64,
    pub lon_min: f64,
    pub lat_max: f64,
    pub lon_max: f64,
}

impl GeoBounds {
    /// Inclusive containment test.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }

    /// Whether two rectangles share any area or edge.
    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.lat_min <= other.lat_max
            && other.lat_min <= self.lat_max
            && self.lon_min <= other.lon_max
            && other.lon_min <= self.lon_max
    }
}

/// Rectangle in viewport pixels, origin at the viewport's top-left corner.
///
/// Coordinates may be negative for tiles partially scrolled out of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// The visible map area, as supplied by the render layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    pub width_px: u32,
    pub height_px: u32,
}

impl Viewport {
    pub fn new(center_lat: f64, center_lon: f64, zoom: u8, width_px: u32, height_px: u32) -> Self {
        Self {
            center_lat,
            center_lon,
            zoom,
            width_px,
            height_px,
        }
    }

    /// Copy of this viewport with the zoom clamped into `[min, max]`.
    pub fn clamped_zoom(&self, min: u8, max: u8) -> Self {
        Self {
            zoom: self.zoom.clamp(min, max.min(MAX_ZOOM)),
            ..*self
        }
    }

    /// Whether the viewport covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width_px == 0 || self.height_px == 0
    }
}
