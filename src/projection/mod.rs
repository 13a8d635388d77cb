//! Spherical-Mercator slippy-map projection.
//!
//! Pure functions mapping geographic coordinates to tile grid positions and
//! back, plus the viewport-to-tiles computation that drives fetching.
//!
//! # Grid
//!
//! At zoom `z` the world is a `2^z x 2^z` grid of square tiles. Column 0 starts
//! at longitude -180 and row 0 at the northern Mercator limit
//! ([`MAX_LAT`]). Each tile is `tile_size` pixels on a side, so the world is
//! `2^z * tile_size` pixels wide at that zoom.
//!
//! # Example
//!
//! ```
//! use tile_mosaic::projection::{project, tile_bounds};
//!
//! // Berlin at zoom 3
//! let position = project(52.5, 13.4, 3);
//! assert_eq!((position.column, position.row), (4, 2));
//!
//! let bounds = tile_bounds(&position.tile_id("osm"));
//! assert!(bounds.contains(52.5, 13.4));
//! ```

mod types;

pub use types::{
    tiles_per_axis, GeoBounds, ScreenRect, TileId, TilePosition, TileRange, Viewport,
    DEFAULT_TILE_SIZE, MAX_LAT, MAX_ZOOM, MIN_LAT,
};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// Wrap a longitude into `[-180, 180)`.
#[inline]
pub fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Clamp a latitude into the Mercator-valid range.
#[inline]
pub fn clamp_latitude(lat: f64) -> f64 {
    lat.clamp(MIN_LAT, MAX_LAT)
}

/// World pixel coordinates of a point at `zoom`.
///
/// Longitude wraps and latitude saturates, so every finite input maps into
/// `[0, world) x [0, world]`.
pub fn world_pixel(lat: f64, lon: f64, zoom: u8, tile_size: u32) -> (f64, f64) {
    let world = f64::from(tiles_per_axis(zoom)) * f64::from(tile_size);
    let lon = wrap_longitude(lon);
    let lat_rad = clamp_latitude(lat).to_radians();

    let x = (lon + 180.0) / 360.0 * world;
    let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * world;

    (x, y.clamp(0.0, world))
}

/// Project a point to its tile and pixel offset using 256px tiles.
pub fn project(lat: f64, lon: f64, zoom: u8) -> TilePosition {
    project_with_tile_size(lat, lon, zoom, DEFAULT_TILE_SIZE)
}

/// Project a point to its tile and pixel offset.
///
/// Points on the southern limit belong to the last row.
pub fn project_with_tile_size(lat: f64, lon: f64, zoom: u8, tile_size: u32) -> TilePosition {
    let zoom = zoom.min(MAX_ZOOM);
    let (x, y) = world_pixel(lat, lon, zoom, tile_size);
    let max_index = tiles_per_axis(zoom) - 1;
    let size = f64::from(tile_size);

    let column = ((x / size).floor() as u32).min(max_index);
    let row = ((y / size).floor() as u32).min(max_index);

    let pixel_x = (x.floor() as u64).saturating_sub(u64::from(column) * u64::from(tile_size));
    let pixel_y = (y.floor() as u64).saturating_sub(u64::from(row) * u64::from(tile_size));

    TilePosition {
        zoom,
        column,
        row,
        pixel_x: (pixel_x as u32).min(tile_size - 1),
        pixel_y: (pixel_y as u32).min(tile_size - 1),
    }
}

/// Latitude of the top edge of `row` at `zoom` (rows may be fractional).
fn row_to_lat(row: f64, zoom: u8) -> f64 {
    let n = f64::from(tiles_per_axis(zoom));
    (PI * (1.0 - 2.0 * row / n)).sinh().atan().to_degrees()
}

/// Longitude of the left edge of `column` at `zoom`.
fn column_to_lon(column: f64, zoom: u8) -> f64 {
    let n = f64::from(tiles_per_axis(zoom));
    column / n * 360.0 - 180.0
}

/// Geographic bounds of a tile.
pub fn tile_bounds(id: &TileId) -> GeoBounds {
    let column = f64::from(id.column());
    let row = f64::from(id.row());

    GeoBounds {
        lat_min: row_to_lat(row + 1.0, id.zoom()),
        lon_min: column_to_lon(column, id.zoom()),
        lat_max: row_to_lat(row, id.zoom()),
        lon_max: column_to_lon(column + 1.0, id.zoom()),
    }
}

/// Tiles intersecting the viewport rectangle, nearest to the center first.
///
/// The viewport zoom is used as-is; callers clamp it to their source's bounds.
/// Horizontally the map repeats, so a viewport wider than the world still
/// lists each column once. Ties in distance are broken by row, then column,
/// which keeps the output deterministic.
pub fn visible_tiles(viewport: &Viewport, source_id: &Arc<str>, tile_size: u32) -> Vec<TileId> {
    if viewport.is_empty() || tile_size == 0 {
        return Vec::new();
    }

    let zoom = viewport.zoom.min(MAX_ZOOM);
    let n = i64::from(tiles_per_axis(zoom));
    let size = f64::from(tile_size);
    let (cx, cy) = world_pixel(viewport.center_lat, viewport.center_lon, zoom, tile_size);

    let left = cx - f64::from(viewport.width_px) / 2.0;
    let top = cy - f64::from(viewport.height_px) / 2.0;
    let right = left + f64::from(viewport.width_px);
    let bottom = top + f64::from(viewport.height_px);

    let first_column = (left / size).floor() as i64;
    let last_column = (right / size).ceil() as i64 - 1;
    let first_row = ((top / size).floor() as i64).max(0);
    let last_row = ((bottom / size).ceil() as i64 - 1).min(n - 1);

    // Wrapped column -> (squared distance, tile); a wide viewport can see the
    // same column twice, keep the nearer copy.
    let mut nearest: HashMap<(i64, i64), (f64, TileId)> = HashMap::new();
    for row in first_row..=last_row {
        for column in first_column..=last_column {
            let Some(id) = TileId::wrapping(Arc::clone(source_id), zoom, column, row) else {
                continue;
            };
            let dx = (column as f64 + 0.5) * size - cx;
            let dy = (row as f64 + 0.5) * size - cy;
            let distance = dx * dx + dy * dy;

            let key = (i64::from(id.column()), row);
            match nearest.get(&key) {
                Some((existing, _)) if *existing <= distance => {}
                _ => {
                    nearest.insert(key, (distance, id));
                }
            }
        }
    }

    let mut ordered: Vec<(f64, TileId)> = nearest.into_values().collect();
    ordered.sort_by(|(da, a), (db, b)| {
        da.partial_cmp(db)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.row().cmp(&b.row()))
            .then_with(|| a.column().cmp(&b.column()))
    });
    ordered.into_iter().map(|(_, id)| id).collect()
}

/// Screen rectangle of a tile inside the viewport.
///
/// The copy of the tile nearest the viewport center is used when the map
/// wraps. Returns `None` when the tile is at a different zoom or does not
/// intersect the viewport.
pub fn screen_rect(viewport: &Viewport, id: &TileId, tile_size: u32) -> Option<ScreenRect> {
    if id.zoom() != viewport.zoom.min(MAX_ZOOM) || viewport.is_empty() {
        return None;
    }

    let size = f64::from(tile_size);
    let world = f64::from(tiles_per_axis(id.zoom())) * size;
    let (cx, cy) = world_pixel(viewport.center_lat, viewport.center_lon, id.zoom(), tile_size);
    let left = cx - f64::from(viewport.width_px) / 2.0;
    let top = cy - f64::from(viewport.height_px) / 2.0;

    let mut tile_x = f64::from(id.column()) * size;
    let tile_center = tile_x + size / 2.0;
    let shift = ((cx - tile_center) / world).round();
    tile_x += shift * world;
    let tile_y = f64::from(id.row()) * size;

    let x = (tile_x - left).floor() as i64;
    let y = (tile_y - top).floor() as i64;
    let width = i64::from(tile_size);

    let overlaps = x < i64::from(viewport.width_px)
        && x + width > 0
        && y < i64::from(viewport.height_px)
        && y + width > 0;

    overlaps.then_some(ScreenRect {
        x,
        y,
        width: tile_size,
        height: tile_size,
    })
}
