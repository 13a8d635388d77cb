//! Local MBTiles tilesets.
//!
//! An MBTiles file is a SQLite database with a `metadata` name/value table and
//! a `tiles` table keyed by zoom, column and row. Tiles are read through
//! [`MbTilesFetcher`], which the loader picks up from [`TileSource::fetcher`],
//! so these sources never touch the network or the disk cache. A missing row
//! is permanent and lookups are not retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::{Attribution, TileSource};
use crate::error::{ConfigError, FetchError};
use crate::io::{FetchResponse, TileFetcher};
use crate::projection::{tiles_per_axis, TileId, DEFAULT_TILE_SIZE, MAX_ZOOM};

const URL_SCHEME: &str = "mbtiles://";

/// Read connections kept open per tileset.
const POOL_CONNECTIONS: u32 = 4;

/// Layer kind declared in the `type` metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TilesetType {
    BaseLayer,
    Overlay,
}

impl TilesetType {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "baselayer" => Some(TilesetType::BaseLayer),
            "overlay" => Some(TilesetType::Overlay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TilesetType::BaseLayer => "baselayer",
            TilesetType::Overlay => "overlay",
        }
    }
}

/// Raster encoding declared in the `format` metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileFormat {
    Png,
    Jpeg,
}

impl TileFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Some(TileFormat::Png),
            "jpg" | "jpeg" => Some(TileFormat::Jpeg),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
        }
    }
}

// =============================================================================
// MbTilesSource
// =============================================================================

/// Tile source backed by a local `.mbtiles` file.
///
/// The zoom range, name, format and attribution come from the file. MBTiles
/// rows count from the south edge (TMS); with `flip_y` set, the default for
/// conforming files, XYZ rows are flipped on lookup.
#[derive(Debug)]
pub struct MbTilesSource {
    source_id: Arc<str>,
    name: String,
    path: PathBuf,
    min_zoom: u8,
    max_zoom: u8,
    tileset_type: Option<TilesetType>,
    format: Option<TileFormat>,
    attribution: Option<Attribution>,
    fetcher: Arc<MbTilesFetcher>,
}

impl MbTilesSource {
    /// Open `path` read-only and read its metadata.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MbTiles`] when the file cannot be opened, lacks the
    /// MBTiles tables, holds no tiles, or declares zooms outside 0-22.
    pub async fn open(
        source_id: impl Into<Arc<str>>,
        path: impl AsRef<Path>,
        flip_y: bool,
    ) -> Result<Self, ConfigError> {
        let source_id = source_id.into();
        let path = path.as_ref().to_path_buf();
        let invalid = |e: sqlx::Error| ConfigError::MbTiles(format!("{}: {e}", path.display()));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(invalid)?;

        let rows = sqlx::query_as::<_, (String, Option<String>)>("SELECT name, value FROM metadata")
            .fetch_all(&pool)
            .await
            .map_err(invalid)?;
        let metadata: HashMap<String, String> = rows
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name.to_ascii_lowercase(), value)))
            .collect();

        let (min_zoom, max_zoom) = match declared_zoom_range(&metadata) {
            Some(range) => range,
            None => stored_zoom_range(&pool, &path).await?,
        };

        let format = metadata.get("format").and_then(|f| TileFormat::parse(f));
        let source = Self {
            name: metadata
                .get("name")
                .cloned()
                .unwrap_or_else(|| source_id.to_string()),
            source_id,
            min_zoom,
            max_zoom,
            tileset_type: metadata.get("type").and_then(|t| TilesetType::parse(t)),
            format,
            attribution: metadata
                .get("attribution")
                .filter(|text| !text.trim().is_empty())
                .map(Attribution::new),
            fetcher: Arc::new(MbTilesFetcher {
                pool,
                flip_y,
                format,
            }),
            path,
        };
        source.validate()?;

        info!(
            source = %source.source_id,
            path = %source.path.display(),
            min_zoom = source.min_zoom,
            max_zoom = source.max_zoom,
            "opened MBTiles tileset"
        );
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tileset_type(&self) -> Option<TilesetType> {
        self.tileset_type
    }

    pub fn format(&self) -> Option<TileFormat> {
        self.format
    }

    pub fn flips_y(&self) -> bool {
        self.fetcher.flip_y
    }
}

impl TileSource for MbTilesSource {
    fn source_id(&self) -> &Arc<str> {
        &self.source_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn url_for(&self, id: &TileId) -> String {
        format!(
            "{URL_SCHEME}{}/{}/{}/{}",
            id.source_id(),
            id.zoom(),
            id.column(),
            id.row()
        )
    }

    fn tile_size(&self) -> u32 {
        DEFAULT_TILE_SIZE
    }

    fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn attribution(&self) -> Option<&Attribution> {
        self.attribution.as_ref()
    }

    fn fetcher(&self) -> Option<Arc<dyn TileFetcher>> {
        Some(Arc::clone(&self.fetcher) as Arc<dyn TileFetcher>)
    }

    fn max_retries(&self) -> Option<u32> {
        Some(0)
    }

    fn uses_disk_cache(&self) -> bool {
        false
    }
}

fn parse_zoom(metadata: &HashMap<String, String>, key: &str) -> Option<u8> {
    metadata.get(key)?.trim().parse().ok()
}

fn declared_zoom_range(metadata: &HashMap<String, String>) -> Option<(u8, u8)> {
    Some((
        parse_zoom(metadata, "minzoom")?,
        parse_zoom(metadata, "maxzoom")?,
    ))
}

async fn stored_zoom_range(pool: &SqlitePool, path: &Path) -> Result<(u8, u8), ConfigError> {
    let invalid = |reason: String| ConfigError::MbTiles(format!("{}: {reason}", path.display()));

    let (min, max) = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
        "SELECT MIN(zoom_level), MAX(zoom_level) FROM tiles",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| invalid(e.to_string()))?;

    let (Some(min), Some(max)) = (min, max) else {
        return Err(invalid("tileset contains no tiles".to_string()));
    };
    let to_zoom = |zoom: i64| {
        u8::try_from(zoom)
            .ok()
            .filter(|zoom| *zoom <= MAX_ZOOM)
            .ok_or_else(|| invalid(format!("zoom level {zoom} out of range")))
    };
    Ok((to_zoom(min)?, to_zoom(max)?))
}

// =============================================================================
// MbTilesFetcher
// =============================================================================

/// Reads tile blobs for `mbtiles://<source>/<z>/<x>/<y>` URLs.
#[derive(Debug)]
pub struct MbTilesFetcher {
    pool: SqlitePool,
    flip_y: bool,
    format: Option<TileFormat>,
}

impl MbTilesFetcher {
    /// Row as stored in the `tiles` table.
    fn stored_row(&self, zoom: u8, row: u32) -> u32 {
        if self.flip_y {
            tiles_per_axis(zoom) - 1 - row
        } else {
            row
        }
    }
}

#[async_trait]
impl TileFetcher for MbTilesFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let (zoom, column, row) = parse_tile_url(url)
            .ok_or_else(|| FetchError::NotFound(format!("{url}: not an MBTiles tile URL")))?;
        let stored_row = self.stored_row(zoom, row);

        let data = sqlx::query_scalar::<_, Option<Vec<u8>>>(
            "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
        )
        .bind(i64::from(zoom))
        .bind(i64::from(column))
        .bind(i64::from(stored_row))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FetchError::Storage(e.to_string()))?
        .flatten();

        let Some(body) = data else {
            debug!(url, stored_row, "tile missing from MBTiles file");
            return Err(FetchError::NotFound(format!("{url}: not in tileset")));
        };

        let mut response = FetchResponse::from_body(body);
        if let Some(format) = self.format {
            response
                .headers
                .insert("content-type".to_string(), format.mime_type().to_string());
        }
        Ok(response)
    }
}

/// Split `mbtiles://<source>/<z>/<x>/<y>` into an in-range position.
fn parse_tile_url(url: &str) -> Option<(u8, u32, u32)> {
    let rest = url.strip_prefix(URL_SCHEME)?;
    let mut parts = rest.rsplitn(4, '/');
    let row: u32 = parts.next()?.parse().ok()?;
    let column: u32 = parts.next()?.parse().ok()?;
    let zoom: u8 = parts.next()?.parse().ok()?;
    parts.next()?;

    if zoom > MAX_ZOOM {
        return None;
    }
    let n = tiles_per_axis(zoom);
    (column < n && row < n).then_some((zoom, column, row))
}
