//! Configuration for the tile engine and its command-line front end.
//!
//! The library is configured through [`TileConfig`], a plain struct with
//! defaults and a `validate` step that turns bad values into [`ConfigError`]s.
//! The binary builds a `TileConfig` from command-line arguments parsed with
//! clap; every option can also be set through a `TILE_MOSAIC_` environment
//! variable.
//!
//! # Environment Variables
//!
//! - `TILE_MOSAIC_URL_TEMPLATE` - Tile URL template (default: OpenStreetMap)
//! - `TILE_MOSAIC_MBTILES` - Local MBTiles file, used instead of the template
//! - `TILE_MOSAIC_SOURCE_ID` - Source identifier (default: osm)
//! - `TILE_MOSAIC_CACHE_DIR` - Disk cache directory (default: none)
//! - `TILE_MOSAIC_CACHE_TILES` - In-memory cache capacity in tiles (default: 512)
//! - `TILE_MOSAIC_WORKERS` - Concurrent fetches (default: 4)
//! - `TILE_MOSAIC_MAX_RETRIES` - Retries per tile (default: 3)
//! - `TILE_MOSAIC_TIMEOUT_SECS` - Per-attempt fetch timeout (default: 10)
//! - `TILE_MOSAIC_DISK_MAX_AGE_SECS` - Disk cache freshness (default: 7 days)
//! - `TILE_MOSAIC_USER_AGENT` - HTTP User-Agent

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::ConfigError;
use crate::io::{DiskCache, DEFAULT_USER_AGENT};
use crate::loader::{
    LoaderConfig, RetryPolicy, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DEFAULT_WORKERS,
};
use crate::projection::DEFAULT_TILE_SIZE;
use crate::source::{MbTilesSource, TemplateSource, TileSource, OSM_TILE_URL};
use crate::tile::DEFAULT_CACHE_CAPACITY;

// =============================================================================
// Default Values
// =============================================================================

/// Minimum time between viewport-driven resubmissions of a failed tile.
pub const DEFAULT_ERROR_RETRY_INTERVAL_SECS: u64 = 30;

/// How long a tile may be out of view before its pending job is cancelled.
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 1000;

/// Disk cache entries older than this are refetched (7 days).
pub const DEFAULT_DISK_MAX_AGE_SECS: u64 = 7 * 24 * 3600;

/// Default source identifier for the command-line tool.
pub const DEFAULT_SOURCE_ID: &str = "osm";

/// Default maximum zoom for template sources.
pub const DEFAULT_MAX_ZOOM: u8 = 19;

// =============================================================================
// Library Configuration
// =============================================================================

/// Settings for a [`TileController`](crate::controller::TileController).
#[derive(Debug, Clone, PartialEq)]
pub struct TileConfig {
    /// In-memory cache capacity in tiles
    pub cache_capacity: usize,

    pub loader: LoaderConfig,

    /// Failed tiles are resubmitted on viewport changes only after this long
    pub error_retry_interval: Duration,

    /// Pending jobs of tiles out of view for this long are cancelled
    pub cancel_grace: Duration,

    /// Disk cache directory; `None` disables the disk cache
    pub disk_cache_dir: Option<PathBuf>,

    pub disk_max_age: Duration,

    pub user_agent: String,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            loader: LoaderConfig::default(),
            error_retry_interval: Duration::from_secs(DEFAULT_ERROR_RETRY_INTERVAL_SECS),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            disk_cache_dir: None,
            disk_max_age: Duration::from_secs(DEFAULT_DISK_MAX_AGE_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl TileConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        self.loader.validate()?;
        if self.disk_cache_dir.is_some() && self.disk_max_age.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "disk cache max age",
            });
        }
        Ok(())
    }

    /// The disk cache described by this configuration, if enabled.
    pub fn disk_cache(&self) -> Option<DiskCache> {
        self.disk_cache_dir
            .as_ref()
            .map(|dir| DiskCache::new(dir.clone(), self.disk_max_age))
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// tile-mosaic - slippy-map tile fetching and caching.
#[derive(Parser, Debug, Clone)]
#[command(name = "tile-mosaic")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the tile containing a coordinate and that tile's bounds.
    Locate(LocateArgs),

    /// Fetch every tile of a viewport into the caches.
    Prefetch(PrefetchArgs),
}

/// Output format for command results.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct LocateArgs {
    /// Latitude in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub lat: f64,

    /// Longitude in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub lon: f64,

    /// Zoom level.
    #[arg(short, long)]
    pub zoom: u8,

    /// Tile size in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_size: u32,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct PrefetchArgs {
    /// Viewport center latitude in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub lat: f64,

    /// Viewport center longitude in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub lon: f64,

    /// Zoom level.
    #[arg(short, long)]
    pub zoom: u8,

    /// Viewport width in pixels.
    #[arg(long, default_value_t = 1024)]
    pub width: u32,

    /// Viewport height in pixels.
    #[arg(long, default_value_t = 768)]
    pub height: u32,

    // =========================================================================
    // Source
    // =========================================================================
    /// Tile URL template with {z}, {x}, {y}, {-y} and {s} placeholders.
    #[arg(long, default_value = OSM_TILE_URL, env = "TILE_MOSAIC_URL_TEMPLATE")]
    pub url_template: String,

    /// Identifier of the tile source.
    #[arg(long, default_value = DEFAULT_SOURCE_ID, env = "TILE_MOSAIC_SOURCE_ID")]
    pub source_id: String,

    /// Subdomains substituted for {s} (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub subdomains: Vec<String>,

    #[arg(long, default_value_t = 0)]
    pub min_zoom: u8,

    #[arg(long, default_value_t = DEFAULT_MAX_ZOOM)]
    pub max_zoom: u8,

    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_size: u32,

    /// Read tiles from a local MBTiles file instead of the URL template.
    #[arg(long, env = "TILE_MOSAIC_MBTILES")]
    pub mbtiles: Option<PathBuf>,

    /// The MBTiles file stores rows north-up (XYZ) instead of TMS.
    #[arg(long, requires = "mbtiles", default_value_t = false)]
    pub mbtiles_xyz: bool,

    // =========================================================================
    // Caching and fetching
    // =========================================================================
    /// Directory for the disk cache.
    #[arg(long, env = "TILE_MOSAIC_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Maximum number of decoded tiles kept in memory.
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY, env = "TILE_MOSAIC_CACHE_TILES")]
    pub cache_tiles: usize,

    /// Number of concurrent fetches.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "TILE_MOSAIC_WORKERS")]
    pub workers: usize,

    /// Automatic retries per tile after the first attempt.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "TILE_MOSAIC_MAX_RETRIES")]
    pub max_retries: u32,

    /// Per-attempt fetch timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_SECS, env = "TILE_MOSAIC_TIMEOUT_SECS")]
    pub timeout_secs: u64,

    /// Disk cache entries older than this many seconds are refetched.
    #[arg(long, default_value_t = DEFAULT_DISK_MAX_AGE_SECS, env = "TILE_MOSAIC_DISK_MAX_AGE_SECS")]
    pub disk_max_age_secs: u64,

    /// HTTP User-Agent header.
    #[arg(long, default_value = DEFAULT_USER_AGENT, env = "TILE_MOSAIC_USER_AGENT")]
    pub user_agent: String,

    /// Give up waiting for outstanding tiles after this many seconds.
    #[arg(long, default_value_t = 120)]
    pub wait_secs: u64,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl PrefetchArgs {
    /// Engine configuration described by these arguments.
    pub fn to_tile_config(&self) -> TileConfig {
        TileConfig {
            cache_capacity: self.cache_tiles,
            loader: LoaderConfig {
                workers: self.workers,
                fetch_timeout: Duration::from_secs(self.timeout_secs),
                retry: RetryPolicy::exponential(self.max_retries),
            },
            disk_cache_dir: self.cache_dir.clone(),
            disk_max_age: Duration::from_secs(self.disk_max_age_secs),
            user_agent: self.user_agent.clone(),
            ..TileConfig::default()
        }
    }

    /// Tile source described by these arguments.
    pub fn to_source(&self) -> Result<TemplateSource, ConfigError> {
        TemplateSource::builder(self.source_id.as_str(), self.url_template.as_str())
            .subdomains(self.subdomains.iter().cloned())
            .zoom_range(self.min_zoom, self.max_zoom)
            .tile_size(self.tile_size)
            .build()
    }

    /// The MBTiles file when one is given, the URL template otherwise.
    pub async fn open_source(&self) -> Result<Arc<dyn TileSource>, ConfigError> {
        match &self.mbtiles {
            Some(path) => {
                let source =
                    MbTilesSource::open(self.source_id.as_str(), path, !self.mbtiles_xyz).await?;
                Ok(Arc::new(source))
            }
            None => Ok(Arc::new(self.to_source()?)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
