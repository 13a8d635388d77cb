use thiserror::Error;

/// Configuration errors, fatal at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Cache capacity must hold at least one tile
    #[error("cache capacity must be greater than 0")]
    ZeroCapacity,

    /// The loader needs at least one worker
    #[error("worker count must be greater than 0")]
    ZeroWorkers,

    /// Zoom bounds are inverted or exceed the supported range
    #[error("invalid zoom bounds: min {min}, max {max} (supported range 0-{limit})")]
    InvalidZoomBounds { min: u8, max: u8, limit: u8 },

    /// Tile size must be a non-zero pixel count
    #[error("invalid tile size: {0}px")]
    InvalidTileSize(u32),

    /// URL template cannot produce a valid URL
    #[error("invalid URL template '{template}': {reason}")]
    InvalidUrlTemplate { template: String, reason: String },

    /// A timeout or interval that must be non-zero was zero
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    /// HTTP client could not be built
    #[error("failed to create HTTP client: {0}")]
    HttpClient(String),

    /// An MBTiles file could not be opened or has no usable tiles
    #[error("invalid MBTiles file: {0}")]
    MbTiles(String),
}

/// Errors produced while fetching and decoding a single tile.
///
/// Network, timeout and decode failures are retried by the loader; a corrupt
/// response may be transient. `NotFound` is permanent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Connection failure or non-success HTTP status
    #[error("network error: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// The fetch did not finish within the configured timeout
    #[error("fetch timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The response body is not a decodable raster image
    #[error("failed to decode tile image: {0}")]
    Decode(String),

    /// The server has no tile for this id (404, 410 or a no-tile marker)
    #[error("tile not available: {0}")]
    NotFound(String),

    /// A local tile store failed to answer
    #[error("tile store error: {0}")]
    Storage(String),
}

impl FetchError {
    /// Whether the loader should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::NotFound(_))
    }
}

/// Errors from the on-disk tile cache.
///
/// These never fail a fetch: a broken disk cache degrades to network-only.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    /// Filesystem error
    #[error("disk cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sidecar metadata could not be parsed or written
    #[error("disk cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}
