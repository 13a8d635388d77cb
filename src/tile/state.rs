//! Cached tile entries and raster decoding.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use image::{DynamicImage, ImageReader};

use crate::error::FetchError;
use crate::projection::TileId;

/// Lifecycle state of a cached tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// A fetch job has been accepted and has not settled yet
    Loading,
    /// The image is attached and current
    Loaded,
    /// The last fetch failed; the tile may still carry an older image
    Error,
    /// The image is attached but past its server-declared expiry
    Expired,
}

impl TileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileState::Loading => "loading",
            TileState::Loaded => "loaded",
            TileState::Error => "error",
            TileState::Expired => "expired",
        }
    }
}

// =============================================================================
// Tile
// =============================================================================

/// One entry of the tile cache.
///
/// The loader builds candidate tiles and hands them to the cache, which owns
/// them from then on. Readers get clones; the image itself is shared.
#[derive(Debug, Clone)]
pub struct Tile {
    pub id: TileId,

    /// Decoded raster, absent until the first successful load
    pub image: Option<Arc<DynamicImage>>,

    pub state: TileState,

    /// Wall-clock time of the last successful load
    pub loaded_at: Option<SystemTime>,

    /// Failed attempts since the last success
    pub error_count: u32,

    /// Start of the most recent fetch attempt
    pub last_attempt: Option<Instant>,

    /// Server-declared expiry, from `Cache-Control: max-age`
    pub expires_at: Option<SystemTime>,

    pub last_error: Option<FetchError>,

    /// Provider metadata lifted from response headers, e.g. `capture-date`
    pub metadata: HashMap<String, String>,
}

impl Tile {
    /// A tile whose first fetch has just been accepted.
    pub fn loading(id: TileId) -> Self {
        Self {
            id,
            image: None,
            state: TileState::Loading,
            loaded_at: None,
            error_count: 0,
            last_attempt: Some(Instant::now()),
            expires_at: None,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    /// A freshly loaded tile.
    pub fn loaded(id: TileId, image: Arc<DynamicImage>, expires_at: Option<SystemTime>) -> Self {
        Self {
            id,
            image: Some(image),
            state: TileState::Loaded,
            loaded_at: Some(SystemTime::now()),
            error_count: 0,
            last_attempt: Some(Instant::now()),
            expires_at,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Move back to `Loading` for a new attempt, keeping any stale image.
    pub fn mark_loading(&mut self) {
        self.state = TileState::Loading;
        self.last_attempt = Some(Instant::now());
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, error: FetchError) {
        self.state = TileState::Error;
        self.error_count += 1;
        self.last_attempt = Some(Instant::now());
        self.last_error = Some(error);
    }

    /// Whether the server-declared expiry has passed at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Whether the tile holds a current image.
    pub fn is_loaded(&self) -> bool {
        self.state == TileState::Loaded && self.image.is_some()
    }

    /// Time since the last attempt started, if there was one.
    pub fn since_last_attempt(&self) -> Option<std::time::Duration> {
        self.last_attempt.map(|at| at.elapsed())
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a raster payload (PNG or JPEG), sniffing the format from its bytes.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage, FetchError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| FetchError::Decode(e.to_string()))?;

    if reader.format().is_none() {
        return Err(FetchError::Decode("unrecognized image format".to_string()));
    }

    reader.decode().map_err(|e| FetchError::Decode(e.to_string()))
}
