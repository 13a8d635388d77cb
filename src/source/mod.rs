//! Remote tile providers.
//!
//! A [`TileSource`] turns a [`TileId`] into the URL to fetch and describes the
//! provider's static bounds. Switching map style means swapping the source
//! instance; the controller then invalidates every tile keyed to the old
//! source id.
//!
//! # Components
//!
//! - [`TileSource`]: the provider trait
//! - [`TemplateSource`]: URL-template provider (`{z}`, `{x}`, `{y}`, `{-y}`, `{s}`)
//! - [`MbTilesSource`]: local SQLite tileset with its own retrieval path
//! - [`NoTilePolicy`]: recognizes "no tile here" responses
//! - [`Attribution`]: credit text shown by the render layer

mod mbtiles;
mod template;

pub use mbtiles::{MbTilesFetcher, MbTilesSource, TileFormat, TilesetType};
pub use template::{TemplateSource, TemplateSourceBuilder, OSM_TILE_URL};

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::io::{FetchResponse, TileFetcher};
use crate::projection::{TileId, MAX_ZOOM};

// =============================================================================
// TileSource Trait
// =============================================================================

/// A remote tile provider.
///
/// Implementations are shared between the controller and every loader worker,
/// so they must be thread-safe. `url_for` must be deterministic per tile.
pub trait TileSource: Send + Sync {
    /// Identifier stored in every [`TileId`] of this source.
    fn source_id(&self) -> &Arc<str>;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// URL of the tile's raster payload.
    fn url_for(&self, id: &TileId) -> String;

    /// Tile edge length in pixels.
    fn tile_size(&self) -> u32;

    fn min_zoom(&self) -> u8;

    fn max_zoom(&self) -> u8;

    fn attribution(&self) -> Option<&Attribution> {
        None
    }

    /// Whether a successful response actually means "no tile at this position".
    fn is_no_tile(&self, _response: &FetchResponse) -> bool {
        false
    }

    /// Tile metadata carried by a response, keyed by metadata name.
    fn tile_metadata(&self, _response: &FetchResponse) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Retrieval path of this source. `None` uses the loader's fetcher.
    fn fetcher(&self) -> Option<Arc<dyn TileFetcher>> {
        None
    }

    /// Overrides the loader's retry count for this source's tiles.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Whether fetched tiles go through the on-disk cache.
    fn uses_disk_cache(&self) -> bool {
        true
    }

    /// Check the static bounds.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_zoom() > self.max_zoom() || self.max_zoom() > MAX_ZOOM {
            return Err(ConfigError::InvalidZoomBounds {
                min: self.min_zoom(),
                max: self.max_zoom(),
                limit: MAX_ZOOM,
            });
        }
        if self.tile_size() == 0 {
            return Err(ConfigError::InvalidTileSize(0));
        }
        Ok(())
    }
}

// =============================================================================
// Attribution
// =============================================================================

/// Credit a provider requires to be displayed with its tiles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub text: String,
    pub link: Option<String>,
    pub terms_of_use: Option<String>,
}

impl Attribution {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_terms_of_use(mut self, terms: impl Into<String>) -> Self {
        self.terms_of_use = Some(terms.into());
        self
    }
}

// =============================================================================
// No-tile detection
// =============================================================================

/// Rules recognizing placeholder responses that stand for "no tile here".
///
/// Some providers answer requests outside their coverage with HTTP 200 and a
/// blank image, flagged either by a response header or by a well-known body.
/// Header values compare case-insensitively; checksums are SHA-256 hex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoTilePolicy {
    headers: Vec<(String, String)>,
    checksums: Vec<String>,
}

impl NoTilePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat responses carrying `name: value` as missing tiles.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    /// Treat bodies with this SHA-256 digest (hex) as missing tiles.
    pub fn with_sha256(mut self, hex_digest: &str) -> Self {
        self.checksums.push(hex_digest.to_ascii_lowercase());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.checksums.is_empty()
    }

    pub fn matches(&self, response: &FetchResponse) -> bool {
        let header_match = self.headers.iter().any(|(name, value)| {
            response
                .header(name)
                .is_some_and(|actual| actual.trim().eq_ignore_ascii_case(value))
        });
        if header_match {
            return true;
        }

        if self.checksums.is_empty() {
            return false;
        }
        let digest = hex::encode(Sha256::digest(&response.body));
        self.checksums.iter().any(|known| *known == digest)
    }
}
