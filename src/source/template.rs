use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use super::{Attribution, NoTilePolicy, TileSource};
use crate::error::ConfigError;
use crate::io::FetchResponse;
use crate::projection::{tiles_per_axis, TileId, DEFAULT_TILE_SIZE};

/// Standard OpenStreetMap tile server.
pub const OSM_TILE_URL: &str = "https://tile.openstreetmap.org/{z}/{x}/{y}.png";

/// Tile source that expands a URL template.
///
/// Placeholders:
/// - `{z}`, `{x}`, `{y}`: zoom, column and row
/// - `{-y}`: TMS row, counted from the south edge
/// - `{s}`: one of the configured subdomains, picked from the tile position
///
/// # Example
///
/// ```
/// use tile_mosaic::projection::TileId;
/// use tile_mosaic::source::{TemplateSource, TileSource};
///
/// let source = TemplateSource::builder("topo", "https://{s}.tiles.test/{z}/{x}/{-y}.png")
///     .subdomains(["a", "b", "c"])
///     .zoom_range(0, 17)
///     .build()
///     .unwrap();
///
/// let id = TileId::new("topo", 3, 4, 2).unwrap();
/// assert_eq!(source.url_for(&id), "https://a.tiles.test/3/4/5.png");
/// ```
#[derive(Debug, Clone)]
pub struct TemplateSource {
    source_id: Arc<str>,
    name: String,
    template: String,
    subdomains: Vec<String>,
    tile_size: u32,
    min_zoom: u8,
    max_zoom: u8,
    attribution: Option<Attribution>,
    no_tile: NoTilePolicy,
    /// (lowercased header name, metadata key)
    metadata_headers: Vec<(String, String)>,
}

impl TemplateSource {
    pub fn builder(source_id: impl Into<Arc<str>>, template: impl Into<String>) -> TemplateSourceBuilder {
        let source_id = source_id.into();
        TemplateSourceBuilder {
            name: source_id.to_string(),
            source_id,
            template: template.into(),
            subdomains: Vec::new(),
            tile_size: DEFAULT_TILE_SIZE,
            min_zoom: 0,
            max_zoom: 19,
            attribution: None,
            no_tile: NoTilePolicy::default(),
            metadata_headers: Vec::new(),
        }
    }

    /// The OpenStreetMap standard layer.
    pub fn openstreetmap() -> Result<Self, ConfigError> {
        Self::builder("osm", OSM_TILE_URL)
            .name("OpenStreetMap")
            .zoom_range(0, 19)
            .attribution(
                Attribution::new("© OpenStreetMap contributors")
                    .with_link("https://www.openstreetmap.org/copyright"),
            )
            .build()
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn expand(&self, zoom: u8, column: u32, row: u32) -> String {
        let tms_row = tiles_per_axis(zoom) - 1 - row;
        let mut url = self
            .template
            .replace("{z}", &zoom.to_string())
            .replace("{x}", &column.to_string())
            .replace("{-y}", &tms_row.to_string())
            .replace("{y}", &row.to_string());

        if !self.subdomains.is_empty() {
            let index = (column as usize + row as usize) % self.subdomains.len();
            url = url.replace("{s}", &self.subdomains[index]);
        }
        url
    }
}

impl TileSource for TemplateSource {
    fn source_id(&self) -> &Arc<str> {
        &self.source_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn url_for(&self, id: &TileId) -> String {
        self.expand(id.zoom(), id.column(), id.row())
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
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

    fn is_no_tile(&self, response: &FetchResponse) -> bool {
        self.no_tile.matches(response)
    }

    fn tile_metadata(&self, response: &FetchResponse) -> HashMap<String, String> {
        self.metadata_headers
            .iter()
            .filter_map(|(header, key)| {
                response
                    .header(header)
                    .map(|value| (key.clone(), value.trim().to_string()))
            })
            .collect()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TemplateSource`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct TemplateSourceBuilder {
    source_id: Arc<str>,
    name: String,
    template: String,
    subdomains: Vec<String>,
    tile_size: u32,
    min_zoom: u8,
    max_zoom: u8,
    attribution: Option<Attribution>,
    no_tile: NoTilePolicy,
    /// (lowercased header name, metadata key)
    metadata_headers: Vec<(String, String)>,
}

impl TemplateSourceBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn subdomains<I, S>(mut self, subdomains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdomains = subdomains.into_iter().map(Into::into).collect();
        self
    }

    pub fn tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    pub fn attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = Some(attribution);
        self
    }

    pub fn no_tile(mut self, policy: NoTilePolicy) -> Self {
        self.no_tile = policy;
        self
    }

    /// Copy response header `header` into tile metadata under `key`.
    pub fn metadata_header(mut self, header: &str, key: impl Into<String>) -> Self {
        self.metadata_headers
            .push((header.to_ascii_lowercase(), key.into()));
        self
    }

    /// Validate and build the source.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidZoomBounds`] for inverted or out-of-range zooms
    /// - [`ConfigError::InvalidTileSize`] for a zero tile size
    /// - [`ConfigError::InvalidUrlTemplate`] when the template lacks a
    ///   coordinate placeholder, uses `{s}` without subdomains, contains an
    ///   unknown placeholder or does not expand to an absolute URL
    pub fn build(self) -> Result<TemplateSource, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrlTemplate {
            template: self.template.clone(),
            reason: reason.to_string(),
        };

        for required in ["{z}", "{x}"] {
            if !self.template.contains(required) {
                return Err(invalid(&format!("missing {required} placeholder")));
            }
        }
        if !self.template.contains("{y}") && !self.template.contains("{-y}") {
            return Err(invalid("missing {y} or {-y} placeholder"));
        }
        if self.template.contains("{s}") && self.subdomains.is_empty() {
            return Err(invalid("{s} placeholder requires subdomains"));
        }

        let source = TemplateSource {
            source_id: self.source_id.clone(),
            name: self.name.clone(),
            template: self.template.clone(),
            subdomains: self.subdomains.clone(),
            tile_size: self.tile_size,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            attribution: self.attribution.clone(),
            no_tile: self.no_tile.clone(),
            metadata_headers: self.metadata_headers.clone(),
        };
        source.validate()?;

        let sample = source.expand(source.min_zoom, 0, 0);
        if sample.contains('{') || sample.contains('}') {
            return Err(invalid("unknown placeholder"));
        }
        let url = Url::parse(&sample).map_err(|e| invalid(&e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(invalid("not a hierarchical URL"));
        }

        Ok(source)
    }
}
