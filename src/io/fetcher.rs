use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FetchError;

/// Raw result of one successful tile retrieval.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub body: Bytes,

    /// Response headers, names lowercased
    pub headers: HashMap<String, String>,

    /// Server-declared expiry derived from `Cache-Control: max-age`
    pub expires_at: Option<SystemTime>,
}

impl FetchResponse {
    /// A response with only a body, as read from a local store.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Retrieves the bytes behind a tile URL.
///
/// This abstraction keeps the loader independent of the transport; the
/// production implementation is [`HttpFetcher`](super::HttpFetcher) and tests
/// substitute scripted fetchers. Implementations must be thread-safe since
/// every loader worker shares one instance.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    /// Fetch the resource at `url`.
    ///
    /// Missing resources are reported as [`FetchError::NotFound`] so the loader
    /// does not retry them.
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// Parse the `max-age` directive of a `Cache-Control` value.
///
/// Malformed values are ignored.
pub fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|seconds| seconds.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
