//! Tile retrieval: the fetcher seam, the HTTP implementation and the
//! on-disk cache.

mod disk_cache;
mod fetcher;
mod http;

pub use disk_cache::DiskCache;
pub use fetcher::{parse_max_age, FetchResponse, TileFetcher};
pub use http::{HttpFetcher, DEFAULT_USER_AGENT, IMAGE_ACCEPT};
