//! Tile entries and the shared in-memory cache.
//!
//! # Components
//!
//! - [`Tile`]: a cached entry with its image, lifecycle state and retry bookkeeping
//! - [`TileState`]: `Loading`, `Loaded`, `Error` or `Expired`
//! - [`TileCache`]: bounded LRU store shared by the controller and the loader
//! - [`decode_image`]: raster decode used by the loader's workers

mod cache;
mod state;

pub use cache::{CacheStats, TileCache, DEFAULT_CACHE_CAPACITY};
pub use state::{decode_image, Tile, TileState};
