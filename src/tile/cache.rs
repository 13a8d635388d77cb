//! In-memory tile cache.
//!
//! This module provides the bounded LRU store that is the single source of
//! truth for "do we already have this tile". It is shared between the
//! controller (readers, invalidation) and the loader's workers (writers).
//!
//! # Capacity
//!
//! Capacity is a tile count fixed at construction. When a new key is inserted
//! into a full cache the least-recently-used entry is removed first, so the
//! cache never holds more than `capacity` entries, not even transiently.
//!
//! # Atomicity
//!
//! Every operation runs under one `parking_lot` mutex. Critical sections are
//! short map operations with no I/O or decoding, so the render thread can call
//! into the cache without stalling behind a worker.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use super::state::Tile;
use crate::error::ConfigError;
use crate::projection::TileId;

/// Default cache capacity in tiles.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room, not counting invalidations
    pub evictions: u64,
    /// Entries currently held
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 when there were none.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

/// Bounded LRU map from [`TileId`] to [`Tile`].
///
/// # Example
///
/// ```
/// use tile_mosaic::projection::TileId;
/// use tile_mosaic::tile::{Tile, TileCache};
///
/// let cache = TileCache::new(2).unwrap();
/// let a = TileId::new("osm", 1, 0, 0).unwrap();
/// let b = TileId::new("osm", 1, 1, 0).unwrap();
/// let c = TileId::new("osm", 1, 0, 1).unwrap();
///
/// cache.put(a.clone(), Tile::loading(a.clone()));
/// cache.put(b.clone(), Tile::loading(b.clone()));
///
/// // Touch `a` so `b` becomes least recently used
/// assert!(cache.get(&a).is_some());
///
/// let evicted = cache.put(c.clone(), Tile::loading(c.clone()));
/// assert_eq!(evicted.map(|t| t.id), Some(b));
/// assert_eq!(cache.len(), 2);
/// ```
pub struct TileCache {
    entries: Mutex<LruCache<TileId, Tile>>,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TileCache {
    /// Create a cache holding at most `capacity` tiles.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroCapacity`] when `capacity` is 0.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroCapacity)?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up a tile, marking it most recently used.
    pub fn get(&self, id: &TileId) -> Option<Tile> {
        let tile = self.entries.lock().get(id).cloned();
        match tile {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        tile
    }

    /// Look up a tile without touching recency or statistics.
    pub fn peek(&self, id: &TileId) -> Option<Tile> {
        self.entries.lock().peek(id).cloned()
    }

    pub fn contains(&self, id: &TileId) -> bool {
        self.entries.lock().contains(id)
    }

    /// Insert or replace a tile.
    ///
    /// When `id` is new and the cache is full, the least-recently-used entry is
    /// removed before the insert and returned.
    pub fn put(&self, id: TileId, tile: Tile) -> Option<Tile> {
        let mut entries = self.entries.lock();
        let evicted = self.make_room(&mut entries, &id);
        entries.put(id, tile);
        evicted
    }

    /// Modify an existing entry in place without changing its recency.
    ///
    /// Returns `false` when the tile is not cached.
    pub fn update<F>(&self, id: &TileId, f: F) -> bool
    where
        F: FnOnce(&mut Tile),
    {
        match self.entries.lock().peek_mut(id) {
            Some(tile) => {
                f(tile);
                true
            }
            None => false,
        }
    }

    /// Modify the entry for `id`, inserting `default()` first if absent.
    ///
    /// The whole operation is atomic. A fresh insert is most recently used and
    /// may evict; the evicted entry is returned.
    pub fn upsert<D, F>(&self, id: &TileId, default: D, f: F) -> Option<Tile>
    where
        D: FnOnce() -> Tile,
        F: FnOnce(&mut Tile),
    {
        let mut entries = self.entries.lock();
        if let Some(tile) = entries.peek_mut(id) {
            f(tile);
            return None;
        }

        let evicted = self.make_room(&mut entries, id);
        let mut tile = default();
        f(&mut tile);
        entries.put(id.clone(), tile);
        evicted
    }

    /// Remove one tile. In-flight fetches for it are unaffected.
    pub fn invalidate(&self, id: &TileId) -> Option<Tile> {
        self.entries.lock().pop(id)
    }

    /// Remove one tile if `predicate` holds for it.
    pub fn remove_if<P>(&self, id: &TileId, predicate: P) -> Option<Tile>
    where
        P: FnOnce(&Tile) -> bool,
    {
        let mut entries = self.entries.lock();
        if entries.peek(id).is_some_and(predicate) {
            entries.pop(id)
        } else {
            None
        }
    }

    /// Remove every tile matching `predicate`, returning how many were removed.
    pub fn invalidate_region<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&TileId, &Tile) -> bool,
    {
        let mut entries = self.entries.lock();
        let doomed: Vec<TileId> = entries
            .iter()
            .filter(|(id, tile)| predicate(id, tile))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            entries.pop(id);
        }
        doomed.len()
    }

    /// Remove every tile belonging to `source_id`.
    pub fn invalidate_source(&self, source_id: &str) -> usize {
        self.invalidate_region(|id, _| id.source_id() == source_id)
    }

    /// Remove all tiles. Statistics are kept.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity(),
        }
    }

    fn make_room(&self, entries: &mut LruCache<TileId, Tile>, incoming: &TileId) -> Option<Tile> {
        if entries.contains(incoming) || entries.len() < self.capacity.get() {
            return None;
        }

        let (id, tile) = entries.pop_lru()?;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(tile = %id, "evicted least recently used tile");
        Some(tile)
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
