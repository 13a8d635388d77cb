//! Cache effectiveness integration tests.
//!
//! Tests verify:
//! - Revisiting a viewport is served from memory
//! - Capacity bounds memory under panning
//! - Concurrent readers and writers keep the cache consistent

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tokio::runtime::Handle;

use tile_mosaic::controller::{NoopListener, TileController};
use tile_mosaic::projection::{TileId, Viewport};
use tile_mosaic::tile::{Tile, TileCache};

use super::test_utils::{drive_until_reported, test_config, test_source, MockFetcher};

// =============================================================================
// Tile Cache Effectiveness
// =============================================================================

#[tokio::test]
async fn test_revisited_viewport_served_from_memory() {
    let fetcher = Arc::new(MockFetcher::new());
    let mut controller = TileController::new(
        test_config(4),
        test_source("osm"),
        fetcher.clone(),
        NoopListener,
        Handle::current(),
    )
    .unwrap();

    let viewport = Viewport::new(52.52, 13.405, 11, 800, 600);
    let first = controller.on_viewport_changed(viewport);
    assert!(first.hits.is_empty());
    assert_eq!(first.requested, first.visible.len());
    drive_until_reported(&mut controller, first.requested).await;

    let fetched = fetcher.call_count();
    assert_eq!(fetched, first.visible.len());

    let second = controller.on_viewport_changed(viewport);
    assert_eq!(second.requested, 0);
    assert_eq!(second.hits.len(), second.visible.len());
    assert_eq!(fetcher.call_count(), fetched);

    let stats = controller.cache_stats();
    assert!(stats.hits >= second.visible.len() as u64);
    assert!(stats.hit_rate() > 0.0);
}

#[tokio::test]
async fn test_capacity_bounds_memory_while_panning() {
    let fetcher = Arc::new(MockFetcher::new());
    let mut config = test_config(4);
    config.cache_capacity = 12;
    let mut controller = TileController::new(
        config,
        test_source("osm"),
        fetcher,
        NoopListener,
        Handle::current(),
    )
    .unwrap();

    for step in 0..6 {
        let lon = -120.0 + f64::from(step) * 40.0;
        let update = controller.on_viewport_changed(Viewport::new(40.0, lon, 6, 512, 512));
        drive_until_reported(&mut controller, update.requested).await;
        assert!(controller.cache().len() <= 12);
    }

    let stats = controller.cache_stats();
    assert_eq!(stats.capacity, 12);
    assert!(stats.evictions > 0);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_share_cache() {
    let cache = Arc::new(TileCache::new(64).unwrap());
    let image = Arc::new(DynamicImage::new_rgba8(4, 4));

    let mut tasks = Vec::new();
    for task in 0..8u32 {
        let cache = Arc::clone(&cache);
        let image = Arc::clone(&image);
        tasks.push(tokio::spawn(async move {
            for i in 0..50u32 {
                let id = TileId::new("osm", 8, (task * 50 + i) % 100, 7).unwrap();
                cache.put(id.clone(), Tile::loaded(id.clone(), Arc::clone(&image), None));
                cache.get(&id);
                if i % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(cache.len(), 64);
    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, 400);
    assert_eq!(stats.len, 64);
}
