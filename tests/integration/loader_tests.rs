//! Loader integration tests.
//!
//! Tests verify:
//! - Concurrent requests for one tile cause a single fetch
//! - Jobs are served by priority, FIFO among equals
//! - Retries stop after `max_retries + 1` attempts; missing tiles are not retried
//! - Timeouts count as retryable failures
//! - The disk cache is read through and bypassed on forced refresh
//! - Cancellation and source swaps drop work that is no longer wanted
//! - Dropping the last loader handle stops the workers

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Barrier, Semaphore};

use tile_mosaic::error::FetchError;
use tile_mosaic::io::DiskCache;
use tile_mosaic::loader::{
    LoadOutcome, LoaderConfig, LoaderEvent, Priority, SubmitOutcome, TileLoader,
};
use tile_mosaic::projection::TileId;
use tile_mosaic::source::{MbTilesSource, NoTilePolicy, TemplateSource};
use tile_mosaic::tile::{Tile, TileCache, TileState};

use super::test_utils::{
    fast_retry, png_tile, test_source, wait_until, write_mbtiles, MockFetcher, MockMode,
    WAIT_LIMIT,
};

fn tile(zoom: u8, column: u32, row: u32) -> TileId {
    TileId::new("osm", zoom, column, row).unwrap()
}

fn start_loader(
    fetcher: Arc<MockFetcher>,
    workers: usize,
    max_retries: u32,
    disk: Option<DiskCache>,
) -> (TileLoader, UnboundedReceiver<LoaderEvent>, Arc<TileCache>) {
    let cache = Arc::new(TileCache::new(64).unwrap());
    let config = LoaderConfig {
        workers,
        fetch_timeout: Duration::from_secs(5),
        retry: fast_retry(max_retries),
    };
    let (loader, events) = TileLoader::new(
        config,
        test_source("osm"),
        fetcher,
        Arc::clone(&cache),
        disk,
        Handle::current(),
    )
    .unwrap();
    (loader, events, cache)
}

async fn next_event(events: &mut UnboundedReceiver<LoaderEvent>) -> LoaderEvent {
    tokio::time::timeout(WAIT_LIMIT, events.recv())
        .await
        .expect("event in time")
        .expect("loader alive")
}

// =============================================================================
// Deduplication and Ordering
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_fetch_once() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(Arc::clone(&gate)));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 4, 0, None);

    let id = tile(10, 550, 335);
    let start = Arc::new(Barrier::new(16));
    let submits: Vec<_> = (0..16u32)
        .map(|i| {
            let loader = loader.clone();
            let id = id.clone();
            let start = Arc::clone(&start);
            tokio::spawn(async move {
                start.wait().await;
                loader.submit(id, Priority(i))
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for submit in submits {
        outcomes.push(submit.await.unwrap());
    }
    let enqueued = outcomes
        .iter()
        .filter(|o| **o == SubmitOutcome::Enqueued)
        .count();
    let coalesced = outcomes
        .iter()
        .filter(|o| **o == SubmitOutcome::Coalesced)
        .count();
    assert_eq!((enqueued, coalesced), (1, 15));
    assert_eq!(cache.peek(&id).unwrap().state, TileState::Loading);

    gate.add_permits(16);
    let event = next_event(&mut events).await;
    assert_eq!(event.id, id);
    assert_eq!(event.outcome, LoadOutcome::Loaded);

    // No second job appears for the coalesced requests
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(fetcher.call_count(), 1);
    assert!(cache.peek(&id).unwrap().is_loaded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_settled_tile_is_never_left_loading() {
    let fetcher = Arc::new(MockFetcher::new());
    let (loader, mut events, cache) = start_loader(fetcher, 4, 0, None);

    for column in 0..200 {
        let id = tile(10, column, 7);
        assert_eq!(loader.submit(id.clone(), Priority(1)), SubmitOutcome::Enqueued);
        let event = next_event(&mut events).await;
        assert_eq!(event.id, id);
        assert_eq!(cache.peek(&id).unwrap().state, TileState::Loaded);
    }
}

#[tokio::test]
async fn test_higher_priority_served_first() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(Arc::clone(&gate)));
    let (loader, mut events, _cache) = start_loader(Arc::clone(&fetcher), 1, 0, None);

    // Occupies the only worker
    let blocker = tile(5, 0, 0);
    loader.submit(blocker, Priority::HIGHEST);
    wait_until(|| loader.in_flight_count() == 1).await;

    loader.submit(tile(5, 1, 0), Priority(1));
    loader.submit(tile(5, 2, 0), Priority(5));
    loader.submit(tile(5, 3, 0), Priority(5));
    // Raising a pending job's priority reorders it
    loader.submit(tile(5, 4, 0), Priority(2));
    assert_eq!(
        loader.submit(tile(5, 4, 0), Priority(9)),
        SubmitOutcome::Coalesced
    );

    gate.add_permits(5);
    for _ in 0..5 {
        next_event(&mut events).await;
    }

    let columns: Vec<String> = fetcher
        .urls()
        .iter()
        .map(|url| url.rsplit('/').nth(1).unwrap_or_default().to_string())
        .collect();
    assert_eq!(columns, vec!["0", "4", "2", "3", "1"]);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_retries_exhausted_after_max_plus_one_attempts() {
    let fetcher = Arc::new(MockFetcher::new().with_mode(MockMode::Unavailable));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 2, 2, None);

    let id = tile(8, 136, 84);
    loader.submit(id.clone(), Priority(1));

    let event = next_event(&mut events).await;
    match event.outcome {
        LoadOutcome::Failed { error, attempts } => {
            assert_eq!(attempts, 3);
            assert!(error.is_retryable());
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(fetcher.call_count(), 3);
    let cached = cache.peek(&id).unwrap();
    assert_eq!(cached.state, TileState::Error);
    assert_eq!(cached.error_count, 3);
    assert!(cached.image.is_none());
    assert!(!loader.has_outstanding_jobs());
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let fetcher = Arc::new(MockFetcher::new().failing_first(2));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 1, 3, None);

    let id = tile(8, 136, 84);
    loader.submit(id.clone(), Priority(1));

    let event = next_event(&mut events).await;
    assert_eq!(event.outcome, LoadOutcome::Loaded);
    assert_eq!(fetcher.call_count(), 3);
    assert!(cache.peek(&id).unwrap().is_loaded());
}

#[tokio::test]
async fn test_fetch_timeout_is_retried_then_reported() {
    // A gate without permits holds every fetch until the timeout fires
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(gate));
    let cache = Arc::new(TileCache::new(16).unwrap());
    let (loader, mut events) = TileLoader::new(
        LoaderConfig {
            workers: 1,
            fetch_timeout: Duration::from_millis(50),
            retry: fast_retry(1),
        },
        test_source("osm"),
        fetcher.clone(),
        Arc::clone(&cache),
        None,
        Handle::current(),
    )
    .unwrap();

    let id = tile(7, 68, 42);
    loader.submit(id.clone(), Priority(1));

    let event = next_event(&mut events).await;
    assert_eq!(
        event.outcome,
        LoadOutcome::Failed {
            error: FetchError::Timeout { millis: 50 },
            attempts: 2
        }
    );
    assert_eq!(fetcher.call_count(), 2);
    assert_eq!(cache.peek(&id).unwrap().error_count, 2);
}

#[tokio::test]
async fn test_missing_tile_not_retried() {
    let fetcher = Arc::new(MockFetcher::new().with_mode(MockMode::NotFound));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 1, 3, None);

    let id = tile(8, 136, 84);
    loader.submit(id.clone(), Priority(1));

    let event = next_event(&mut events).await;
    assert!(matches!(
        event.outcome,
        LoadOutcome::Failed {
            error: FetchError::NotFound(_),
            attempts: 1
        }
    ));
    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(cache.peek(&id).unwrap().state, TileState::Error);
}

#[tokio::test]
async fn test_no_tile_marker_treated_as_missing() {
    let fetcher = Arc::new(MockFetcher::new().with_header("X-VE-Tile-Info", "no-tile"));
    let cache = Arc::new(TileCache::new(16).unwrap());
    let source = Arc::new(
        TemplateSource::builder("osm", "https://osm.tiles.test/{z}/{x}/{y}.png")
            .no_tile(NoTilePolicy::new().with_header("X-VE-Tile-Info", "no-tile"))
            .build()
            .unwrap(),
    );
    let (loader, mut events) = TileLoader::new(
        LoaderConfig {
            retry: fast_retry(3),
            ..LoaderConfig::default()
        },
        source,
        fetcher.clone(),
        cache,
        None,
        Handle::current(),
    )
    .unwrap();

    loader.submit(tile(4, 8, 5), Priority(1));
    let event = next_event(&mut events).await;
    assert!(matches!(
        event.outcome,
        LoadOutcome::Failed {
            error: FetchError::NotFound(_),
            ..
        }
    ));
    assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test]
async fn test_undecodable_body_fails() {
    let fetcher = Arc::new(MockFetcher::new().with_body(&b"<html>oops</html>"[..]));
    let (loader, mut events, _cache) = start_loader(Arc::clone(&fetcher), 1, 0, None);

    loader.submit(tile(4, 8, 5), Priority(1));
    let event = next_event(&mut events).await;
    assert!(matches!(
        event.outcome,
        LoadOutcome::Failed {
            error: FetchError::Decode(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_completion_after_placeholder_eviction_is_cached() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(Arc::clone(&gate)));
    let cache = Arc::new(TileCache::new(1).unwrap());
    let (loader, mut events) = TileLoader::new(
        LoaderConfig {
            workers: 1,
            fetch_timeout: Duration::from_secs(5),
            retry: fast_retry(0),
        },
        test_source("osm"),
        fetcher,
        Arc::clone(&cache),
        None,
        Handle::current(),
    )
    .unwrap();

    let id = tile(5, 16, 10);
    loader.submit(id.clone(), Priority(1));
    wait_until(|| loader.in_flight_count() == 1).await;

    // Another tile pushes the placeholder out of the one-slot cache
    let other = tile(5, 17, 10);
    let image = Arc::new(DynamicImage::new_rgba8(2, 2));
    cache.put(other.clone(), Tile::loaded(other.clone(), image, None));
    assert!(cache.peek(&id).is_none());

    gate.add_permits(1);
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);
    assert!(cache.peek(&id).unwrap().is_loaded());
    assert!(cache.peek(&other).is_none());
}

#[tokio::test]
async fn test_metadata_headers_copied_to_tile() {
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_header("X-VE-TILEMETA-CaptureDatesRange", "2019-2021")
            .with_header("X-VE-Tile-Info", "ok"),
    );
    let cache = Arc::new(TileCache::new(16).unwrap());
    let source = Arc::new(
        TemplateSource::builder("osm", "https://osm.tiles.test/{z}/{x}/{y}.png")
            .metadata_header("X-VE-TILEMETA-CaptureDatesRange", "capture-date")
            .build()
            .unwrap(),
    );
    let (loader, mut events) = TileLoader::new(
        LoaderConfig::default(),
        source,
        fetcher,
        Arc::clone(&cache),
        None,
        Handle::current(),
    )
    .unwrap();

    let id = tile(4, 8, 5);
    loader.submit(id.clone(), Priority(1));
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);

    let cached = cache.peek(&id).unwrap();
    assert_eq!(
        cached.metadata.get("capture-date").map(String::as_str),
        Some("2019-2021")
    );
    assert_eq!(cached.metadata.len(), 1);
}

// =============================================================================
// Disk Cache
// =============================================================================

#[tokio::test]
async fn test_disk_cache_read_through_and_forced_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskCache::new(dir.path(), Duration::from_secs(3600));
    let fetcher = Arc::new(MockFetcher::new());
    let (loader, mut events, cache) =
        start_loader(Arc::clone(&fetcher), 2, 0, Some(disk.clone()));

    let id = tile(12, 2200, 1343);
    loader.submit(id.clone(), Priority(1));
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);
    assert_eq!(fetcher.call_count(), 1);
    assert!(disk.tile_path(&id).exists());

    // Memory miss, disk hit
    cache.invalidate(&id);
    loader.submit(id.clone(), Priority(1));
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);
    assert_eq!(fetcher.call_count(), 1);

    // Forced refresh goes to the network
    loader.submit_forced(id.clone(), Priority(1));
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);
    assert_eq!(fetcher.call_count(), 2);
}

// =============================================================================
// MBTiles
// =============================================================================

#[tokio::test]
async fn test_mbtiles_source_uses_its_own_retrieval_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.mbtiles");
    // Stored rows are TMS: XYZ (2, 1, 1) is row 2, XYZ (2, 0, 0) is row 3
    write_mbtiles(
        &path,
        &[("format", "png"), ("minzoom", "0"), ("maxzoom", "4")],
        &[
            (2, 1, 2, png_tile(256, [200, 10, 10, 255])),
            (2, 0, 3, b"not an image".to_vec()),
        ],
    )
    .await;
    let source = Arc::new(MbTilesSource::open("local", &path, true).await.unwrap());

    let network = Arc::new(MockFetcher::new());
    let disk = DiskCache::new(dir.path().join("disk"), Duration::from_secs(3600));
    let cache = Arc::new(TileCache::new(16).unwrap());
    let (loader, mut events) = TileLoader::new(
        LoaderConfig {
            workers: 2,
            fetch_timeout: Duration::from_secs(5),
            retry: fast_retry(3),
        },
        source,
        network.clone(),
        Arc::clone(&cache),
        Some(disk.clone()),
        Handle::current(),
    )
    .unwrap();

    let present = TileId::new("local", 2, 1, 1).unwrap();
    loader.submit(present.clone(), Priority(1));
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);
    assert!(cache.peek(&present).unwrap().is_loaded());
    assert!(!disk.tile_path(&present).exists());

    // The source allows no retries even though the loader would retry three times
    let corrupt = TileId::new("local", 2, 0, 0).unwrap();
    loader.submit(corrupt, Priority(1));
    assert!(matches!(
        next_event(&mut events).await.outcome,
        LoadOutcome::Failed {
            error: FetchError::Decode(_),
            attempts: 1
        }
    ));

    let missing = TileId::new("local", 2, 3, 3).unwrap();
    loader.submit(missing, Priority(1));
    assert!(matches!(
        next_event(&mut events).await.outcome,
        LoadOutcome::Failed {
            error: FetchError::NotFound(_),
            attempts: 1
        }
    ));
    assert_eq!(network.call_count(), 0);
}

// =============================================================================
// Cancellation and Source Swaps
// =============================================================================

#[tokio::test]
async fn test_cancel_only_pending_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(Arc::clone(&gate)));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 1, 0, None);

    let running = tile(6, 34, 21);
    let waiting = tile(6, 35, 21);
    loader.submit(running.clone(), Priority::HIGHEST);
    wait_until(|| loader.in_flight_count() == 1).await;
    loader.submit(waiting.clone(), Priority(1));

    assert!(loader.cancel(&waiting));
    assert!(!loader.cancel(&running));
    assert!(!loader.is_outstanding(&waiting));
    // The placeholder of the cancelled job is gone
    assert!(cache.peek(&waiting).is_none());

    gate.add_permits(1);
    let event = next_event(&mut events).await;
    assert_eq!(event.id, running);
    assert!(!loader.has_outstanding_jobs());
    assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test]
async fn test_source_swap_discards_running_fetch() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(Arc::clone(&gate)));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 1, 0, None);

    let id = tile(6, 34, 21);
    loader.submit(id.clone(), Priority(1));
    wait_until(|| loader.in_flight_count() == 1).await;

    loader.set_source(test_source("topo")).unwrap();
    gate.add_permits(1);
    wait_until(|| !loader.has_outstanding_jobs()).await;

    assert!(events.try_recv().is_err());
    assert!(!cache.peek(&id).is_some_and(|t| t.is_loaded()));

    // Old-source ids are refused from now on
    assert_eq!(loader.submit(id, Priority(1)), SubmitOutcome::Rejected);
    let topo = TileId::new("topo", 6, 34, 21).unwrap();
    assert_eq!(loader.submit(topo, Priority(1)), SubmitOutcome::Enqueued);
}

#[tokio::test]
async fn test_same_id_source_swap_restarts_running_fetch() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(MockFetcher::new().gated(Arc::clone(&gate)));
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 1, 0, None);

    let id = tile(6, 34, 21);
    loader.submit(id.clone(), Priority(1));
    wait_until(|| loader.in_flight_count() == 1).await;

    let restyled = TemplateSource::builder("osm", "https://restyled.tiles.test/{z}/{x}/{y}.png")
        .zoom_range(0, 18)
        .build()
        .unwrap();
    loader.set_source(Arc::new(restyled)).unwrap();
    gate.add_permits(2);

    let event = next_event(&mut events).await;
    assert_eq!(event.id, id);
    assert_eq!(event.outcome, LoadOutcome::Loaded);
    assert_eq!(
        fetcher.urls(),
        vec![
            "https://osm.tiles.test/6/34/21.png".to_string(),
            "https://restyled.tiles.test/6/34/21.png".to_string(),
        ]
    );
    assert!(cache.peek(&id).unwrap().is_loaded());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_last_handle_stops_workers() {
    let fetcher = Arc::new(MockFetcher::new());
    let (loader, mut events, cache) = start_loader(Arc::clone(&fetcher), 4, 0, None);

    loader.submit(tile(3, 4, 2), Priority(1));
    assert_eq!(next_event(&mut events).await.outcome, LoadOutcome::Loaded);

    let clone = loader.clone();
    drop(loader);
    assert!(!clone.is_shut_down());
    drop(clone);
    drop(events);

    wait_until(|| Arc::strong_count(&cache) == 1).await;
    wait_until(|| Arc::strong_count(&fetcher) == 1).await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let fetcher = Arc::new(MockFetcher::new());
    let (loader, _events, _cache) = start_loader(fetcher, 2, 0, None);

    loader.shutdown();
    loader.shutdown();
    assert!(loader.is_shut_down());
    assert_eq!(
        loader.submit(tile(3, 4, 2), Priority(1)),
        SubmitOutcome::Rejected
    );
}
