//! Test utilities for integration tests.
//!
//! This module provides a scripted fetcher, PNG fixtures and helpers for
//! driving a controller until its loads settle.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::Semaphore;

use tile_mosaic::config::TileConfig;
use tile_mosaic::controller::{ProcessedEvents, TileController};
use tile_mosaic::error::FetchError;
use tile_mosaic::io::{FetchResponse, TileFetcher};
use tile_mosaic::loader::{LoaderConfig, RetryPolicy};
use tile_mosaic::projection::{ScreenRect, TileId};
use tile_mosaic::source::{TemplateSource, TileSource};

/// Upper bound for any wait in these tests.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

// =============================================================================
// Fixtures
// =============================================================================

/// Encode a solid square PNG.
pub fn png_tile(size: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(size, size, Rgba(color));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode png fixture");
    out
}

/// A URL-template source on a fake host, zoom 0..=18.
pub fn test_source(source_id: &str) -> Arc<dyn TileSource> {
    let template = format!("https://{source_id}.tiles.test/{{z}}/{{x}}/{{y}}.png");
    Arc::new(
        TemplateSource::builder(source_id, template)
            .zoom_range(0, 18)
            .build()
            .expect("valid test source"),
    )
}

/// Write a minimal MBTiles file. Tile rows are given as stored (TMS).
pub async fn write_mbtiles(
    path: &Path,
    metadata: &[(&str, &str)],
    tiles: &[(u8, u32, u32, Vec<u8>)],
) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("create mbtiles fixture");

    for statement in [
        "CREATE TABLE metadata (name TEXT, value TEXT)",
        "CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB)",
    ] {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .expect("create mbtiles table");
    }
    for (name, value) in metadata {
        sqlx::query("INSERT INTO metadata (name, value) VALUES (?1, ?2)")
            .bind(*name)
            .bind(*value)
            .execute(&pool)
            .await
            .expect("insert mbtiles metadata");
    }
    for (zoom, column, row, data) in tiles {
        sqlx::query(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(i64::from(*zoom))
        .bind(i64::from(*column))
        .bind(i64::from(*row))
        .bind(data.clone())
        .execute(&pool)
        .await
        .expect("insert mbtiles tile");
    }
    pool.close().await;
}

/// Retries that back off in milliseconds.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

/// Controller settings suited to tests: small pool, fast retries, long grace.
pub fn test_config(workers: usize) -> TileConfig {
    TileConfig {
        cache_capacity: 256,
        loader: LoaderConfig {
            workers,
            fetch_timeout: Duration::from_secs(5),
            retry: fast_retry(2),
        },
        error_retry_interval: Duration::from_secs(60),
        cancel_grace: Duration::from_secs(60),
        ..TileConfig::default()
    }
}

// =============================================================================
// Mock Fetcher
// =============================================================================

/// What the mock answers once scripted failures run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    Serve,
    NotFound,
    Unavailable,
}

/// A scripted fetcher that records every request.
///
/// Requests can be held back with [`gated`](Self::gated) until permits are
/// released, which makes queue ordering and in-flight states observable.
pub struct MockFetcher {
    body: Bytes,
    mode: MockMode,
    max_age: Option<Duration>,
    failures_remaining: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    headers: HashMap<String, String>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            body: Bytes::from(png_tile(256, [30, 120, 200, 255])),
            mode: MockMode::Serve,
            max_age: None,
            failures_remaining: AtomicUsize::new(0),
            gate: None,
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            headers: HashMap::new(),
        }
    }

    /// Fail the first `count` requests with a retryable error.
    pub fn failing_first(mut self, count: usize) -> Self {
        self.failures_remaining = AtomicUsize::new(count);
        self
    }

    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Declare every response fresh for `max_age`.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Hold each request until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TileFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());

        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    return Err(FetchError::Network {
                        status: None,
                        message: "gate closed".to_string(),
                    })
                }
            }
        }

        let scripted_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(FetchError::Network {
                status: Some(503),
                message: "scripted failure".to_string(),
            });
        }

        match self.mode {
            MockMode::Serve => Ok(FetchResponse {
                body: self.body.clone(),
                headers: self.headers.clone(),
                expires_at: self.max_age.map(|age| SystemTime::now() + age),
            }),
            MockMode::NotFound => Err(FetchError::NotFound(url.to_string())),
            MockMode::Unavailable => Err(FetchError::Network {
                status: Some(503),
                message: "unavailable".to_string(),
            }),
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Repaint notifications collected by a listener closure.
pub type Repaints = Arc<Mutex<Vec<(TileId, ScreenRect)>>>;

/// A listener that records every notification, and the shared log it writes.
pub fn recording_listener() -> (impl FnMut(&TileId, ScreenRect) + Send + 'static, Repaints) {
    let log: Repaints = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let listener = move |id: &TileId, region: ScreenRect| {
        sink.lock().push((id.clone(), region));
    };
    (listener, log)
}

// =============================================================================
// Waiting
// =============================================================================

/// Poll until `condition` holds, panicking after [`WAIT_LIMIT`].
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < WAIT_LIMIT, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain controller events until `settled` returns true for the running totals.
pub async fn drive_until<F>(controller: &mut TileController, mut settled: F) -> ProcessedEvents
where
    F: FnMut(&ProcessedEvents) -> bool,
{
    let started = Instant::now();
    let mut total = ProcessedEvents::default();
    loop {
        let processed = controller.process_events();
        total.loaded += processed.loaded;
        total.failed += processed.failed;
        total.repaints += processed.repaints;
        if settled(&total) {
            return total;
        }
        assert!(
            started.elapsed() < WAIT_LIMIT,
            "controller did not settle in time: {total:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain controller events until `count` jobs have reported.
pub async fn drive_until_reported(controller: &mut TileController, count: usize) -> ProcessedEvents {
    drive_until(controller, |total| total.loaded + total.failed >= count).await
}
