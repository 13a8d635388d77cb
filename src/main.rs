//! tile-mosaic - slippy-map tile fetching and caching.
//!
//! `locate` resolves a coordinate to its tile; `prefetch` loads every tile of
//! a viewport through the full cache and loader pipeline.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_mosaic::{
    config::{Cli, Command, LocateArgs, OutputFormat, PrefetchArgs},
    projection::{project_with_tile_size, tile_bounds, Viewport, MAX_ZOOM},
    ScreenRect, TileController, TileId, TileSource,
};

/// Interval between event drains while prefetching.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Locate(args) => run_locate(args),
        Command::Prefetch(args) => run_prefetch(args).await,
    }
}

// =============================================================================
// Locate Command
// =============================================================================

fn run_locate(args: LocateArgs) -> ExitCode {
    if args.zoom > MAX_ZOOM {
        eprintln!("Error: zoom {} exceeds the maximum of {}", args.zoom, MAX_ZOOM);
        return ExitCode::FAILURE;
    }
    if args.tile_size == 0 {
        eprintln!("Error: tile size must be positive");
        return ExitCode::FAILURE;
    }

    let position = project_with_tile_size(args.lat, args.lon, args.zoom, args.tile_size);
    let bounds = tile_bounds(&position.tile_id("locate"));

    match args.format {
        OutputFormat::Text => {
            println!("{}/{}/{}", position.zoom, position.column, position.row);
            println!("  pixel: ({}, {})", position.pixel_x, position.pixel_y);
            println!(
                "  bounds: lat {:.6}..{:.6}, lon {:.6}..{:.6}",
                bounds.lat_min, bounds.lat_max, bounds.lon_min, bounds.lon_max
            );
        }
        OutputFormat::Json => {
            let output = json!({
                "zoom": position.zoom,
                "x": position.column,
                "y": position.row,
                "pixel_x": position.pixel_x,
                "pixel_y": position.pixel_y,
                "bounds": {
                    "lat_min": bounds.lat_min,
                    "lon_min": bounds.lon_min,
                    "lat_max": bounds.lat_max,
                    "lon_max": bounds.lon_max,
                },
            });
            println!("{output}");
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Prefetch Command
// =============================================================================

async fn run_prefetch(args: PrefetchArgs) -> ExitCode {
    init_logging(args.verbose);

    let config = args.to_tile_config();
    let source = match args.open_source().await {
        Ok(source) => source,
        Err(e) => {
            error!("Invalid tile source: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    match args.mbtiles {
        Some(ref path) => info!("  Source: {} ({})", source.source_id(), path.display()),
        None => info!("  Source: {} ({})", source.source_id(), args.url_template),
    }
    info!(
        "  Zoom range: {}..={}",
        source.min_zoom(),
        source.max_zoom()
    );
    info!(
        "  Workers: {}, retries: {}, timeout: {}s",
        config.loader.workers, config.loader.retry.max_retries, args.timeout_secs
    );
    match config.disk_cache_dir {
        Some(ref dir) => info!("  Disk cache: {}", dir.display()),
        None => info!("  Disk cache: disabled"),
    }

    let repaints = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&repaints);
    let listener = move |_id: &TileId, _region: ScreenRect| {
        counter.fetch_add(1, Ordering::Relaxed);
    };

    let mut controller = match TileController::with_http(
        config,
        source,
        listener,
        tokio::runtime::Handle::current(),
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let viewport = Viewport::new(args.lat, args.lon, args.zoom, args.width, args.height);
    let update = controller.on_viewport_changed(viewport);
    if update.viewport.zoom != args.zoom {
        warn!(
            "Zoom {} is outside the source's range, using {}",
            args.zoom, update.viewport.zoom
        );
    }
    info!(
        "Prefetching {} tiles ({} already cached)",
        update.visible.len(),
        update.hits.len()
    );

    let started = Instant::now();
    let deadline = Duration::from_secs(args.wait_secs);
    let mut loaded = 0;
    let mut failed = 0;
    let mut timed_out = false;

    loop {
        let processed = controller.process_events();
        loaded += processed.loaded;
        failed += processed.failed;

        // Every enqueued job reports exactly once
        if loaded + failed >= update.requested && !controller.has_outstanding_jobs() {
            break;
        }
        if started.elapsed() >= deadline {
            timed_out = true;
            let cancelled = controller.cancel_outstanding_jobs();
            warn!(
                "Gave up after {}s, {} tiles still pending",
                args.wait_secs, cancelled
            );
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let stats = controller.cache_stats();
    let elapsed = started.elapsed();

    match args.format {
        OutputFormat::Text => {
            println!("Tiles:      {}", update.visible.len());
            println!("Cached:     {}", update.hits.len());
            println!("Loaded:     {}", loaded);
            println!("Failed:     {}", failed);
            println!("Repaints:   {}", repaints.load(Ordering::Relaxed));
            println!(
                "Cache:      {}/{} tiles, hit rate {:.1}%",
                stats.len,
                stats.capacity,
                stats.hit_rate() * 100.0
            );
            println!("Elapsed:    {:.2}s", elapsed.as_secs_f64());
        }
        OutputFormat::Json => {
            let output = json!({
                "zoom": update.viewport.zoom,
                "tiles": update.visible.len(),
                "cached": update.hits.len(),
                "loaded": loaded,
                "failed": failed,
                "repaints": repaints.load(Ordering::Relaxed),
                "timed_out": timed_out,
                "elapsed_secs": elapsed.as_secs_f64(),
                "cache": stats,
            });
            println!("{output}");
        }
    }

    if failed > 0 || timed_out {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Initialize the logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tile_mosaic=debug"
    } else {
        "tile_mosaic=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
