//! tilegrid-proxy - a caching map tile proxy.
//!
//! This binary loads the layers file, wires the fetcher, caches and
//! compositor together and starts the HTTP server.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilegrid_proxy::{
    config::Config,
    fetch::HttpFetcher,
    server::create_router,
    tile::TileService,
    LayerRegistry,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let registry = match LayerRegistry::from_file(&config.layers, config.cache_dir.as_deref()) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to load layers from {}: {}", config.layers.display(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Layers file: {}", config.layers.display());
    for layer in registry.iter() {
        let upstream = layer.upstream_url_template.as_deref().unwrap_or("(cache only)");
        info!(
            "  Layer {}: z{}-{} {} {} -> {}",
            layer.id,
            layer.min_zoom,
            layer.max_zoom,
            layer.layout.as_str(),
            layer.cache_root.join(&layer.cache_prefix).display(),
            upstream
        );
    }
    if registry.is_empty() {
        warn!("  No layers configured; every tile request will return 404");
    }
    info!(
        "  Upstream: {} concurrent, {}s timeout",
        config.fetch_concurrency, config.fetch_timeout
    );
    info!(
        "  Memory cache: {}MB, max map size {}px, {:?} resampling",
        config.memory_cache, config.max_size, config.resampling
    );

    let fetcher = match HttpFetcher::new(config.fetcher_config()) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!("Failed to create upstream client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tile_service = TileService::new(registry, fetcher, config.service_config());
    let router = create_router(tile_service, config.router_config());

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Server listening on http://{}", addr);
    info!("  curl http://{}/layers", addr);
    info!("  curl http://{}/tiles/<layer>/0/0/0.png", addr);

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tilegrid_proxy=debug,tower_http=debug"
    } else {
        "tilegrid_proxy=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
