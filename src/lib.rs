//! # tilegrid-proxy
//!
//! A caching map tile proxy. It answers WMS bounding-box requests and
//! WMTS/TMS-style `z/x/y` tile requests from a single on-disk tile pyramid
//! per layer, fetching missing tiles from upstream tile servers.
//!
//! ## Architecture
//!
//! - [`grid`] - Web Mercator tile addressing and on-disk cache layouts
//! - [`layer`] - Layer definitions and the layers file
//! - [`cache`] - Disk tile store with negative markers, plus a memory LRU
//! - [`fetch`] - Upstream fetching through URL templates
//! - [`tile`] - Resolver, compositor/reprojector, encoder and the service facade
//! - [`server`] - Axum-based HTTP adapters
//! - [`config`] - CLI and environment configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use tilegrid_proxy::{create_router, HttpFetcher, FetcherConfig, LayerRegistry, RouterConfig};
//! use tilegrid_proxy::tile::{ServiceConfig, TileService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = LayerRegistry::from_file("layers.json".as_ref(), None)?;
//!     let fetcher = HttpFetcher::new(FetcherConfig::default())?;
//!     let service = TileService::new(registry, fetcher, ServiceConfig::default());
//!
//!     let router = create_router(service, RouterConfig::new());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod grid;
pub mod layer;
pub mod server;
pub mod tile;

// Re-export commonly used types
pub use cache::{CacheLookup, DiskTileStore, TileCache, TileCacheKey};
pub use config::Config;
pub use error::{CacheError, ConfigError, GridError, TileError};
pub use fetch::{FetchOutcome, FetcherConfig, HttpFetcher, TileFetcher};
pub use grid::{CacheLayout, Crs, GeoBounds, TileAddress, TileRange};
pub use layer::{DeadTile, Layer, LayerRegistry, LayersFile};
pub use server::{create_router, AppState, ErrorResponse, RouterConfig};
pub use tile::{
    BboxRequest, CompositeRaster, Compositor, CompositorConfig, ImageEncoder, MapRequest,
    OutputFormat, Resampling, Resolved, ServiceConfig, TileOrigin, TileRequest, TileResolver,
    TileResponse, TileService,
};
