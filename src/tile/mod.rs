//! Tile resolution, composition and encoding.
//!
//! # Components
//!
//! - [`TileResolver`]: cache → fetch → negative-cache policy for one tile
//! - [`Compositor`]: bbox requests composed and reprojected from many tiles
//! - [`ImageEncoder`]: PNG/JPEG output and tile format conversion
//! - [`TileService`]: facade used by the HTTP layer
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tilegrid_proxy::fetch::{FetcherConfig, HttpFetcher};
//! use tilegrid_proxy::grid::TileAddress;
//! use tilegrid_proxy::tile::{Resolved, TileResolver};
//! use tilegrid_proxy::Layer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layer = Arc::new(
//!         Layer::new("osm", "/var/cache/tiles".into())
//!             .with_extension("png")
//!             .with_upstream("https://tile.openstreetmap.org/{z}/{x}/{y}.png"),
//!     );
//!     let resolver = Arc::new(TileResolver::new(HttpFetcher::new(FetcherConfig::default())?));
//!
//!     let address = TileAddress::new("osm", 3, 4, 2)?;
//!     if let Resolved::Tile { data, origin } = resolver.resolve_shared(layer, address).await? {
//!         println!("{} bytes from {}", data.len(), origin.as_str());
//!     }
//!     Ok(())
//! }
//! ```

mod compositor;
mod encoder;
mod resolver;
mod service;

pub use compositor::{
    BboxRequest, CompositeRaster, Compositor, CompositorConfig, Resampling, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_MAX_OUTPUT_SIZE, DEFAULT_MAX_TILES,
};
pub use encoder::{
    clamp_quality, decode, detect_format, is_format, is_valid_quality, ImageEncoder, OutputFormat,
    DEFAULT_JPEG_QUALITY, MAX_JPEG_QUALITY, MIN_JPEG_QUALITY,
};
pub use resolver::{Resolved, TileOrigin, TileResolver};
pub use service::{MapRequest, MapResponse, ServiceConfig, TileRequest, TileResponse, TileService};
