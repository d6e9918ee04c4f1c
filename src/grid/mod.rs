//! Tile grid addressing.
//!
//! Everything here is pure math over the Web Mercator tile pyramid:
//!
//! - [`Crs`]: the two request projections and their transforms
//! - [`TileAddress`]: one tile of one layer, `column, row < 2^zoom`
//! - [`GeoBounds`]: geographic rectangles, and [`bounds_for`] a tile
//! - [`TileRange`]: the tiles covering a rectangle at one zoom
//! - [`best_zoom_for`]: zoom selection for a requested output resolution
//! - [`path_for`] / [`address_from_path`]: the on-disk layouts
//!
//! ```
//! use tilegrid_proxy::grid::{address_for, bounds_for};
//! use tilegrid_proxy::Layer;
//!
//! let layer = Layer::new("osm", "/var/cache/tiles".into());
//! let tile = address_for(&layer, 2.3522, 48.8566, 12).unwrap();
//! assert!(bounds_for(&tile).contains(2.3522, 48.8566));
//! ```

mod address;
mod layout;
mod projection;

pub use address::{
    address_for, best_zoom_for, bounds_for, quadkey, tile_position, tiles_per_axis, GeoBounds,
    TileAddress, TileRange,
};
pub(crate) use address::zoom_for_resolution;
pub use layout::{
    address_from_path, negative_marker_path_for, path_for, CacheLayout, NEGATIVE_MARKER_EXTENSION,
};
pub use projection::{
    lat_to_unit, lon_to_unit, unit_to_lat, unit_to_lon, Crs, EARTH_RADIUS, HALF_CIRCUMFERENCE,
    MAX_LATITUDE,
};

/// Edge length of every source tile, in pixels.
pub const TILE_SIZE: u32 = 256;

/// Deepest zoom level the pyramid can address.
pub const MAX_ZOOM: u8 = 30;
