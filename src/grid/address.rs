//! Tile addresses, geographic bounds and zoom selection.

use std::fmt;

use super::projection::{lat_to_unit, lon_to_unit, unit_to_lat, unit_to_lon, MAX_LATITUDE};
use super::{MAX_ZOOM, TILE_SIZE};
use crate::error::GridError;
use crate::layer::Layer;

/// Positions this close to a tile boundary are treated as lying on it.
const EDGE_EPSILON: f64 = 1e-9;

/// Slack, in source pixels, when comparing resolutions in zoom selection.
const RESOLUTION_EPSILON: f64 = 1e-6;

/// Number of tiles along one axis at `zoom`.
#[inline]
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom
}

/// A single tile in a layer's pyramid.
///
/// Rows count from the north edge (XYZ convention). A valid address has
/// `column, row < 2^zoom`; [`TileAddress::new`] enforces that, while the
/// public fields allow building unwrapped addresses (e.g. columns past the
/// antimeridian) which [`TileAddress::normalized`] folds back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub layer_id: String,
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
}

impl TileAddress {
    /// Create a validated address.
    pub fn new(
        layer_id: impl Into<String>,
        zoom: u8,
        column: u32,
        row: u32,
    ) -> Result<Self, GridError> {
        let address = TileAddress {
            layer_id: layer_id.into(),
            zoom,
            column,
            row,
        };
        address.validate()?;
        Ok(address)
    }

    /// Check the zoom and `column, row < 2^zoom`.
    pub fn validate(&self) -> Result<(), GridError> {
        if self.zoom > MAX_ZOOM {
            return Err(GridError::InvalidZoom(self.zoom));
        }
        let n = tiles_per_axis(self.zoom);
        if self.column >= n || self.row >= n {
            return Err(GridError::TileOutOfRange {
                zoom: self.zoom,
                column: self.column,
                row: self.row,
            });
        }
        Ok(())
    }

    /// Wrap the column modulo `2^zoom` and validate the result.
    pub fn normalized(&self) -> Result<Self, GridError> {
        if self.zoom > MAX_ZOOM {
            return Err(GridError::InvalidZoom(self.zoom));
        }
        let wrapped = TileAddress {
            layer_id: self.layer_id.clone(),
            zoom: self.zoom,
            column: self.column % tiles_per_axis(self.zoom),
            row: self.row,
        };
        wrapped.validate()?;
        Ok(wrapped)
    }

    /// Row counted from the south edge (TMS convention).
    pub fn tms_row(&self) -> u32 {
        tiles_per_axis(self.zoom) - 1 - self.row
    }

    /// Bing-style quadkey; empty at zoom 0.
    pub fn quadkey(&self) -> String {
        quadkey(self.zoom, self.column, self.row)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.layer_id, self.zoom, self.column, self.row)
    }
}

/// Bing quadkey for a tile: one base-4 digit per zoom level, most significant first.
pub fn quadkey(zoom: u8, column: u32, row: u32) -> String {
    (1..=zoom)
        .rev()
        .map(|level| {
            let mask = 1u32 << (level - 1);
            let mut digit = 0u8;
            if column & mask != 0 {
                digit += 1;
            }
            if row & mask != 0 {
                digit += 2;
            }
            char::from(b'0' + digit)
        })
        .collect()
}

/// Axis-aligned geographic rectangle in degrees.
///
/// `max_lon` may exceed 180 for areas that continue across the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl GeoBounds {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// The whole mercator world.
    pub fn world() -> Self {
        Self::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE)
    }

    /// Whether the point lies inside or on the edge of the rectangle.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Whether the two rectangles share any area (touching edges do not count).
    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
            && self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Fractional tile position of a point at `zoom`, without validation.
#[inline]
pub fn tile_position(lon: f64, lat: f64, zoom: u8) -> (f64, f64) {
    let n = f64::from(tiles_per_axis(zoom));
    (lon_to_unit(lon) * n, lat_to_unit(lat) * n)
}

/// Address of the tile containing a point.
///
/// Points on the east or south edge of the world map to the last column or
/// row.
pub fn address_for(layer: &Layer, lon: f64, lat: f64, zoom: u8) -> Result<TileAddress, GridError> {
    if !lon.is_finite()
        || !lat.is_finite()
        || !(-180.0..=180.0).contains(&lon)
        || !(-MAX_LATITUDE..=MAX_LATITUDE).contains(&lat)
    {
        return Err(GridError::InvalidCoordinate { lon, lat });
    }
    if zoom > MAX_ZOOM {
        return Err(GridError::InvalidZoom(zoom));
    }

    let last = tiles_per_axis(zoom) - 1;
    let (fx, fy) = tile_position(lon, lat, zoom);
    let column = (fx.floor().max(0.0) as u32).min(last);
    let row = (fy.floor().max(0.0) as u32).min(last);

    Ok(TileAddress {
        layer_id: layer.id.clone(),
        zoom,
        column,
        row,
    })
}

/// Geographic extent of a tile.
pub fn bounds_for(address: &TileAddress) -> GeoBounds {
    let n = f64::from(tiles_per_axis(address.zoom));
    let column = f64::from(address.column);
    let row = f64::from(address.row);
    GeoBounds {
        min_lon: unit_to_lon(column / n),
        max_lon: unit_to_lon((column + 1.0) / n),
        max_lat: unit_to_lat(row / n),
        min_lat: unit_to_lat((row + 1.0) / n),
    }
}

/// Smallest zoom whose source resolution covers `width` x `height` output
/// pixels across `bounds`, clamped to the layer's zoom range.
///
/// Returns `None` if the layer has an empty zoom range.
pub fn best_zoom_for(layer: &Layer, width: u32, height: u32, bounds: &GeoBounds) -> Option<u8> {
    zoom_for_resolution(layer, f64::from(width), f64::from(height), bounds)
}

/// [`best_zoom_for`] with fractional output sizes.
pub(crate) fn zoom_for_resolution(
    layer: &Layer,
    width: f64,
    height: f64,
    bounds: &GeoBounds,
) -> Option<u8> {
    if layer.min_zoom > layer.max_zoom {
        return None;
    }

    let max_lat = bounds.max_lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let min_lat = bounds.min_lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let span_x = bounds.width() / 360.0;
    let span_y = lat_to_unit(min_lat) - lat_to_unit(max_lat);

    for zoom in layer.min_zoom..=layer.max_zoom {
        let scale = f64::from(tiles_per_axis(zoom)) * f64::from(TILE_SIZE);
        if span_x * scale + RESOLUTION_EPSILON >= width
            && span_y * scale + RESOLUTION_EPSILON >= height
        {
            return Some(zoom);
        }
    }
    Some(layer.max_zoom)
}

/// Inclusive rectangle of tiles at one zoom.
///
/// `max_column` may reach past `2^zoom - 1` when the covered area crosses
/// the antimeridian; such columns wrap when resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_column: u32,
    pub max_column: u32,
    pub min_row: u32,
    pub max_row: u32,
}

impl TileRange {
    /// Tiles intersecting `bounds` at `zoom`.
    ///
    /// A bound that falls exactly on a tile edge does not pull in the
    /// neighbouring tile.
    pub fn covering(bounds: &GeoBounds, zoom: u8) -> TileRange {
        let n = tiles_per_axis(zoom);
        let max_lat = bounds.max_lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
        let min_lat = bounds.min_lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
        let (x0, y0) = tile_position(bounds.min_lon, max_lat, zoom);
        let (x1, y1) = tile_position(bounds.max_lon, min_lat, zoom);

        let column_limit = 2 * u64::from(n) - 1;
        let min_column = first_index(x0).min(column_limit);
        let max_column = last_index(x1, min_column).min(column_limit);
        let min_row = first_index(y0).min(u64::from(n) - 1);
        let max_row = last_index(y1, min_row).min(u64::from(n) - 1);

        TileRange {
            zoom,
            min_column: min_column as u32,
            max_column: max_column as u32,
            min_row: min_row as u32,
            max_row: max_row as u32,
        }
    }

    pub fn columns(&self) -> u32 {
        self.max_column - self.min_column + 1
    }

    pub fn rows(&self) -> u32 {
        self.max_row - self.min_row + 1
    }

    /// Number of tiles in the range.
    pub fn len(&self) -> u64 {
        u64::from(self.columns()) * u64::from(self.rows())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses in row-major order. Columns are not wrapped.
    pub fn addresses<'a>(&self, layer_id: &'a str) -> impl Iterator<Item = TileAddress> + 'a {
        let range = *self;
        (range.min_row..=range.max_row).flat_map(move |row| {
            (range.min_column..=range.max_column).map(move |column| TileAddress {
                layer_id: layer_id.to_string(),
                zoom: range.zoom,
                column,
                row,
            })
        })
    }
}

fn snap(position: f64) -> f64 {
    let nearest = position.round();
    if (position - nearest).abs() < EDGE_EPSILON {
        nearest
    } else {
        position
    }
}

fn first_index(position: f64) -> u64 {
    snap(position).floor().max(0.0) as u64
}

fn last_index(position: f64, first: u64) -> u64 {
    let end = snap(position).ceil().max(0.0) as u64;
    end.saturating_sub(1).max(first)
}

// =============================================================================
// Tests
// =============================================================================
