//! Spherical mercator projection math.
//!
//! Tiles are always addressed in EPSG:3857 (Web Mercator); requests may
//! arrive in EPSG:4326 (plain longitude/latitude degrees). Both axes are
//! separable in either system: x depends only on longitude and y only on
//! latitude, which the compositor relies on when resampling.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::error::GridError;

/// Equatorial radius of the WGS84 sphere used by Web Mercator, in metres.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Half the projected width of the world in EPSG:3857 metres.
pub const HALF_CIRCUMFERENCE: f64 = PI * EARTH_RADIUS;

/// Latitude at which the square Web Mercator world ends.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Coordinate reference systems accepted in bbox requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Crs {
    /// Longitude/latitude in degrees.
    #[default]
    Epsg4326,
    /// Spherical mercator in metres.
    Epsg3857,
}

impl Crs {
    /// Parse an EPSG identifier. Matching is case-insensitive and accepts the
    /// legacy mercator aliases `EPSG:900913` and `EPSG:3785`.
    pub fn parse(code: &str) -> Result<Self, GridError> {
        match code.trim().to_ascii_uppercase().as_str() {
            "EPSG:4326" | "CRS:84" => Ok(Crs::Epsg4326),
            "EPSG:3857" | "EPSG:900913" | "EPSG:3785" => Ok(Crs::Epsg3857),
            _ => Err(GridError::UnsupportedCrs(code.to_string())),
        }
    }

    /// Canonical EPSG code.
    pub fn code(&self) -> &'static str {
        match self {
            Crs::Epsg4326 => "EPSG:4326",
            Crs::Epsg3857 => "EPSG:3857",
        }
    }

    /// Convert an x coordinate in this CRS to longitude.
    #[inline]
    pub fn x_to_lon(&self, x: f64) -> f64 {
        match self {
            Crs::Epsg4326 => x,
            Crs::Epsg3857 => x / HALF_CIRCUMFERENCE * 180.0,
        }
    }

    /// Convert a y coordinate in this CRS to latitude.
    #[inline]
    pub fn y_to_lat(&self, y: f64) -> f64 {
        match self {
            Crs::Epsg4326 => y,
            Crs::Epsg3857 => (y / EARTH_RADIUS).sinh().atan().to_degrees(),
        }
    }

    /// Convert longitude to an x coordinate in this CRS.
    #[inline]
    pub fn lon_to_x(&self, lon: f64) -> f64 {
        match self {
            Crs::Epsg4326 => lon,
            Crs::Epsg3857 => lon / 180.0 * HALF_CIRCUMFERENCE,
        }
    }

    /// Convert latitude to a y coordinate in this CRS.
    ///
    /// Mercator y is infinite at the poles; callers clamp latitude to
    /// [`MAX_LATITUDE`] first when they need finite output.
    #[inline]
    pub fn lat_to_y(&self, lat: f64) -> f64 {
        match self {
            Crs::Epsg4326 => lat,
            Crs::Epsg3857 => lat.to_radians().tan().asinh() * EARTH_RADIUS,
        }
    }

    /// Convert a point in this CRS to `(lon, lat)` degrees.
    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        (self.x_to_lon(x), self.y_to_lat(y))
    }

    /// Convert `(lon, lat)` degrees to a point in this CRS.
    pub fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
        (self.lon_to_x(lon), self.lat_to_y(lat))
    }

    /// Extent of the tiled world in this CRS as `(min_x, min_y, max_x, max_y)`.
    pub fn world_extent(&self) -> (f64, f64, f64, f64) {
        match self {
            Crs::Epsg4326 => (-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE),
            Crs::Epsg3857 => (
                -HALF_CIRCUMFERENCE,
                -HALF_CIRCUMFERENCE,
                HALF_CIRCUMFERENCE,
                HALF_CIRCUMFERENCE,
            ),
        }
    }

    /// Width of the world in this CRS's x units.
    pub fn world_width(&self) -> f64 {
        match self {
            Crs::Epsg4326 => 360.0,
            Crs::Epsg3857 => 2.0 * HALF_CIRCUMFERENCE,
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Crs {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Crs::parse(s)
    }
}

/// Horizontal position of a longitude as a fraction of the world width
/// (0 at -180°, 1 at +180°).
#[inline]
pub fn lon_to_unit(lon: f64) -> f64 {
    (lon + 180.0) / 360.0
}

/// Vertical position of a latitude as a fraction of the world height
/// (0 at the northern edge, 1 at the southern edge).
#[inline]
pub fn lat_to_unit(lat: f64) -> f64 {
    (1.0 - lat.to_radians().tan().asinh() / PI) / 2.0
}

/// Inverse of [`lon_to_unit`].
#[inline]
pub fn unit_to_lon(u: f64) -> f64 {
    u * 360.0 - 180.0
}

/// Inverse of [`lat_to_unit`].
#[inline]
pub fn unit_to_lat(v: f64) -> f64 {
    (PI * (1.0 - 2.0 * v)).sinh().atan().to_degrees()
}

// =============================================================================
// Tests
// =============================================================================
