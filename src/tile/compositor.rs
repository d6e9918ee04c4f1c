//! Bounding-box composition and reprojection.
//!
//! ```text
//! BboxRequest (EPSG:4326 or EPSG:3857)
//!     │ normalise: flip, antimeridian, clip to the mercator world
//!     ▼
//! best zoom ──► TileRange ──► resolve tiles (bounded fan-out)
//!                                 │
//!                                 ▼
//!                 tile-aligned RGBA canvas (256 px per tile)
//!                                 │ per output pixel centre:
//!                                 │ CRS → lon/lat → mercator canvas px
//!                                 ▼
//!                     CompositeRaster (width x height)
//! ```
//!
//! Individual tiles that are missing, fail to resolve or fail to decode are
//! left transparent, or painted with the layer's `empty_color`. A composite
//! only fails for request-level problems.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use tracing::{debug, warn};

use super::encoder::decode;
use super::resolver::{Resolved, TileResolver};
use crate::error::{GridError, TileError};
use crate::fetch::TileFetcher;
use crate::grid::{
    lat_to_unit, lon_to_unit, tiles_per_axis, zoom_for_resolution, Crs, GeoBounds, TileRange,
    MAX_LATITUDE, TILE_SIZE,
};
use crate::layer::Layer;

/// Default cap on simultaneous tile resolutions per composite.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Default maximum output width and height.
pub const DEFAULT_MAX_OUTPUT_SIZE: u32 = 4096;

/// Default cap on source tiles per composite.
pub const DEFAULT_MAX_TILES: u64 = 1024;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

// =============================================================================
// Request and result types
// =============================================================================

/// Pixel interpolation when mapping source tiles onto the output raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    Nearest,
    #[default]
    Bilinear,
}

impl FromStr for Resampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            other => Err(format!("unknown resampling {other:?} (expected nearest or bilinear)")),
        }
    }
}

/// A raster request over a bounding box.
///
/// The bbox is in units of `crs`. `min_y > max_y` requests a vertically
/// flipped image; in EPSG:4326 `min_x > max_x` crosses the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BboxRequest {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub crs: Crs,
    pub width: u32,
    pub height: u32,
}

impl BboxRequest {
    pub fn new(bbox: [f64; 4], crs: Crs, width: u32, height: u32) -> Self {
        let [min_x, min_y, max_x, max_y] = bbox;
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            crs,
            width,
            height,
        }
    }
}

/// Output of a composite. Owned by the request, never cached.
#[derive(Debug, Clone)]
pub struct CompositeRaster {
    pub image: RgbaImage,
    /// Zoom level the source tiles were taken from.
    pub zoom: u8,
    pub tiles_total: u64,
    /// Tiles that were not found or could not be resolved or decoded.
    pub tiles_missing: u64,
}

/// Compositor limits and behaviour.
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    pub max_in_flight: usize,
    pub resampling: Resampling,
    pub max_width: u32,
    pub max_height: u32,
    pub max_tiles: u64,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            resampling: Resampling::default(),
            max_width: DEFAULT_MAX_OUTPUT_SIZE,
            max_height: DEFAULT_MAX_OUTPUT_SIZE,
            max_tiles: DEFAULT_MAX_TILES,
        }
    }
}

// =============================================================================
// Viewport
// =============================================================================

/// A request bbox normalised to `min < max` on both axes.
#[derive(Debug, Clone, Copy)]
struct Viewport {
    crs: Crs,
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    flip: bool,
}

impl Viewport {
    /// Longitudes are folded into the world west edge plus one world, so
    /// bboxes shifted by any number of worlds east or west land on the same
    /// tiles.
    fn new(request: &BboxRequest) -> Result<Self, TileError> {
        let values = [request.min_x, request.min_y, request.max_x, request.max_y];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GridError::InvalidBbox(format!("{values:?} is not finite")).into());
        }

        let crs = request.crs;
        let world = crs.world_width();
        let (mut x0, mut x1) = (request.min_x, request.max_x);
        if x0 > x1 {
            x1 += world;
        }
        let span = x1 - x0;
        if !span.is_finite() || span > 2.0 * world {
            return Err(TileError::OutOfBounds {
                message: format!("{values:?} in {crs} spans more than two worlds"),
            });
        }
        let west_edge = crs.world_extent().0;
        x0 = west_edge + (x0 - west_edge).rem_euclid(world);
        x1 = x0 + span;
        let (y0, y1, flip) = if request.min_y > request.max_y {
            (request.max_y, request.min_y, true)
        } else {
            (request.min_y, request.max_y, false)
        };

        if x0 >= x1 || y0 >= y1 {
            return Err(GridError::InvalidBbox(format!("{values:?} is empty")).into());
        }
        Ok(Self {
            crs,
            x0,
            y0,
            x1,
            y1,
            flip,
        })
    }

    /// The part of the viewport inside the mercator world, in geographic
    /// degrees. Longitudes may run up to 540 after antimeridian unwrapping.
    fn geographic_clip(&self) -> Option<GeoBounds> {
        let (west, south, east, north) = self.crs.world_extent();
        let east = east + self.crs.world_width();
        let x0 = self.x0.max(west);
        let x1 = self.x1.min(east);
        let y0 = self.y0.max(south);
        let y1 = self.y1.min(north);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        let (min_lon, min_lat) = self.crs.to_geographic(x0, y0);
        let (max_lon, max_lat) = self.crs.to_geographic(x1, y1);
        Some(GeoBounds::new(
            min_lon,
            min_lat.max(-MAX_LATITUDE),
            max_lon,
            max_lat.min(MAX_LATITUDE),
        ))
    }
}

// =============================================================================
// Compositor
// =============================================================================

/// Builds rasters for bbox requests from resolved tiles.
pub struct Compositor<F: TileFetcher> {
    resolver: Arc<TileResolver<F>>,
    config: CompositorConfig,
}

impl<F: TileFetcher> Compositor<F> {
    pub fn new(resolver: Arc<TileResolver<F>>, config: CompositorConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Compose one layer over the requested bbox.
    ///
    /// # Errors
    ///
    /// - `InvalidSize` for a zero or oversized output
    /// - `InvalidCoordinate` for a non-finite or empty bbox
    /// - `OutOfBounds` if the bbox misses the mercator world entirely
    /// - `UnsupportedLayer` if the layer has an empty zoom range
    /// - `TooManyTiles` if the covering range exceeds the tile limit
    pub async fn compose(&self, layer: &Arc<Layer>, request: &BboxRequest) -> Result<CompositeRaster, TileError> {
        self.check_size(request)?;
        let view = Viewport::new(request)?;
        let clip = view.geographic_clip().ok_or_else(|| TileError::OutOfBounds {
            message: format!(
                "{:?} in {} does not intersect the mercator world",
                [request.min_x, request.min_y, request.max_x, request.max_y],
                request.crs
            ),
        })?;

        // Output pixels that fall on the clipped area.
        let clip_x = view.crs.lon_to_x(clip.max_lon) - view.crs.lon_to_x(clip.min_lon);
        let clip_y = view.crs.lat_to_y(clip.max_lat) - view.crs.lat_to_y(clip.min_lat);
        let effective_width = f64::from(request.width) * clip_x / (view.x1 - view.x0);
        let effective_height = f64::from(request.height) * clip_y / (view.y1 - view.y0);

        let zoom = zoom_for_resolution(layer, effective_width, effective_height, &clip).ok_or_else(
            || TileError::UnsupportedLayer {
                layer_id: layer.id.clone(),
                reason: format!("empty zoom range {}..={}", layer.min_zoom, layer.max_zoom),
            },
        )?;
        let range = TileRange::covering(&clip, zoom);
        if range.len() > self.config.max_tiles {
            return Err(TileError::TooManyTiles {
                count: range.len(),
                limit: self.config.max_tiles,
            });
        }

        debug!(
            layer = %layer.id,
            z = zoom,
            tiles = range.len(),
            width = request.width,
            height = request.height,
            "Composing bbox"
        );

        let tiles = self.resolve_range(layer, &range).await;
        let resampling = self.config.resampling;
        let (width, height) = (request.width, request.height);
        let fill = layer.empty_color.unwrap_or(TRANSPARENT);

        let (image, placed) = tokio::task::spawn_blocking(move || {
            let (canvas, placed) = assemble(&range, tiles, fill);
            (resample(&canvas, &view, &range, width, height, resampling), placed)
        })
        .await
        .map_err(|e| TileError::Internal {
            message: format!("composite task failed: {e}"),
        })?;

        Ok(CompositeRaster {
            image,
            zoom,
            tiles_total: range.len(),
            tiles_missing: range.len() - placed,
        })
    }

    /// Compose several layers and alpha-blend them in order, the first
    /// layer at the bottom.
    pub async fn compose_layers(
        &self,
        layers: &[Arc<Layer>],
        request: &BboxRequest,
    ) -> Result<CompositeRaster, TileError> {
        let Some((base_layer, overlays)) = layers.split_first() else {
            return Err(TileError::InvalidRequest {
                message: "no layers requested".into(),
            });
        };
        let mut base = self.compose(base_layer, request).await?;
        for layer in overlays {
            let overlay = self.compose(layer, request).await?;
            imageops::overlay(&mut base.image, &overlay.image, 0, 0);
            base.zoom = base.zoom.max(overlay.zoom);
            base.tiles_total += overlay.tiles_total;
            base.tiles_missing += overlay.tiles_missing;
        }
        Ok(base)
    }

    fn check_size(&self, request: &BboxRequest) -> Result<(), TileError> {
        let CompositorConfig {
            max_width,
            max_height,
            ..
        } = self.config;
        if request.width == 0
            || request.height == 0
            || request.width > max_width
            || request.height > max_height
        {
            return Err(TileError::InvalidSize {
                width: request.width,
                height: request.height,
                max_width,
                max_height,
            });
        }
        Ok(())
    }

    /// Resolve every tile of the range, keeping the ones with bytes.
    /// Positions are relative to the range's top-left tile.
    async fn resolve_range(&self, layer: &Arc<Layer>, range: &TileRange) -> Vec<(u32, u32, Bytes)> {
        let lookups = range.addresses(&layer.id).map(|address| {
            let resolver = Arc::clone(&self.resolver);
            let layer = Arc::clone(layer);
            async move {
                let result = resolver.resolve_shared(layer, address.clone()).await;
                (address, result)
            }
        });

        stream::iter(lookups)
            .buffer_unordered(self.config.max_in_flight.max(1))
            .filter_map(|(address, result)| async move {
                match result {
                    Ok(Resolved::Tile { data, .. }) => Some((
                        address.column - range.min_column,
                        address.row - range.min_row,
                        data,
                    )),
                    Ok(Resolved::NotFound) => None,
                    Err(e) => {
                        warn!(tile = %address, error = %e, "Tile unavailable, leaving it blank");
                        None
                    }
                }
            })
            .collect()
            .await
    }
}

// =============================================================================
// Raster assembly
// =============================================================================

/// Paste tiles into a canvas covering the whole range, pre-filled with
/// `fill`. Returns the canvas and the number of tiles placed.
fn assemble(range: &TileRange, tiles: Vec<(u32, u32, Bytes)>, fill: Rgba<u8>) -> (RgbaImage, u64) {
    let mut canvas =
        RgbaImage::from_pixel(range.columns() * TILE_SIZE, range.rows() * TILE_SIZE, fill);
    let mut placed = 0;
    for (dx, dy, data) in tiles {
        let mut tile = match decode(&data) {
            Ok(image) => image.to_rgba8(),
            Err(e) => {
                warn!(
                    z = range.zoom,
                    x = range.min_column + dx,
                    y = range.min_row + dy,
                    error = %e,
                    "Undecodable tile, leaving it blank"
                );
                continue;
            }
        };
        if tile.dimensions() != (TILE_SIZE, TILE_SIZE) {
            tile = imageops::resize(&tile, TILE_SIZE, TILE_SIZE, FilterType::Triangle);
        }
        imageops::replace(
            &mut canvas,
            &tile,
            i64::from(dx * TILE_SIZE),
            i64::from(dy * TILE_SIZE),
        );
        placed += 1;
    }
    (canvas, placed)
}

/// Sample the canvas at every output pixel centre.
///
/// x depends only on longitude and y only on latitude in both CRSs, so
/// canvas coordinates are computed once per column and once per row.
fn resample(
    canvas: &RgbaImage,
    view: &Viewport,
    range: &TileRange,
    width: u32,
    height: u32,
    method: Resampling,
) -> RgbaImage {
    let scale = f64::from(tiles_per_axis(range.zoom)) * f64::from(TILE_SIZE);
    let origin_x = f64::from(range.min_column) * f64::from(TILE_SIZE);
    let origin_y = f64::from(range.min_row) * f64::from(TILE_SIZE);
    let (_, _, east, _) = view.crs.world_extent();
    let east_limit = view.crs.x_to_lon(east) + 360.0;

    let columns: Vec<Option<f64>> = (0..width)
        .map(|i| {
            let x = view.x0 + (f64::from(i) + 0.5) / f64::from(width) * (view.x1 - view.x0);
            let lon = view.crs.x_to_lon(x);
            (-180.0..=east_limit)
                .contains(&lon)
                .then(|| lon_to_unit(lon) * scale - origin_x)
        })
        .collect();

    let rows: Vec<Option<f64>> = (0..height)
        .map(|j| {
            let y = view.y1 - (f64::from(j) + 0.5) / f64::from(height) * (view.y1 - view.y0);
            let lat = view.crs.y_to_lat(y);
            (-MAX_LATITUDE..=MAX_LATITUDE)
                .contains(&lat)
                .then(|| lat_to_unit(lat) * scale - origin_y)
        })
        .collect();

    let mut output = RgbaImage::new(width, height);
    for (j, py) in rows.iter().enumerate() {
        let Some(py) = *py else { continue };
        for (i, px) in columns.iter().enumerate() {
            let Some(px) = *px else { continue };
            let pixel = match method {
                Resampling::Nearest => sample_nearest(canvas, px, py),
                Resampling::Bilinear => sample_bilinear(canvas, px, py),
            };
            output.put_pixel(i as u32, j as u32, pixel);
        }
    }

    if view.flip {
        imageops::flip_vertical_in_place(&mut output);
    }
    output
}

fn clamp_index(value: f64, len: u32) -> u32 {
    if value <= 0.0 {
        0
    } else {
        (value as u32).min(len - 1)
    }
}

fn sample_nearest(canvas: &RgbaImage, px: f64, py: f64) -> Rgba<u8> {
    if canvas.width() == 0 || canvas.height() == 0 {
        return TRANSPARENT;
    }
    let x = clamp_index(px.floor(), canvas.width());
    let y = clamp_index(py.floor(), canvas.height());
    *canvas.get_pixel(x, y)
}

fn sample_bilinear(canvas: &RgbaImage, px: f64, py: f64) -> Rgba<u8> {
    if canvas.width() == 0 || canvas.height() == 0 {
        return TRANSPARENT;
    }
    let sx = px - 0.5;
    let sy = py - 0.5;
    let fx = sx - sx.floor();
    let fy = sy - sy.floor();
    let x0 = clamp_index(sx.floor(), canvas.width());
    let y0 = clamp_index(sy.floor(), canvas.height());
    let x1 = clamp_index(sx.floor() + 1.0, canvas.width());
    let y1 = clamp_index(sy.floor() + 1.0, canvas.height());

    let p00 = canvas.get_pixel(x0, y0).0;
    let p10 = canvas.get_pixel(x1, y0).0;
    let p01 = canvas.get_pixel(x0, y1).0;
    let p11 = canvas.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = f64::from(p00[c]) * (1.0 - fx) + f64::from(p10[c]) * fx;
        let bottom = f64::from(p01[c]) * (1.0 - fx) + f64::from(p11[c]) * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

// =============================================================================
// Tests
// =============================================================================
