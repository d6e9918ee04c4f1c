//! HTTP request handlers.
//!
//! # Endpoints
//!
//! - `GET /tiles/{layer}/{z}/{x}/{y}.{ext}`: one native tile
//! - `GET /wms?REQUEST=GetMap&...`: a composed map over a bounding box
//! - `GET /layers`: configured layers
//! - `GET /health`: liveness

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{GridError, TileError};
use crate::fetch::TileFetcher;
use crate::grid::Crs;
use crate::layer::Layer;
use crate::tile::{BboxRequest, MapRequest, OutputFormat, TileRequest, TileService};

/// Width used by GetMap when neither WIDTH nor HEIGHT is given.
pub const DEFAULT_MAP_WIDTH: u32 = 350;

const X_TILE_SOURCE: &str = "x-tile-source";
const X_MAP_ZOOM: &str = "x-map-zoom";
const X_MAP_TILES: &str = "x-map-tiles";
const X_MAP_TILES_MISSING: &str = "x-map-tiles-missing";

// =============================================================================
// Application State
// =============================================================================

/// Shared state handed to every handler.
pub struct AppState<F: TileFetcher> {
    pub tile_service: Arc<TileService<F>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,
}

impl<F: TileFetcher> AppState<F> {
    pub fn new(tile_service: TileService<F>) -> Self {
        Self {
            tile_service: Arc::new(tile_service),
            cache_max_age: super::routes::DEFAULT_CACHE_MAX_AGE,
        }
    }

    pub fn with_cache_max_age(tile_service: TileService<F>, cache_max_age: u32) -> Self {
        Self {
            tile_service: Arc::new(tile_service),
            cache_max_age,
        }
    }
}

// Manual impl: F itself need not be Clone.
impl<F: TileFetcher> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            tile_service: Arc::clone(&self.tile_service),
            cache_max_age: self.cache_max_age,
        }
    }
}

// =============================================================================
// Request / Response Types
// =============================================================================

/// Path parameters for `/tiles/{layer}/{z}/{x}/{filename}`.
#[derive(Debug, Deserialize)]
pub struct TilePathParams {
    pub layer: String,
    pub z: u8,
    pub x: u32,
    /// Row with an optional extension, e.g. `5` or `5.png`.
    pub filename: String,
}

impl TilePathParams {
    /// Split `filename` into the row and the extension, if any.
    pub fn row_and_extension(&self) -> Result<(u32, Option<&str>), TileError> {
        let (row, extension) = match self.filename.split_once('.') {
            Some((row, ext)) => (row, Some(ext)),
            None => (self.filename.as_str(), None),
        };
        let row = row.parse::<u32>().map_err(|_| TileError::InvalidRequest {
            message: format!("invalid tile row {:?}", self.filename),
        })?;
        Ok((row, extension.filter(|ext| !ext.is_empty())))
    }
}

/// Error body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// One entry of `GET /layers`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LayerSummary {
    pub id: String,
    pub name: String,
    pub extension: String,
    pub mime_type: String,
    pub layout: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Whether misses can be fetched, as opposed to cache-only layers.
    pub upstream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[f64; 4]>,
}

impl From<&Layer> for LayerSummary {
    fn from(layer: &Layer) -> Self {
        Self {
            id: layer.id.clone(),
            name: layer.name.clone(),
            extension: layer.tile_extension.clone(),
            mime_type: layer.mime_type.clone(),
            layout: layer.layout.as_str().to_string(),
            min_zoom: layer.min_zoom,
            max_zoom: layer.max_zoom,
            upstream: layer.has_upstream(),
            bounds: layer
                .bounds
                .map(|b| [b.min_lon, b.min_lat, b.max_lon, b.max_lat]),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LayersResponse {
    pub layers: Vec<LayerSummary>,
}

// =============================================================================
// Error Handling
// =============================================================================

impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            TileError::UnknownLayer { .. } => (StatusCode::NOT_FOUND, "unknown_layer"),
            TileError::UnsupportedLayer { .. } => (StatusCode::BAD_REQUEST, "unsupported_layer"),
            TileError::InvalidCoordinate(GridError::UnsupportedCrs(_)) => {
                (StatusCode::BAD_REQUEST, "unsupported_crs")
            }
            TileError::InvalidCoordinate(_) => (StatusCode::BAD_REQUEST, "invalid_coordinate"),
            TileError::OutOfBounds { .. } => (StatusCode::BAD_REQUEST, "out_of_bounds"),
            TileError::InvalidSize { .. } => (StatusCode::BAD_REQUEST, "invalid_size"),
            TileError::TooManyTiles { .. } => (StatusCode::BAD_REQUEST, "too_many_tiles"),
            TileError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            TileError::UnsupportedFormat { .. } => (StatusCode::BAD_REQUEST, "unsupported_format"),
            TileError::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            TileError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
            TileError::DecodeError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "decode_error"),
            TileError::EncodeError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
            TileError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            error!(status = status.as_u16(), error_type, %message, "request failed");
        } else if status == StatusCode::NOT_FOUND {
            debug!(status = status.as_u16(), error_type, %message, "request failed");
        } else {
            warn!(status = status.as_u16(), error_type, %message, "request failed");
        }

        let body = ErrorResponse::with_status(error_type, message, status);
        (status, Json(body)).into_response()
    }
}

/// Wrapper for handler errors to implement IntoResponse.
pub struct HandlerError(pub TileError);

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        self.0.into_response()
    }
}

impl From<TileError> for HandlerError {
    fn from(err: TileError) -> Self {
        HandlerError(err)
    }
}

impl From<GridError> for HandlerError {
    fn from(err: GridError) -> Self {
        HandlerError(TileError::from(err))
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle native tile requests.
///
/// # Endpoint
///
/// `GET /tiles/{layer}/{z}/{x}/{y}.{ext}`
///
/// The extension may name another image format than the layer stores, in
/// which case the tile is converted. Without an extension the stored bytes
/// are returned as is.
///
/// # Response
///
/// - `200 OK` with the tile bytes and an `X-Tile-Source` header
///   (`memory`, `disk`, `stale` or `upstream`)
/// - `404 Not Found` if the tile does not exist upstream
/// - `502 Bad Gateway` if the upstream failed and nothing is cached
pub async fn tile_handler<F: TileFetcher>(
    State(state): State<AppState<F>>,
    Path(params): Path<TilePathParams>,
) -> Result<Response, HandlerError> {
    let (row, extension) = params.row_and_extension()?;
    let layer = state.tile_service.layer(&params.layer)?;

    let mut request = TileRequest::new(&params.layer, params.z, params.x, row);
    if let Some(ext) = extension {
        if !ext.eq_ignore_ascii_case(&layer.tile_extension) {
            let format =
                OutputFormat::from_extension(ext).ok_or_else(|| TileError::UnsupportedFormat {
                    format: ext.to_string(),
                })?;
            request = request.with_format(format);
        }
    }

    let Some(response) = state.tile_service.get_tile(&request).await? else {
        debug!(
            layer = %params.layer,
            z = params.z,
            x = params.x,
            y = row,
            "tile not found"
        );
        let body = ErrorResponse::with_status(
            "tile_not_found",
            format!("No tile at {}/{}/{}/{}", params.layer, params.z, params.x, row),
            StatusCode::NOT_FOUND,
        );
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, response.mime_type),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={}", state.cache_max_age),
            ),
            (HeaderName::from_static(X_TILE_SOURCE), response.origin.as_str().to_string()),
        ],
        response.data,
    )
        .into_response())
}

/// Handle WMS requests.
///
/// # Endpoint
///
/// `GET /wms?REQUEST=GetMap&LAYERS=a,b&BBOX=minx,miny,maxx,maxy&WIDTH=w&HEIGHT=h&SRS=EPSG:4326&FORMAT=image/png`
///
/// Parameter names are case-insensitive. Only `GetMap` is supported.
pub async fn wms_handler<F: TileFetcher>(
    State(state): State<AppState<F>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, HandlerError> {
    let request = parse_get_map(&params)?;
    let response = state.tile_service.get_map(&request).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, response.format.mime_type().to_string()),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={}", state.cache_max_age),
            ),
            (HeaderName::from_static(X_MAP_ZOOM), response.zoom.to_string()),
            (HeaderName::from_static(X_MAP_TILES), response.tiles_total.to_string()),
            (HeaderName::from_static(X_MAP_TILES_MISSING), response.tiles_missing.to_string()),
        ],
        response.data,
    )
        .into_response())
}

/// Handle health check requests.
///
/// `GET /health` returns `{"status": "healthy", "version": "..."}`.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handle layer list requests.
///
/// `GET /layers` returns the configured layers in configuration order.
pub async fn layers_handler<F: TileFetcher>(
    State(state): State<AppState<F>>,
) -> Json<LayersResponse> {
    let layers = state
        .tile_service
        .registry()
        .iter()
        .map(|layer| LayerSummary::from(layer.as_ref()))
        .collect();
    Json(LayersResponse { layers })
}

// =============================================================================
// WMS parameter parsing
// =============================================================================

/// Turn GetMap query parameters into a [`MapRequest`].
///
/// Missing `WIDTH`/`HEIGHT` are derived from the bbox aspect ratio, with
/// [`DEFAULT_MAP_WIDTH`] when both are absent. `SRS`/`CRS` default to
/// EPSG:4326 and `FORMAT` to `image/jpeg`.
pub fn parse_get_map(params: &HashMap<String, String>) -> Result<MapRequest, TileError> {
    let params: HashMap<String, &str> = params
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    let get = |key: &str| param(&params, key);

    let operation = get("request").unwrap_or("GetMap");
    if !operation.eq_ignore_ascii_case("GetMap") {
        return Err(invalid(format!("unsupported REQUEST {operation:?}, only GetMap is served")));
    }

    let layers: Vec<String> = get("layers")
        .ok_or_else(|| invalid("missing LAYERS"))?
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if layers.is_empty() {
        return Err(invalid("LAYERS names no layer"));
    }

    let bbox = parse_bbox(get("bbox").ok_or_else(|| invalid("missing BBOX"))?)?;

    let crs = match get("srs").or_else(|| get("crs")) {
        Some(code) => Crs::parse(code)?,
        None => Crs::default(),
    };

    let format = match get("format") {
        Some(mime) => OutputFormat::from_mime(mime).ok_or_else(|| TileError::UnsupportedFormat {
            format: mime.to_string(),
        })?,
        None => OutputFormat::Jpeg,
    };

    let width = get("width").map(|v| parse_dimension("WIDTH", v)).transpose()?;
    let height = get("height").map(|v| parse_dimension("HEIGHT", v)).transpose()?;
    let (width, height) = match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (w, h) => {
            let dx = (bbox[2] - bbox[0]).abs();
            let dy = (bbox[3] - bbox[1]).abs();
            if dx == 0.0 || dy == 0.0 {
                return Err(invalid("BBOX has no area"));
            }
            match (w, h) {
                (Some(w), None) => (w, scaled(w, dy / dx)),
                (None, Some(h)) => (scaled(h, dx / dy), h),
                _ => (DEFAULT_MAP_WIDTH, scaled(DEFAULT_MAP_WIDTH, dy / dx)),
            }
        }
    };

    Ok(MapRequest {
        layers,
        bbox: BboxRequest::new(bbox, crs, width, height),
        format,
    })
}

fn param<'a>(params: &HashMap<String, &'a str>, key: &str) -> Option<&'a str> {
    params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_bbox(value: &str) -> Result<[f64; 4], TileError> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid(format!("BBOX {value:?} is not a list of numbers")))?;
    match parts.as_slice() {
        &[a, b, c, d] if parts.iter().all(|v| v.is_finite()) => Ok([a, b, c, d]),
        _ => Err(invalid(format!("BBOX {value:?} needs four finite numbers"))),
    }
}

fn parse_dimension(name: &str, value: &str) -> Result<u32, TileError> {
    value
        .parse::<u32>()
        .map_err(|_| invalid(format!("{name} {value:?} is not a pixel count")))
}

fn scaled(size: u32, ratio: f64) -> u32 {
    ((size as f64 * ratio).round() as u32).max(1)
}

fn invalid(message: impl Into<String>) -> TileError {
    TileError::InvalidRequest {
        message: message.into(),
    }
}
