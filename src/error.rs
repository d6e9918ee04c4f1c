use std::path::PathBuf;

use thiserror::Error;

/// Errors from coordinate and tile-address math.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    /// Geographic point outside the projected plane (or not a number)
    #[error("Invalid coordinate: lon={lon}, lat={lat} is outside the projection domain")]
    InvalidCoordinate { lon: f64, lat: f64 },

    /// Zoom level beyond what the pyramid can address
    #[error("Invalid zoom level: {0} (maximum is {max})", max = crate::grid::MAX_ZOOM)]
    InvalidZoom(u8),

    /// Column or row outside `0..2^zoom`
    #[error("Tile {column}/{row} does not exist at zoom {zoom}")]
    TileOutOfRange { zoom: u8, column: u32, row: u32 },

    /// Bounding box that is empty or contains non-finite values
    #[error("Invalid bounding box: {0}")]
    InvalidBbox(String),

    /// Coordinate reference system other than the supported ones
    #[error("Unsupported CRS: {0} (supported: EPSG:4326, EPSG:3857)")]
    UnsupportedCrs(String),
}

/// Errors from the on-disk tile cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Filesystem operation failed
    #[error("Cache I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors raised while loading configuration or the layers file.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Layers file could not be read
    #[error("Failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    /// Layers file is not valid JSON for the expected schema
    #[error("Failed to parse layers file: {0}")]
    Parse(String),

    /// Semantically invalid setting
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur while resolving or composing tiles.
///
/// A tile that is confirmed absent is not an error; it is reported as
/// [`Resolved::NotFound`](crate::tile::Resolved::NotFound).
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// No layer with this identifier is configured
    #[error("Unknown layer: {layer_id}")]
    UnknownLayer { layer_id: String },

    /// The layer cannot serve this kind of request
    #[error("Layer {layer_id} cannot serve this request: {reason}")]
    UnsupportedLayer { layer_id: String, reason: String },

    /// Malformed or out-of-domain geographic input
    #[error(transparent)]
    InvalidCoordinate(#[from] GridError),

    /// The requested area lies entirely outside the projection domain
    #[error("Requested area is out of bounds: {message}")]
    OutOfBounds { message: String },

    /// Output raster size is zero or larger than allowed
    #[error("Invalid output size {width}x{height} (maximum {max_width}x{max_height})")]
    InvalidSize {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    /// Composite would need more source tiles than allowed
    #[error("Request needs {count} tiles, more than the limit of {limit}")]
    TooManyTiles { count: u64, limit: u64 },

    /// Protocol-level request problem (missing or unparsable parameter)
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Requested output image format is not supported
    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: String },

    /// Upstream failed transiently and no cached copy was available
    #[error("Upstream error: {message}")]
    Upstream { message: String },

    /// Tile cache I/O failure
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Image data could not be decoded
    #[error("Failed to decode image: {message}")]
    DecodeError { message: String },

    /// Image data could not be encoded
    #[error("Failed to encode image: {message}")]
    EncodeError { message: String },

    /// Background task failed unexpectedly
    #[error("Internal error: {message}")]
    Internal { message: String },
}
