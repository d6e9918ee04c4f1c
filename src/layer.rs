//! Layer definitions and the layers file.
//!
//! Layers are loaded once at startup from a JSON file and shared read-only
//! through an [`Arc<LayerRegistry>`](LayerRegistry):
//!
//! ```json
//! {
//!   "cache_dir": "/var/cache/tiles",
//!   "headers": { "Referer": "https://example.org/" },
//!   "layers": [
//!     {
//!       "id": "osm",
//!       "name": "OpenStreetMap",
//!       "url": "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
//!       "extension": "png",
//!       "max_zoom": 19,
//!       "ttl": 604800
//!     },
//!     { "id": "scan", "layout": "gmt", "extension": "jpg" }
//!   ]
//! }
//! ```
//!
//! Durations are in seconds. A layer without `url` serves only what is
//! already in its cache.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::Rgba;
use md5::Md5;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::fetch::template;
use crate::grid::{CacheLayout, GeoBounds, MAX_LATITUDE, MAX_ZOOM};

// =============================================================================
// Defaults
// =============================================================================

/// Default storage extension.
pub const DEFAULT_TILE_EXTENSION: &str = "jpg";

/// Default highest zoom level served.
pub const DEFAULT_MAX_ZOOM: u8 = 19;

/// Default lifetime of a negative marker (30 days).
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

// =============================================================================
// Layer
// =============================================================================

/// Known placeholder tiles an upstream returns instead of a 404.
///
/// Placeholders are listed by MD5 (the digest JOSM imagery entries use)
/// or SHA-256, as lowercase hex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadTile {
    pub md5: Vec<String>,
    pub sha256: Vec<String>,
    /// HTTP status that means "no tile here".
    pub http_status: Option<u16>,
}

impl DeadTile {
    /// Whether the body is one of the known placeholders.
    pub fn matches_body(&self, body: &[u8]) -> bool {
        if !self.md5.is_empty() {
            let digest = hex::encode(Md5::digest(body));
            if self.md5.contains(&digest) {
                return true;
            }
        }
        if !self.sha256.is_empty() {
            let digest = hex::encode(Sha256::digest(body));
            if self.sha256.contains(&digest) {
                return true;
            }
        }
        false
    }

    pub fn matches_status(&self, status: u16) -> bool {
        self.http_status == Some(status)
    }
}

/// One tile pyramid: where it is cached and where missing tiles come from.
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: String,
    pub name: String,
    /// Upstream URL with placeholders, see [`crate::fetch::template`].
    pub upstream_url_template: Option<String>,
    /// Root directory shared by all layers' caches.
    pub cache_root: PathBuf,
    /// Directory of this layer under the cache root.
    pub cache_prefix: PathBuf,
    pub tile_extension: String,
    pub mime_type: String,
    pub layout: CacheLayout,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Age after which a cached tile is stale. `None` never expires.
    pub ttl: Option<Duration>,
    pub negative_ttl: Duration,
    /// Extra request headers for this layer's upstream.
    pub headers: Vec<(String, String)>,
    pub dead_tile: Option<DeadTile>,
    /// Geographic area outside which nothing is fetched.
    pub bounds: Option<GeoBounds>,
    /// Subtracted from the zoom before it is substituted into the URL.
    pub upstream_zoom_offset: u8,
    /// Build missing tiles from their four children one zoom level down.
    pub scalable: bool,
    /// Serve missing tiles as an upscaled crop of the nearest ancestor.
    pub fill_from_parent: bool,
    /// Colour of missing tiles in composites. `None` leaves them transparent.
    pub empty_color: Option<Rgba<u8>>,
}

impl Layer {
    /// A cache-only layer with default settings, cached under `{cache_root}/{id}`.
    pub fn new(id: impl Into<String>, cache_root: PathBuf) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            cache_prefix: PathBuf::from(&id),
            id,
            upstream_url_template: None,
            cache_root,
            tile_extension: DEFAULT_TILE_EXTENSION.to_string(),
            mime_type: mime_for_extension(DEFAULT_TILE_EXTENSION).to_string(),
            layout: CacheLayout::Xyz,
            min_zoom: 0,
            max_zoom: DEFAULT_MAX_ZOOM,
            ttl: None,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            headers: Vec::new(),
            dead_tile: None,
            bounds: None,
            upstream_zoom_offset: 0,
            scalable: false,
            fill_from_parent: false,
            empty_color: None,
        }
    }

    pub fn with_upstream(mut self, template: impl Into<String>) -> Self {
        self.upstream_url_template = Some(template.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.tile_extension = extension.into().to_ascii_lowercase();
        self.mime_type = mime_for_extension(&self.tile_extension).to_string();
        self
    }

    pub fn with_layout(mut self, layout: CacheLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_cache_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    pub fn with_bounds(mut self, bounds: GeoBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_dead_tile(mut self, dead_tile: DeadTile) -> Self {
        self.dead_tile = Some(dead_tile);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_upstream_zoom_offset(mut self, offset: u8) -> Self {
        self.upstream_zoom_offset = offset;
        self
    }

    pub fn with_scalable(mut self, scalable: bool) -> Self {
        self.scalable = scalable;
        self
    }

    pub fn with_fill_from_parent(mut self, fill: bool) -> Self {
        self.fill_from_parent = fill;
        self
    }

    pub fn with_empty_color(mut self, color: Rgba<u8>) -> Self {
        self.empty_color = Some(color);
        self
    }

    /// Whether missing tiles can be fetched at all.
    pub fn has_upstream(&self) -> bool {
        self.upstream_url_template.is_some()
    }

    /// Whether `zoom` lies inside the layer's zoom range.
    pub fn serves_zoom(&self, zoom: u8) -> bool {
        (self.min_zoom..=self.max_zoom).contains(&zoom)
    }
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`. Colours without alpha are opaque.
pub fn parse_color(text: &str) -> Option<Rgba<u8>> {
    let digits = text.strip_prefix('#')?;
    if !digits.is_ascii() {
        return None;
    }
    let channel = |i: usize, width: usize| {
        let value = u8::from_str_radix(digits.get(i * width..(i + 1) * width)?, 16).ok()?;
        Some(if width == 1 { value * 17 } else { value })
    };
    match digits.len() {
        3 => Some(Rgba([channel(0, 1)?, channel(1, 1)?, channel(2, 1)?, 255])),
        6 => Some(Rgba([channel(0, 2)?, channel(1, 2)?, channel(2, 2)?, 255])),
        8 => Some(Rgba([channel(0, 2)?, channel(1, 2)?, channel(2, 2)?, channel(3, 2)?])),
        _ => None,
    }
}

/// MIME type for a tile file extension.
pub fn mime_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

// =============================================================================
// Layers file
// =============================================================================

/// Top level of the layers file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayersFile {
    pub cache_dir: Option<PathBuf>,
    /// Headers sent to every upstream.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub layers: Vec<LayerConfig>,
}

/// One layer entry in the layers file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerConfig {
    pub id: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub prefix: Option<PathBuf>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub layout: CacheLayout,
    #[serde(default)]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    /// Seconds.
    pub ttl: Option<u64>,
    /// Seconds.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub dead_tile: Option<DeadTileConfig>,
    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub bounds: Option<[f64; 4]>,
    #[serde(default)]
    pub zoom_offset: u8,
    #[serde(default)]
    pub scalable: bool,
    #[serde(default)]
    pub fill_from_parent: bool,
    /// `#rrggbb` or `#rrggbbaa`
    pub empty_color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadTileConfig {
    #[serde(default)]
    pub md5: Vec<String>,
    #[serde(default)]
    pub sha256: Vec<String>,
    pub http_status: Option<u16>,
}

fn default_extension() -> String {
    DEFAULT_TILE_EXTENSION.to_string()
}

fn default_max_zoom() -> u8 {
    DEFAULT_MAX_ZOOM
}

fn default_negative_ttl() -> u64 {
    DEFAULT_NEGATIVE_TTL.as_secs()
}

impl LayerConfig {
    fn into_layer(
        self,
        cache_root: &Path,
        shared_headers: &BTreeMap<String, String>,
    ) -> Result<Layer, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid(format!("layer {}: {reason}", self.id));

        if self.id.is_empty() || self.id.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "layer id {:?} must be non-empty and contain no path separators",
                self.id
            )));
        }
        let extension = self.extension.trim_start_matches('.').to_ascii_lowercase();
        if extension.is_empty() || extension == crate::grid::NEGATIVE_MARKER_EXTENSION {
            return Err(invalid(format!("invalid tile extension {:?}", self.extension)));
        }
        if self.max_zoom > MAX_ZOOM {
            return Err(invalid(format!(
                "max_zoom {} exceeds {MAX_ZOOM}",
                self.max_zoom
            )));
        }
        if let Some(url) = &self.url {
            template::validate(url).map_err(&invalid)?;
            if self.zoom_offset > self.min_zoom {
                return Err(invalid(format!(
                    "zoom_offset {} is larger than min_zoom {}",
                    self.zoom_offset, self.min_zoom
                )));
            }
        }
        let bounds = match self.bounds {
            Some([min_lon, min_lat, max_lon, max_lat]) => {
                if !(min_lon < max_lon && min_lat < max_lat) {
                    return Err(invalid("bounds must be [min_lon, min_lat, max_lon, max_lat]".into()));
                }
                Some(GeoBounds::new(
                    min_lon,
                    min_lat.max(-MAX_LATITUDE),
                    max_lon,
                    max_lat.min(MAX_LATITUDE),
                ))
            }
            None => None,
        };
        let dead_tile = match self.dead_tile {
            Some(config) => Some(DeadTile {
                md5: digests(&config.md5, 16, "MD5").map_err(&invalid)?,
                sha256: digests(&config.sha256, 32, "SHA-256").map_err(&invalid)?,
                http_status: config.http_status,
            }),
            None => None,
        };
        let empty_color = match &self.empty_color {
            Some(text) => Some(
                parse_color(text).ok_or_else(|| invalid(format!("empty_color {text:?} is not a #rrggbb colour")))?,
            ),
            None => None,
        };

        let mut headers: BTreeMap<String, String> = shared_headers.clone();
        headers.extend(self.headers);

        Ok(Layer {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            cache_prefix: self.prefix.unwrap_or_else(|| PathBuf::from(&self.id)),
            upstream_url_template: self.url,
            cache_root: cache_root.to_path_buf(),
            mime_type: mime_for_extension(&extension).to_string(),
            tile_extension: extension,
            layout: self.layout,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            ttl: self.ttl.map(Duration::from_secs),
            negative_ttl: Duration::from_secs(self.negative_ttl),
            headers: headers.into_iter().collect(),
            dead_tile,
            bounds,
            upstream_zoom_offset: self.zoom_offset,
            scalable: self.scalable,
            fill_from_parent: self.fill_from_parent,
            empty_color,
            id: self.id,
        })
    }
}

/// Lowercase hex digests, each `len` bytes long.
fn digests(values: &[String], len: usize, kind: &str) -> Result<Vec<String>, String> {
    values
        .iter()
        .map(|digest| {
            let digest = digest.to_ascii_lowercase();
            match hex::decode(&digest) {
                Ok(bytes) if bytes.len() == len => Ok(digest),
                _ => Err(format!("dead_tile {digest:?} is not an {kind} digest")),
            }
        })
        .collect()
}

// =============================================================================
// LayerRegistry
// =============================================================================

/// Immutable table of configured layers, in file order.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: Vec<Arc<Layer>>,
}

impl LayerRegistry {
    /// Build a registry from already constructed layers.
    pub fn new(layers: Vec<Layer>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate layer id {:?}", layer.id)));
            }
        }
        Ok(Self {
            layers: layers.into_iter().map(Arc::new).collect(),
        })
    }

    /// Load and validate a layers file.
    ///
    /// `cache_dir` overrides the file's `cache_dir`; one of them must be set.
    pub fn from_file(path: &Path, cache_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let file: LayersFile =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_config(file, cache_dir)
    }

    /// Validate a parsed layers file.
    pub fn from_config(file: LayersFile, cache_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let cache_root = cache_dir
            .map(Path::to_path_buf)
            .or(file.cache_dir)
            .ok_or_else(|| {
                ConfigError::Invalid("no cache directory given (cache_dir or --cache-dir)".into())
            })?;

        let layers = file
            .layers
            .into_iter()
            .map(|config| config.into_layer(&cache_root, &file.headers))
            .collect::<Result<Vec<_>, _>>()?;

        let mut prefixes = HashSet::new();
        for layer in &layers {
            if !prefixes.insert(layer.cache_prefix.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "layer {}: cache prefix {} is used by another layer",
                    layer.id,
                    layer.cache_prefix.display()
                )));
            }
        }

        Self::new(layers)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Layer>> {
        self.layers.iter().find(|layer| layer.id == id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Layer>> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
