//! Tile service facade.
//!
//! The service is what the protocol adapters talk to. It owns the layer
//! table and wires the resolver, compositor and encoder together:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TileService                          │
//! │   get_tile(layer, z, x, y)        get_map(layers, bbox, …)   │
//! │          │                                 │                 │
//! │          │                        ┌────────▼────────┐        │
//! │          │                        │   Compositor    │        │
//! │          │                        └────────┬────────┘        │
//! │          ▼                                 ▼                 │
//! │   ┌────────────────────────────────────────────────────┐     │
//! │   │  TileResolver (memory ► disk ► upstream fetcher)   │     │
//! │   └────────────────────────────────────────────────────┘     │
//! │          │                                 │                 │
//! │          ▼                                 ▼                 │
//! │      raw tile bytes              ImageEncoder (PNG/JPEG)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::compositor::{BboxRequest, Compositor, CompositorConfig};
use super::encoder::{ImageEncoder, OutputFormat, DEFAULT_JPEG_QUALITY};
use super::resolver::{Resolved, TileOrigin, TileResolver};
use crate::cache::DEFAULT_MEMORY_CACHE_CAPACITY;
use crate::error::TileError;
use crate::fetch::TileFetcher;
use crate::grid::TileAddress;
use crate::layer::{Layer, LayerRegistry};

// =============================================================================
// Configuration
// =============================================================================

/// Settings for [`TileService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bytes of resolved tiles kept in memory (0 disables).
    pub memory_cache_capacity: usize,
    pub compositor: CompositorConfig,
    pub jpeg_quality: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            memory_cache_capacity: DEFAULT_MEMORY_CACHE_CAPACITY,
            compositor: CompositorConfig::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// A single native tile.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub layer_id: String,
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
    /// Convert to this format if the layer stores another one.
    pub format: Option<OutputFormat>,
}

impl TileRequest {
    pub fn new(layer_id: impl Into<String>, zoom: u8, column: u32, row: u32) -> Self {
        Self {
            layer_id: layer_id.into(),
            zoom,
            column,
            row,
            format: None,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TileResponse {
    pub data: Bytes,
    pub origin: TileOrigin,
    pub mime_type: String,
}

/// A rendered map over a bounding box.
#[derive(Debug, Clone)]
pub struct MapRequest {
    /// Layers from bottom to top.
    pub layers: Vec<String>,
    pub bbox: BboxRequest,
    pub format: OutputFormat,
}

#[derive(Debug, Clone)]
pub struct MapResponse {
    pub data: Bytes,
    pub format: OutputFormat,
    pub zoom: u8,
    pub tiles_total: u64,
    pub tiles_missing: u64,
}

// =============================================================================
// Tile Service
// =============================================================================

pub struct TileService<F: TileFetcher> {
    layers: Arc<LayerRegistry>,
    resolver: Arc<TileResolver<F>>,
    compositor: Compositor<F>,
    encoder: ImageEncoder,
}

impl<F: TileFetcher> TileService<F> {
    pub fn new(layers: LayerRegistry, fetcher: F, config: ServiceConfig) -> Self {
        Self::with_shared_registry(Arc::new(layers), fetcher, config)
    }

    pub fn with_shared_registry(layers: Arc<LayerRegistry>, fetcher: F, config: ServiceConfig) -> Self {
        let encoder = ImageEncoder::new(config.jpeg_quality);
        let resolver = Arc::new(
            TileResolver::with_memory_capacity(fetcher, config.memory_cache_capacity).with_encoder(encoder),
        );
        Self {
            layers,
            compositor: Compositor::new(Arc::clone(&resolver), config.compositor),
            resolver,
            encoder,
        }
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.layers
    }

    pub fn resolver(&self) -> &Arc<TileResolver<F>> {
        &self.resolver
    }

    pub fn compositor(&self) -> &Compositor<F> {
        &self.compositor
    }

    /// Look up a layer by id.
    pub fn layer(&self, id: &str) -> Result<Arc<Layer>, TileError> {
        self.layers.get(id).ok_or_else(|| TileError::UnknownLayer {
            layer_id: id.to_string(),
        })
    }

    /// Fetch one native tile. `Ok(None)` means the tile does not exist.
    pub async fn get_tile(&self, request: &TileRequest) -> Result<Option<TileResponse>, TileError> {
        let layer = self.layer(&request.layer_id)?;
        let address = TileAddress {
            layer_id: layer.id.clone(),
            zoom: request.zoom,
            column: request.column,
            row: request.row,
        };

        let (data, origin) = match self.resolver.resolve_shared(Arc::clone(&layer), address).await? {
            Resolved::Tile { data, origin } => (data, origin),
            Resolved::NotFound => return Ok(None),
        };

        let stored = OutputFormat::from_extension(&layer.tile_extension);
        let response = match request.format {
            Some(wanted) if Some(wanted) != stored => TileResponse {
                data: self.encoder.spawn_reencode(data, wanted).await?,
                origin,
                mime_type: wanted.mime_type().to_string(),
            },
            _ => TileResponse {
                data,
                origin,
                mime_type: layer.mime_type.clone(),
            },
        };
        Ok(Some(response))
    }

    /// Render and encode a map over a bounding box.
    pub async fn get_map(&self, request: &MapRequest) -> Result<MapResponse, TileError> {
        let layers = request
            .layers
            .iter()
            .map(|id| self.layer(id))
            .collect::<Result<Vec<_>, _>>()?;

        let raster = self.compositor.compose_layers(&layers, &request.bbox).await?;

        let encoder = self.encoder;
        let format = request.format;
        let image = raster.image;
        let data = tokio::task::spawn_blocking(move || encoder.encode(&image, format))
            .await
            .map_err(|e| TileError::Internal {
                message: format!("encode task failed: {e}"),
            })??;

        Ok(MapResponse {
            data,
            format,
            zoom: raster.zoom,
            tiles_total: raster.tiles_total,
            tiles_missing: raster.tiles_missing,
        })
    }
}
