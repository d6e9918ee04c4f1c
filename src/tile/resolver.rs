//! Tile resolution policy.
//!
//! ```text
//! memory hit (not past expiry) ──────────────► Tile(Memory)
//! disk: fresh Hit ───────────────────────────► Tile(Disk)
//! disk: NegativeHit ─────────────────────────► NotFound
//! disk: Miss / stale Hit
//!   └─ fetch not allowed (zoom, bounds, no upstream)
//!        ► stale bytes as Tile(Stale), else NotFound
//!   └─ fetch
//!        Bytes          ─► store ───────────► Tile(Upstream)
//!        NotFound       ─► mark_negative ───► NotFound
//!        TransientError ─► stale bytes as Tile(Stale), else Err(Upstream)
//!
//! still NotFound or Err(Upstream), and the layer allows it:
//!   scalable         ─► four children at z+1, downscaled ──► Tile(Derived)
//!   fill_from_parent ─► nearest ancestor, crop upscaled ───► Tile(Derived)
//! ```
//!
//! Memory entries expire when their source would turn stale on disk: file
//! mtime plus the layer TTL, or fetch time plus the TTL. Derived tiles are
//! rebuilt on every request and never cached.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::{debug, warn};

use super::encoder::{decode, ImageEncoder, OutputFormat};
use crate::cache::{CacheLookup, DiskTileStore, TileCache, TileCacheKey, DEFAULT_MEMORY_CACHE_CAPACITY};
use crate::error::TileError;
use crate::fetch::{FetchOutcome, TileFetcher};
use crate::grid::{bounds_for, TileAddress, MAX_ZOOM, TILE_SIZE};
use crate::layer::Layer;

/// How many zoom levels up a missing tile may be filled from. At 8 levels
/// the ancestor crop is a single pixel.
pub const MAX_PARENT_LEVELS: u8 = 8;

/// Where resolved bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOrigin {
    Memory,
    Disk,
    /// Expired cache copy served because no fresh one could be had.
    Stale,
    Upstream,
    /// Built from tiles of a neighbouring zoom level.
    Derived,
}

impl TileOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileOrigin::Memory => "memory",
            TileOrigin::Disk => "disk",
            TileOrigin::Stale => "stale",
            TileOrigin::Upstream => "upstream",
            TileOrigin::Derived => "derived",
        }
    }
}

/// Result of resolving one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Tile { data: Bytes, origin: TileOrigin },
    /// The tile does not exist, either confirmed by upstream or because
    /// there is nowhere to get it from.
    NotFound,
}

impl Resolved {
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Resolved::Tile { data, .. } => Some(data),
            Resolved::NotFound => None,
        }
    }
}

/// Turns tile addresses into bytes using the disk cache and a fetcher.
pub struct TileResolver<F: TileFetcher> {
    store: DiskTileStore,
    memory: TileCache,
    fetcher: F,
    encoder: ImageEncoder,
}

impl<F: TileFetcher> TileResolver<F> {
    /// Create a resolver with the default memory cache.
    pub fn new(fetcher: F) -> Self {
        Self::with_memory_capacity(fetcher, DEFAULT_MEMORY_CACHE_CAPACITY)
    }

    /// Create a resolver whose memory cache holds at most `bytes`
    /// (0 disables it).
    pub fn with_memory_capacity(fetcher: F, bytes: usize) -> Self {
        Self {
            store: DiskTileStore::new(),
            memory: TileCache::with_capacity(bytes),
            fetcher,
            encoder: ImageEncoder::default(),
        }
    }

    /// Encoder for derived tiles of JPEG layers.
    pub fn with_encoder(mut self, encoder: ImageEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn store(&self) -> &DiskTileStore {
        &self.store
    }

    pub fn memory(&self) -> &TileCache {
        &self.memory
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Resolve one tile.
    ///
    /// The column is wrapped modulo `2^zoom` before anything else.
    ///
    /// # Errors
    ///
    /// - `InvalidCoordinate` if the row or zoom is out of range
    /// - `Cache` if the cache cannot be read
    /// - `Upstream` if the upstream failed transiently and neither a cached
    ///   copy nor a derived tile exists
    pub async fn resolve(&self, layer: &Layer, address: &TileAddress) -> Result<Resolved, TileError> {
        let address = address.normalized()?;
        let native = self.resolve_native(layer, &address).await;

        let fallback = (layer.scalable || layer.fill_from_parent)
            && matches!(&native, Ok(Resolved::NotFound) | Err(TileError::Upstream { .. }));
        if !fallback {
            return native;
        }
        match self.derive(layer, &address).await? {
            Some(data) => Ok(Resolved::Tile {
                data,
                origin: TileOrigin::Derived,
            }),
            None => native,
        }
    }

    /// Resolve on a detached task.
    ///
    /// If the caller stops waiting, the fetch and cache write still run to
    /// completion.
    pub async fn resolve_shared(
        self: &Arc<Self>,
        layer: Arc<Layer>,
        address: TileAddress,
    ) -> Result<Resolved, TileError> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move { resolver.resolve(&layer, &address).await })
            .await
            .map_err(|e| TileError::Internal {
                message: format!("tile task failed: {e}"),
            })?
    }

    /// Memory, disk and upstream for exactly this address.
    async fn resolve_native(&self, layer: &Layer, address: &TileAddress) -> Result<Resolved, TileError> {
        let key = TileCacheKey::from(address);

        if let Some(data) = self.memory.get(&key).await {
            return Ok(Resolved::Tile {
                data,
                origin: TileOrigin::Memory,
            });
        }

        let stale = match self.store.lookup(layer, address).await? {
            CacheLookup::Hit {
                data,
                stale: false,
                modified,
            } => {
                self.memory.put(key, data.clone(), expiry(layer, modified)).await;
                return Ok(Resolved::Tile {
                    data,
                    origin: TileOrigin::Disk,
                });
            }
            CacheLookup::Hit { data, stale: true, .. } => Some(data),
            CacheLookup::NegativeHit => return Ok(Resolved::NotFound),
            CacheLookup::Miss => None,
        };

        if let Some(reason) = fetch_blocked(layer, address) {
            debug!(tile = %address, reason, "Not fetching tile");
            return Ok(serve_cached(stale));
        }

        match self.fetcher.fetch(layer, address).await {
            FetchOutcome::Bytes(data) => {
                if let Err(e) = self.store.store(layer, address, &data).await {
                    warn!(tile = %address, error = %e, "Failed to cache fetched tile");
                }
                self.memory
                    .put(key, data.clone(), expiry(layer, SystemTime::now()))
                    .await;
                Ok(Resolved::Tile {
                    data,
                    origin: TileOrigin::Upstream,
                })
            }
            FetchOutcome::NotFound => {
                if let Err(e) = self.store.mark_negative(layer, address).await {
                    warn!(tile = %address, error = %e, "Failed to write negative marker");
                }
                self.memory.remove(&key).await;
                Ok(Resolved::NotFound)
            }
            FetchOutcome::TransientError(message) => match stale {
                Some(data) => {
                    warn!(tile = %address, error = %message, "Upstream failed, serving stale tile");
                    Ok(Resolved::Tile {
                        data,
                        origin: TileOrigin::Stale,
                    })
                }
                None => Err(TileError::Upstream { message }),
            },
        }
    }

    /// Native bytes, with transient upstream failures treated as absent.
    async fn native_bytes(&self, layer: &Layer, address: &TileAddress) -> Result<Option<Bytes>, TileError> {
        match self.resolve_native(layer, address).await {
            Ok(resolved) => Ok(resolved.into_data()),
            Err(TileError::Upstream { message }) => {
                debug!(tile = %address, error = %message, "Upstream failed for neighbouring tile");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Build a missing tile from other zoom levels, children first.
    async fn derive(&self, layer: &Layer, address: &TileAddress) -> Result<Option<Bytes>, TileError> {
        let Some(format) = OutputFormat::from_extension(&layer.tile_extension) else {
            debug!(layer = %layer.id, extension = %layer.tile_extension, "Cannot derive tiles of this format");
            return Ok(None);
        };
        if layer.scalable && address.zoom < layer.max_zoom.min(MAX_ZOOM) {
            if let Some(data) = self.downscale_children(layer, address, format).await? {
                debug!(tile = %address, "Built tile from its children");
                return Ok(Some(data));
            }
        }
        if layer.fill_from_parent {
            if let Some(data) = self.upscale_ancestor(layer, address, format).await? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// All four children must exist; the first missing one ends the attempt.
    async fn downscale_children(
        &self,
        layer: &Layer,
        address: &TileAddress,
        format: OutputFormat,
    ) -> Result<Option<Bytes>, TileError> {
        let mut children = Vec::with_capacity(4);
        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let child = TileAddress {
                layer_id: address.layer_id.clone(),
                zoom: address.zoom + 1,
                column: address.column * 2 + dx,
                row: address.row * 2 + dy,
            };
            match self.native_bytes(layer, &child).await? {
                Some(data) => children.push(data),
                None => return Ok(None),
            }
        }

        let encoder = self.encoder;
        let merged = tokio::task::spawn_blocking(move || merge_children(&children, encoder, format))
            .await
            .map_err(|e| TileError::Internal {
                message: format!("downscale task failed: {e}"),
            })?;
        match merged {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                warn!(tile = %address, error = %e, "Failed to build tile from children");
                Ok(None)
            }
        }
    }

    async fn upscale_ancestor(
        &self,
        layer: &Layer,
        address: &TileAddress,
        format: OutputFormat,
    ) -> Result<Option<Bytes>, TileError> {
        for levels in 1..=address.zoom.min(MAX_PARENT_LEVELS) {
            let ancestor = TileAddress {
                layer_id: address.layer_id.clone(),
                zoom: address.zoom - levels,
                column: address.column >> levels,
                row: address.row >> levels,
            };
            let Some(data) = self.native_bytes(layer, &ancestor).await? else {
                continue;
            };

            let column = address.column - (ancestor.column << levels);
            let row = address.row - (ancestor.row << levels);
            let encoder = self.encoder;
            let cropped = tokio::task::spawn_blocking(move || {
                crop_ancestor(&data, levels, column, row, encoder, format)
            })
            .await
            .map_err(|e| TileError::Internal {
                message: format!("upscale task failed: {e}"),
            })?;
            match cropped {
                Ok(data) => {
                    debug!(tile = %address, ancestor = %ancestor, "Upscaled tile from ancestor");
                    return Ok(Some(data));
                }
                Err(e) => warn!(tile = %ancestor, error = %e, "Unusable ancestor tile"),
            }
        }
        Ok(None)
    }
}

fn serve_cached(stale: Option<Bytes>) -> Resolved {
    match stale {
        Some(data) => Resolved::Tile {
            data,
            origin: TileOrigin::Stale,
        },
        None => Resolved::NotFound,
    }
}

/// When a tile that became fresh at `fresh_since` turns stale.
fn expiry(layer: &Layer, fresh_since: SystemTime) -> Option<SystemTime> {
    layer.ttl.and_then(|ttl| fresh_since.checked_add(ttl))
}

/// Why the upstream must not be asked for this tile, if it must not.
fn fetch_blocked(layer: &Layer, address: &TileAddress) -> Option<&'static str> {
    if !layer.has_upstream() {
        return Some("layer has no upstream");
    }
    if !layer.serves_zoom(address.zoom) {
        return Some("zoom outside layer range");
    }
    if let Some(bounds) = &layer.bounds {
        if !bounds.intersects(&bounds_for(address)) {
            return Some("tile outside layer bounds");
        }
    }
    None
}

// =============================================================================
// Derived tile rasters
// =============================================================================

fn decode_tile(data: &[u8]) -> Result<RgbaImage, TileError> {
    let tile = decode(data)?.to_rgba8();
    if tile.dimensions() == (TILE_SIZE, TILE_SIZE) {
        Ok(tile)
    } else {
        Ok(imageops::resize(&tile, TILE_SIZE, TILE_SIZE, FilterType::Triangle))
    }
}

/// Children in row-major order: NW, NE, SW, SE.
fn merge_children(children: &[Bytes], encoder: ImageEncoder, format: OutputFormat) -> Result<Bytes, TileError> {
    let mut canvas = RgbaImage::new(TILE_SIZE * 2, TILE_SIZE * 2);
    for (i, data) in (0u32..).zip(children) {
        let tile = decode_tile(data)?;
        imageops::replace(
            &mut canvas,
            &tile,
            i64::from(i % 2 * TILE_SIZE),
            i64::from(i / 2 * TILE_SIZE),
        );
    }
    let merged = imageops::resize(&canvas, TILE_SIZE, TILE_SIZE, FilterType::Lanczos3);
    encoder.encode(&merged, format)
}

/// Crop the part of an ancestor `levels` zooms up that covers tile
/// (`column`, `row`) of its descendants, and scale it to a full tile.
fn crop_ancestor(
    data: &[u8],
    levels: u8,
    column: u32,
    row: u32,
    encoder: ImageEncoder,
    format: OutputFormat,
) -> Result<Bytes, TileError> {
    let tile = decode_tile(data)?;
    let size = TILE_SIZE >> levels;
    let crop = imageops::crop_imm(&tile, column * size, row * size, size, size).to_image();
    let upscaled = imageops::resize(&crop, TILE_SIZE, TILE_SIZE, FilterType::Triangle);
    encoder.encode(&upscaled, format)
}

// =============================================================================
// Tests
// =============================================================================
