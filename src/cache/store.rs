//! On-disk tile store.
//!
//! The cache directory is shared with external tools (SAS.Planet, MOBAC,
//! JOSM), so all state lives in the files themselves:
//!
//! - a tile file is fresh or stale by its mtime against the layer TTL
//! - an empty `.tne` file marks a tile the upstream does not have; it
//!   expires after the layer's negative TTL, counted from its mtime
//! - if both exist, the newer of the two wins
//!
//! Writers never expose partial files: data goes to a uniquely named
//! temporary file in the target directory and is renamed into place.
//! Concurrent writers of the same tile race benignly; the last rename wins.

use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::CacheError;
use crate::grid::{negative_marker_path_for, path_for, TileAddress};
use crate::layer::Layer;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Tile bytes; `stale` once the file is older than the layer TTL.
    Hit {
        data: Bytes,
        stale: bool,
        /// File mtime, the start of the tile's TTL.
        modified: SystemTime,
    },
    /// A live negative marker: the upstream recently reported no tile.
    NegativeHit,
    /// Nothing usable on disk.
    Miss,
}

/// Tile files and negative markers under each layer's cache root.
#[derive(Debug, Default)]
pub struct DiskTileStore {
    temp_counter: AtomicU64,
}

impl DiskTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute path of a tile file.
    pub fn tile_path(&self, layer: &Layer, address: &TileAddress) -> PathBuf {
        layer.cache_root.join(path_for(layer, address))
    }

    /// Absolute path of a tile's negative marker.
    pub fn negative_path(&self, layer: &Layer, address: &TileAddress) -> PathBuf {
        layer
            .cache_root
            .join(negative_marker_path_for(layer, address))
    }

    /// Read the cache state of one tile.
    ///
    /// A zero-length tile file counts as a miss; it is what an interrupted
    /// external writer leaves behind.
    pub async fn lookup(&self, layer: &Layer, address: &TileAddress) -> Result<CacheLookup, CacheError> {
        let tile_path = self.tile_path(layer, address);
        let marker_path = self.negative_path(layer, address);
        let tile = metadata(&tile_path).await?;
        let marker = metadata(&marker_path).await?;
        let now = SystemTime::now();

        if let Some(marker) = &marker {
            let shadowed = tile
                .as_ref()
                .is_some_and(|tile| modified(tile) > modified(marker));
            if !shadowed && !is_expired(marker, Some(layer.negative_ttl), now) {
                debug!(path = %marker_path.display(), "Negative cache hit");
                return Ok(CacheLookup::NegativeHit);
            }
        }

        let Some(tile) = tile else {
            return Ok(CacheLookup::Miss);
        };
        if tile.len() == 0 {
            debug!(path = %tile_path.display(), "Ignoring empty tile file");
            return Ok(CacheLookup::Miss);
        }

        match tokio::fs::read(&tile_path).await {
            Ok(data) => {
                let stale = is_expired(&tile, layer.ttl, now);
                debug!(path = %tile_path.display(), stale, "Cache hit");
                Ok(CacheLookup::Hit {
                    data: Bytes::from(data),
                    stale,
                    modified: modified(&tile),
                })
            }
            // Removed between stat and read.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CacheLookup::Miss),
            Err(e) => Err(CacheError::io(&tile_path, e)),
        }
    }

    /// Write a tile and clear its negative marker.
    ///
    /// If the file already holds exactly these bytes only its mtime is
    /// refreshed, so unchanged tiles are not rewritten.
    pub async fn store(&self, layer: &Layer, address: &TileAddress, data: &[u8]) -> Result<(), CacheError> {
        let path = self.tile_path(layer, address);
        let unchanged = match tokio::fs::read(&path).await {
            Ok(existing) => existing == data,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        if unchanged {
            touch(&path).await?;
            debug!(path = %path.display(), "Tile unchanged, refreshed mtime");
        } else {
            self.write_atomic(&path, data).await?;
            debug!(path = %path.display(), bytes = data.len(), "Stored tile");
        }

        let marker = self.negative_path(layer, address);
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => debug!(path = %marker.display(), "Removed negative marker"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&marker, e)),
        }
        Ok(())
    }

    /// Write or refresh the empty negative marker for a tile.
    ///
    /// An existing tile file is left in place; the marker shadows it for
    /// as long as it is the newer of the two.
    pub async fn mark_negative(&self, layer: &Layer, address: &TileAddress) -> Result<(), CacheError> {
        let marker = self.negative_path(layer, address);
        self.write_atomic(&marker, &[]).await?;
        debug!(path = %marker.display(), "Wrote negative marker");
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        let temp_path = self.temp_path(path);
        if let Err(e) = write_synced(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CacheError::io(&temp_path, e));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CacheError::io(path, e));
        }
        Ok(())
    }

    /// Unique per process and per write, hidden, in the target's directory.
    fn temp_path(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sequence = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        path.with_file_name(format!(".{name}.{}.{sequence}.tmp", std::process::id()))
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

async fn touch(path: &Path) -> Result<(), CacheError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&owned)?
            .set_modified(SystemTime::now())
    })
    .await
    .map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?
    .map_err(|e| CacheError::io(path, e))
}

async fn metadata(path: &Path) -> Result<Option<Metadata>, CacheError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn modified(meta: &Metadata) -> SystemTime {
    meta.modified().unwrap_or(UNIX_EPOCH)
}

/// Files with an mtime in the future are never expired.
fn is_expired(meta: &Metadata, ttl: Option<Duration>, now: SystemTime) -> bool {
    let Some(ttl) = ttl else {
        return false;
    };
    now.duration_since(modified(meta))
        .is_ok_and(|age| age > ttl)
}

// =============================================================================
// Tests
// =============================================================================
