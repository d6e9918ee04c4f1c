//! On-disk cache layouts.
//!
//! Two directory schemes are supported, both readable by SAS.Planet/MOBAC
//! style tools:
//!
//! ```text
//! XYZ: {z}/{x}/{y}.{ext}          e.g. 3/5/2.jpg
//! GMT: z{z+1}/{y}/{x}.{ext}       e.g. z4/2/5.jpg
//! ```
//!
//! GMT zoom directories are numbered from 1, so `z1` holds the single
//! global tile that XYZ stores under `0/`. A negative marker lives at the
//! tile's path with the extension replaced by `tne`.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::address::TileAddress;
use super::MAX_ZOOM;
use crate::layer::Layer;

/// Extension of the empty "tile does not exist upstream" marker.
pub const NEGATIVE_MARKER_EXTENSION: &str = "tne";

/// Directory scheme of a layer's tile cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayout {
    /// `{z}/{x}/{y}.{ext}`
    #[default]
    Xyz,
    /// `z{z+1}/{y}/{x}.{ext}`
    Gmt,
}

impl CacheLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLayout::Xyz => "xyz",
            CacheLayout::Gmt => "gmt",
        }
    }

    /// Relative path of a tile file under a layer's cache prefix.
    pub fn relative_path(&self, zoom: u8, column: u32, row: u32, extension: &str) -> PathBuf {
        let mut path = PathBuf::new();
        match self {
            CacheLayout::Xyz => {
                path.push(zoom.to_string());
                path.push(column.to_string());
                path.push(format!("{row}.{extension}"));
            }
            CacheLayout::Gmt => {
                path.push(format!("z{}", u16::from(zoom) + 1));
                path.push(row.to_string());
                path.push(format!("{column}.{extension}"));
            }
        }
        path
    }

    /// Parse `(zoom, column, row, extension)` from a relative path.
    pub fn parse_relative(&self, path: &Path) -> Option<(u8, u32, u32, String)> {
        let mut parts = path.components().map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        });
        let zoom_dir = parts.next()??;
        let middle_dir = parts.next()??;
        let file = parts.next()??;
        if parts.next().is_some() {
            return None;
        }

        let (stem, extension) = file.rsplit_once('.')?;
        if extension.is_empty() {
            return None;
        }

        let (zoom, column, row) = match self {
            CacheLayout::Xyz => (zoom_dir.parse::<u8>().ok()?, middle_dir, stem),
            CacheLayout::Gmt => {
                let level = zoom_dir.strip_prefix('z')?.parse::<u8>().ok()?;
                (level.checked_sub(1)?, stem, middle_dir)
            }
        };
        if zoom > MAX_ZOOM {
            return None;
        }
        Some((
            zoom,
            parse_index(column)?,
            parse_index(row)?,
            extension.to_string(),
        ))
    }
}

/// Plain decimal with no sign or leading zeros, so every index has a
/// single spelling on disk.
fn parse_index(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if text.len() > 1 && text.starts_with('0') {
        return None;
    }
    text.parse().ok()
}

/// Path of a tile relative to the layer's cache root.
pub fn path_for(layer: &Layer, address: &TileAddress) -> PathBuf {
    layer.cache_prefix.join(layer.layout.relative_path(
        address.zoom,
        address.column,
        address.row,
        &layer.tile_extension,
    ))
}

/// Path of the negative marker for a tile, relative to the cache root.
pub fn negative_marker_path_for(layer: &Layer, address: &TileAddress) -> PathBuf {
    layer.cache_prefix.join(layer.layout.relative_path(
        address.zoom,
        address.column,
        address.row,
        NEGATIVE_MARKER_EXTENSION,
    ))
}

/// Recover the address of a tile file from its path relative to the cache
/// root. Returns `None` for paths outside the layer's prefix, markers,
/// files with another extension and out-of-range indices.
pub fn address_from_path(layer: &Layer, relative: &Path) -> Option<TileAddress> {
    let inner = relative.strip_prefix(&layer.cache_prefix).ok()?;
    let (zoom, column, row, extension) = layer.layout.parse_relative(inner)?;
    if extension != layer.tile_extension {
        return None;
    }
    TileAddress::new(layer.id.clone(), zoom, column, row).ok()
}

// =============================================================================
// Tests
// =============================================================================
