//! Tile caches.
//!
//! ```text
//! resolve ──► TileCache (memory, LRU, optional)
//!                │ miss
//!                ▼
//!             DiskTileStore ──► {cache_root}/{prefix}/{z}/{x}/{y}.{ext}
//!                                {cache_root}/{prefix}/{z}/{x}/{y}.tne
//! ```
//!
//! The disk store is the source of truth and is shared with other tools;
//! the memory cache only ever holds copies of what the disk store or the
//! upstream returned.

mod memory;
mod store;

pub use memory::{TileCache, TileCacheKey, DEFAULT_MEMORY_CACHE_CAPACITY};
pub use store::{CacheLookup, DiskTileStore};
