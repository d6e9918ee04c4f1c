//! Upstream tile fetching.
//!
//! A fetcher performs exactly one attempt per call with a bounded timeout;
//! retry policy belongs to the caller (the resolver simply tries again on
//! the next request). Results are reported as a three-way [`FetchOutcome`]
//! rather than an error so the resolver can tell "confirmed absent" (cache
//! negatively) from "temporarily unavailable" (do not cache).

mod http;
pub mod template;

pub use http::{FetcherConfig, HttpFetcher, DEFAULT_FETCH_CONCURRENCY, DEFAULT_FETCH_TIMEOUT};

use async_trait::async_trait;
use bytes::Bytes;

use crate::grid::TileAddress;
use crate::layer::Layer;

/// Result of one upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Image bytes in the layer's storage format.
    Bytes(Bytes),
    /// Upstream confirmed the tile does not exist.
    NotFound,
    /// Timeout, network failure or unexpected response.
    TransientError(String),
}

/// Source of tiles missing from the cache.
#[async_trait]
pub trait TileFetcher: Send + Sync + 'static {
    /// Fetch one tile of `layer`.
    async fn fetch(&self, layer: &Layer, address: &TileAddress) -> FetchOutcome;
}
