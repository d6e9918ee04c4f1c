//! HTTP fetcher backed by `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{template, FetchOutcome, TileFetcher};
use crate::error::ConfigError;
use crate::grid::TileAddress;
use crate::layer::Layer;
use crate::tile::{detect_format, ImageEncoder, OutputFormat};

/// Default per-request timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(45);

/// Default number of simultaneous upstream requests.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;

/// Settings shared by all upstream requests.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub user_agent: String,
    /// Headers sent with every request, before the layer's own.
    pub headers: Vec<(String, String)>,
    /// Re-encodes upstream images that are not in the layer's format.
    pub encoder: ImageEncoder,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_concurrent: DEFAULT_FETCH_CONCURRENCY,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: Vec::new(),
            encoder: ImageEncoder::default(),
        }
    }
}

/// Fetches tiles over HTTP(S) using each layer's URL template.
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    encoder: ImageEncoder,
}

impl HttpFetcher {
    /// Build the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed header names or values or
    /// if the TLS backend cannot be initialised.
    pub fn new(config: FetcherConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&config.user_agent)?);
        for (name, value) in &config.headers {
            headers.insert(header_name(name)?, header_value(value)?);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            encoder: config.encoder,
        })
    }

    /// Convert a successful response body into the layer's storage format.
    async fn normalize(&self, layer: &Layer, url: &str, body: Bytes) -> FetchOutcome {
        let Some(wanted) = OutputFormat::from_extension(&layer.tile_extension) else {
            // Stored as-is; only check that it is some kind of image.
            if image::guess_format(&body).is_err() {
                warn!(layer = %layer.id, url = %url, "Upstream response is not an image");
                return FetchOutcome::TransientError(format!("response from {url} is not an image"));
            }
            return FetchOutcome::Bytes(body);
        };
        let Some(found) = detect_format(&body) else {
            warn!(layer = %layer.id, url = %url, "Upstream response is not a PNG or JPEG image");
            return FetchOutcome::TransientError(format!("response from {url} is not an image"));
        };
        if found == wanted {
            return FetchOutcome::Bytes(body);
        }

        debug!(
            layer = %layer.id,
            from = found.mime_type(),
            to = wanted.mime_type(),
            "Re-encoding upstream tile"
        );
        match self.encoder.spawn_reencode(body, wanted).await {
            Ok(converted) => FetchOutcome::Bytes(converted),
            Err(e) => {
                warn!(layer = %layer.id, url = %url, error = %e, "Failed to convert upstream tile");
                FetchOutcome::TransientError(e.to_string())
            }
        }
    }
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    async fn fetch(&self, layer: &Layer, address: &TileAddress) -> FetchOutcome {
        let Some(url_template) = layer.upstream_url_template.as_deref() else {
            return FetchOutcome::TransientError(format!("layer {} has no upstream", layer.id));
        };
        let url = template::expand(url_template, address, layer.upstream_zoom_offset);

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return FetchOutcome::TransientError("fetcher is shut down".into()),
        };

        info!(
            layer = %layer.id,
            z = address.zoom,
            x = address.column,
            y = address.row,
            url = %url,
            "Fetching upstream tile"
        );

        let mut request = self.client.get(&url);
        for (name, value) in &layer.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(layer = %layer.id, url = %url, error = %e, "Upstream request failed");
                return FetchOutcome::TransientError(format!("request to {url} failed: {e}"));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!(layer = %layer.id, url = %url, status = status.as_u16(), "Upstream has no tile");
            return FetchOutcome::NotFound;
        }
        if let Some(dead_tile) = &layer.dead_tile {
            if dead_tile.matches_status(status.as_u16()) {
                debug!(layer = %layer.id, url = %url, status = status.as_u16(), "Dead tile status");
                return FetchOutcome::NotFound;
            }
        }
        if !status.is_success() {
            warn!(layer = %layer.id, url = %url, status = status.as_u16(), "Unexpected upstream status");
            return FetchOutcome::TransientError(format!("HTTP {status} from {url}"));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(layer = %layer.id, url = %url, error = %e, "Failed to read upstream body");
                return FetchOutcome::TransientError(format!("failed to read {url}: {e}"));
            }
        };
        if body.is_empty() {
            warn!(layer = %layer.id, url = %url, "Empty upstream response");
            return FetchOutcome::TransientError(format!("empty response from {url}"));
        }
        if let Some(dead_tile) = &layer.dead_tile {
            if dead_tile.matches_body(&body) {
                debug!(layer = %layer.id, url = %url, "Dead tile body");
                return FetchOutcome::NotFound;
            }
        }

        self.normalize(layer, &url, body).await
    }
}

fn header_name(name: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ConfigError::Invalid(format!("invalid header name {name:?}: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value)
        .map_err(|e| ConfigError::Invalid(format!("invalid header value {value:?}: {e}")))
}
