//! Configuration management.
//!
//! Process-wide settings come from the command line or `TGP_`-prefixed
//! environment variables. Layers are described in a separate JSON file, see
//! [`LayersFile`](crate::layer::LayersFile).
//!
//! # Environment Variables
//!
//! - `TGP_HOST` - Server bind address (default: 0.0.0.0)
//! - `TGP_PORT` - Server port (default: 8080)
//! - `TGP_LAYERS` - Path to the layers file (required)
//! - `TGP_CACHE_DIR` - Cache root, overrides `cache_dir` from the layers file
//! - `TGP_FETCH_TIMEOUT` - Upstream request timeout in seconds (default: 45)
//! - `TGP_FETCH_CONCURRENCY` - Simultaneous upstream requests (default: 16)
//! - `TGP_MAX_IN_FLIGHT` - Tile resolutions in flight per composite (default: 8)
//! - `TGP_MAX_SIZE` - Largest composite width or height in pixels (default: 4096)
//! - `TGP_RESAMPLING` - `nearest` or `bilinear` (default: bilinear)
//! - `TGP_JPEG_QUALITY` - JPEG quality for encoded output (default: 75)
//! - `TGP_MEMORY_CACHE` - In-memory tile cache in MiB, 0 disables (default: 64)
//! - `TGP_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)
//! - `TGP_CORS_ORIGINS` - Allowed CORS origins, comma-separated
//! - `TGP_USER_AGENT` - User-Agent sent upstream

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::fetch::{FetcherConfig, DEFAULT_FETCH_CONCURRENCY};
use crate::server::{RouterConfig, DEFAULT_CACHE_MAX_AGE};
use crate::tile::{
    CompositorConfig, ImageEncoder, Resampling, ServiceConfig, DEFAULT_JPEG_QUALITY,
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_OUTPUT_SIZE, DEFAULT_MAX_TILES,
};

// =============================================================================
// Default Values
// =============================================================================

pub const DEFAULT_HOST: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 8080;

/// Upstream timeout in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 45;

/// In-memory tile cache size in MiB.
pub const DEFAULT_MEMORY_CACHE_MB: usize = 64;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tilegrid-proxy - a caching map tile proxy.
///
/// Serves WMS GetMap and z/x/y tile requests from an on-disk tile pyramid,
/// fetching missing tiles from upstream tile servers.
#[derive(Parser, Debug, Clone)]
#[command(name = "tilegrid-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "TGP_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "TGP_PORT")]
    pub port: u16,

    // =========================================================================
    // Layers and cache
    // =========================================================================
    /// JSON file describing the served layers.
    #[arg(short, long, env = "TGP_LAYERS")]
    pub layers: PathBuf,

    /// Cache root directory. Overrides `cache_dir` in the layers file.
    #[arg(long, env = "TGP_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// In-memory tile cache size in MiB (0 disables it).
    #[arg(long, default_value_t = DEFAULT_MEMORY_CACHE_MB, env = "TGP_MEMORY_CACHE")]
    pub memory_cache: usize,

    // =========================================================================
    // Upstream
    // =========================================================================
    /// Upstream request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_SECS, env = "TGP_FETCH_TIMEOUT")]
    pub fetch_timeout: u64,

    /// Maximum simultaneous upstream requests.
    #[arg(long, default_value_t = DEFAULT_FETCH_CONCURRENCY, env = "TGP_FETCH_CONCURRENCY")]
    pub fetch_concurrency: usize,

    /// User-Agent header sent upstream.
    #[arg(long, env = "TGP_USER_AGENT")]
    pub user_agent: Option<String>,

    // =========================================================================
    // Compositing
    // =========================================================================
    /// Tile resolutions in flight per composed map.
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT, env = "TGP_MAX_IN_FLIGHT")]
    pub max_in_flight: usize,

    /// Largest composed map width or height in pixels.
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_SIZE, env = "TGP_MAX_SIZE")]
    pub max_size: u32,

    /// Resampling used when reprojecting tiles (nearest or bilinear).
    #[arg(long, default_value = "bilinear", env = "TGP_RESAMPLING")]
    pub resampling: Resampling,

    /// JPEG quality for encoded output (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "TGP_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    // =========================================================================
    // HTTP
    // =========================================================================
    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "TGP_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "TGP_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.layers.as_os_str().is_empty() {
            return Err("A layers file is required. Set --layers or TGP_LAYERS".to_string());
        }
        if self.fetch_timeout == 0 {
            return Err("fetch_timeout must be greater than 0".to_string());
        }
        if self.fetch_concurrency == 0 {
            return Err("fetch_concurrency must be greater than 0".to_string());
        }
        if self.max_in_flight == 0 {
            return Err("max_in_flight must be greater than 0".to_string());
        }
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".to_string());
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        if self.memory_cache > 64 * 1024 {
            return Err("memory_cache is in MiB and must not exceed 65536".to_string());
        }
        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        let mut config = FetcherConfig {
            timeout: Duration::from_secs(self.fetch_timeout),
            max_concurrent: self.fetch_concurrency,
            encoder: ImageEncoder::new(self.jpeg_quality),
            ..FetcherConfig::default()
        };
        if let Some(agent) = &self.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            memory_cache_capacity: self.memory_cache * 1024 * 1024,
            compositor: CompositorConfig {
                max_in_flight: self.max_in_flight,
                resampling: self.resampling,
                max_width: self.max_size,
                max_height: self.max_size,
                max_tiles: DEFAULT_MAX_TILES,
            },
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        let config = RouterConfig::new()
            .with_cache_max_age(self.cache_max_age)
            .with_tracing(!self.no_tracing);
        match &self.cors_origins {
            Some(origins) => config.with_cors_origins(origins.clone()),
            None => config,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
