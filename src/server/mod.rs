//! HTTP server layer.
//!
//! Thin protocol adapters over [`TileService`](crate::tile::TileService):
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   GET /tiles/{layer}/{z}/{x}/{y}.{ext}    GET /wms?GetMap...    │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │        handlers          │  │          routes             │  │
//! │  │ (params, errors, bodies) │  │  (router, CORS, tracing)    │  │
//! │  └──────────────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    health_handler, layers_handler, parse_get_map, tile_handler, wms_handler, AppState,
    ErrorResponse, HealthResponse, LayerSummary, LayersResponse, TilePathParams,
    DEFAULT_MAP_WIDTH,
};
pub use routes::{create_router, RouterConfig, DEFAULT_CACHE_MAX_AGE};
