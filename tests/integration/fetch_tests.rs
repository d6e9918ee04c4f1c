//! HTTP fetcher tests against a local upstream tile server.
//!
//! Tests verify:
//! - Status code classification (tile, not found, transient)
//! - Dead-tile bodies and statuses
//! - Format conversion of upstream images
//! - Layer headers and zoom offsets
//! - End-to-end resolution into the disk cache

use std::io::Cursor;
use std::sync::Arc;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use md5::Md5;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use tilegrid_proxy::fetch::{FetchOutcome, FetcherConfig, HttpFetcher, TileFetcher};
use tilegrid_proxy::grid::TileAddress;
use tilegrid_proxy::layer::DeadTile;
use tilegrid_proxy::tile::{ServiceConfig, TileOrigin, TileRequest, TileService};
use tilegrid_proxy::{Layer, LayerRegistry};

use super::test_utils::{decode_rgba, is_png, solid_png, GREEN, RED};

// =============================================================================
// Local upstream
// =============================================================================

fn jpeg_tile() -> Bytes {
    let image = RgbImage::from_pixel(256, 256, Rgb([200, 10, 10]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    Bytes::from(out.into_inner())
}

/// Behaviour is keyed on the zoom level.
async fn upstream_tile(
    Path((z, _x, _filename)): Path<(u8, u32, String)>,
    headers: HeaderMap,
) -> Response {
    match z {
        1 => (StatusCode::OK, solid_png(RED)).into_response(),
        2 => StatusCode::NOT_FOUND.into_response(),
        3 => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        4 => (StatusCode::OK, solid_png(GREEN)).into_response(),
        5 => (StatusCode::OK, jpeg_tile()).into_response(),
        6 => (StatusCode::OK, Bytes::new()).into_response(),
        7 => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        8 if headers.get("x-api-key").is_some_and(|v| v == "secret") => {
            (StatusCode::OK, solid_png(RED)).into_response()
        }
        8 => StatusCode::FORBIDDEN.into_response(),
        9 => (StatusCode::OK, "<html>maintenance</html>").into_response(),
        _ => StatusCode::GONE.into_response(),
    }
}

async fn start_upstream() -> String {
    let app = Router::new().route("/{z}/{x}/{filename}", get(upstream_tile));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn layer(root: &std::path::Path, base: &str) -> Layer {
    Layer::new("remote", root.to_path_buf())
        .with_extension("png")
        .with_upstream(format!("{base}/{{z}}/{{x}}/{{y}}.png"))
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(FetcherConfig::default()).unwrap()
}

async fn fetch(fetcher: &HttpFetcher, layer: &Layer, zoom: u8) -> FetchOutcome {
    let address = TileAddress::new(&layer.id, zoom, 0, 0).unwrap();
    fetcher.fetch(layer, &address).await
}

// =============================================================================
// Status classification
// =============================================================================

#[tokio::test]
async fn test_fetch_statuses() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    let layer = layer(dir.path(), &base);
    let fetcher = fetcher();

    assert_eq!(fetch(&fetcher, &layer, 1).await, FetchOutcome::Bytes(solid_png(RED)));
    assert_eq!(fetch(&fetcher, &layer, 2).await, FetchOutcome::NotFound);
    assert_eq!(fetch(&fetcher, &layer, 10).await, FetchOutcome::NotFound);
    assert!(matches!(
        fetch(&fetcher, &layer, 3).await,
        FetchOutcome::TransientError(_)
    ));
    assert!(matches!(
        fetch(&fetcher, &layer, 6).await,
        FetchOutcome::TransientError(_)
    ));
    assert!(matches!(
        fetch(&fetcher, &layer, 9).await,
        FetchOutcome::TransientError(_)
    ));
}

#[tokio::test]
async fn test_unreachable_upstream_is_transient() {
    let dir = TempDir::new().unwrap();
    // Bind then drop to get a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let layer = layer(dir.path(), &format!("http://{addr}"));
    assert!(matches!(
        fetch(&fetcher(), &layer, 1).await,
        FetchOutcome::TransientError(_)
    ));
}

// =============================================================================
// Dead tiles, formats, headers
// =============================================================================

#[tokio::test]
async fn test_dead_tiles_are_not_found() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    let digest = hex::encode(Sha256::digest(&solid_png(GREEN)));
    let layer = layer(dir.path(), &base).with_dead_tile(DeadTile {
        sha256: vec![digest],
        http_status: Some(503),
        ..DeadTile::default()
    });
    let fetcher = fetcher();

    assert_eq!(fetch(&fetcher, &layer, 4).await, FetchOutcome::NotFound);
    assert_eq!(fetch(&fetcher, &layer, 7).await, FetchOutcome::NotFound);
    // Other tiles are unaffected.
    assert!(matches!(fetch(&fetcher, &layer, 1).await, FetchOutcome::Bytes(_)));
}

#[tokio::test]
async fn test_md5_dead_tile_is_not_found() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    let digest = hex::encode(Md5::digest(&solid_png(GREEN)));
    let layer = layer(dir.path(), &base).with_dead_tile(DeadTile {
        md5: vec![digest],
        ..DeadTile::default()
    });
    let fetcher = fetcher();

    assert_eq!(fetch(&fetcher, &layer, 4).await, FetchOutcome::NotFound);
    assert_eq!(fetch(&fetcher, &layer, 1).await, FetchOutcome::Bytes(solid_png(RED)));
    // Without a matching status the 503 stays transient.
    assert!(matches!(
        fetch(&fetcher, &layer, 7).await,
        FetchOutcome::TransientError(_)
    ));
}

#[tokio::test]
async fn test_jpeg_upstream_converted_for_png_layer() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    let layer = layer(dir.path(), &base);

    let FetchOutcome::Bytes(data) = fetch(&fetcher(), &layer, 5).await else {
        panic!("expected tile bytes");
    };
    assert!(is_png(&data));
    let image = decode_rgba(&data);
    assert_eq!(image.dimensions(), (256, 256));
    let pixel = image.get_pixel(128, 128).0;
    assert!(pixel[0] > 150 && pixel[1] < 60 && pixel[3] == 255);
}

#[tokio::test]
async fn test_layer_headers_are_sent() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    let fetcher = fetcher();

    let without = layer(dir.path(), &base);
    assert!(matches!(
        fetch(&fetcher, &without, 8).await,
        FetchOutcome::TransientError(_)
    ));

    let with = layer(dir.path(), &base).with_header("X-Api-Key", "secret");
    assert!(matches!(fetch(&fetcher, &with, 8).await, FetchOutcome::Bytes(_)));
}

#[tokio::test]
async fn test_zoom_offset_applies_to_url() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    // Local zoom 2 is upstream zoom 1.
    let layer = layer(dir.path(), &base).with_upstream_zoom_offset(1);

    assert!(matches!(fetch(&fetcher(), &layer, 2).await, FetchOutcome::Bytes(_)));
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_service_caches_upstream_tiles() {
    let base = start_upstream().await;
    let dir = TempDir::new().unwrap();
    let registry = LayerRegistry::new(vec![layer(dir.path(), &base)]).unwrap();
    let service = Arc::new(TileService::new(
        registry,
        fetcher(),
        ServiceConfig {
            memory_cache_capacity: 0,
            ..ServiceConfig::default()
        },
    ));

    let request = TileRequest::new("remote", 1, 1, 0);
    let first = service.get_tile(&request).await.unwrap().unwrap();
    assert_eq!(first.origin, TileOrigin::Upstream);
    assert_eq!(first.mime_type, "image/png");
    assert!(dir.path().join("remote/1/1/0.png").is_file());

    let second = service.get_tile(&request).await.unwrap().unwrap();
    assert_eq!(second.origin, TileOrigin::Disk);
    assert_eq!(second.data, first.data);

    let missing = TileRequest::new("remote", 2, 1, 1);
    assert!(service.get_tile(&missing).await.unwrap().is_none());
    assert!(dir.path().join("remote/2/1/1.tne").is_file());
}
