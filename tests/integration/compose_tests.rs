//! Compositor tests over mocked upstream tiles.
//!
//! Tests verify:
//! - A bbox equal to one tile reproduces that tile exactly
//! - Missing tiles leave transparent holes
//! - Zoom selection for whole-world requests
//! - Vertical flips and antimeridian-crossing requests
//! - Bboxes shifted by whole worlds
//! - Layer fill colour for missing tiles
//! - Request limits

use std::sync::Arc;

use image::{imageops, Rgba};
use tempfile::TempDir;

use tilegrid_proxy::fetch::FetchOutcome;
use tilegrid_proxy::grid::{Crs, HALF_CIRCUMFERENCE};
use tilegrid_proxy::tile::{
    BboxRequest, Compositor, CompositorConfig, Resampling, TileResolver,
};
use tilegrid_proxy::{Layer, TileError};

use super::test_utils::{
    gradient_image, gradient_png, png_layer, solid_png, MockFetcher, BLUE, GREEN, RED, YELLOW,
};

const H: f64 = HALF_CIRCUMFERENCE;

fn compositor(fetcher: MockFetcher) -> Compositor<MockFetcher> {
    let config = CompositorConfig {
        resampling: Resampling::Nearest,
        ..CompositorConfig::default()
    };
    Compositor::new(Arc::new(TileResolver::new(fetcher)), config)
}

fn layer(dir: &TempDir) -> Arc<Layer> {
    Arc::new(png_layer(dir.path(), "base"))
}

// =============================================================================
// Pixel fidelity
// =============================================================================

#[tokio::test]
async fn test_single_tile_bbox_reproduces_tile() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::not_found().with(1, 0, 0, FetchOutcome::Bytes(gradient_png(7)));
    let compositor = compositor(fetcher.clone());

    // North-west quadrant of the world, exactly tile 1/0/0.
    let request = BboxRequest::new([-H, 0.0, 0.0, H], Crs::Epsg3857, 256, 256);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert_eq!(raster.zoom, 1);
    assert_eq!(raster.tiles_total, 1);
    assert_eq!(raster.tiles_missing, 0);
    assert_eq!(fetcher.requested(), vec![(1, 0, 0)]);
    assert!(raster.image == gradient_image(7), "composite differs from source tile");
}

#[tokio::test]
async fn test_flipped_bbox_flips_output() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(|_| FetchOutcome::Bytes(gradient_png(3)));
    let compositor = compositor(fetcher);

    let request = BboxRequest::new([-H, H, 0.0, 0.0], Crs::Epsg3857, 256, 256);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert!(raster.image == imageops::flip_vertical(&gradient_image(3)));
}

#[tokio::test]
async fn test_missing_tile_leaves_transparent_hole() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::not_found()
        .with(1, 0, 0, FetchOutcome::Bytes(solid_png(RED)))
        .with(1, 1, 0, FetchOutcome::Bytes(solid_png(GREEN)))
        .with(1, 0, 1, FetchOutcome::Bytes(solid_png(BLUE)));
    let compositor = compositor(fetcher.clone());

    let request = BboxRequest::new([-H, -H, H, H], Crs::Epsg3857, 512, 512);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert_eq!(raster.zoom, 1);
    assert_eq!(raster.tiles_total, 4);
    assert_eq!(raster.tiles_missing, 1);
    assert_eq!(fetcher.calls(), 4);

    let image = &raster.image;
    assert_eq!(image.get_pixel(128, 128).0, RED);
    assert_eq!(image.get_pixel(384, 128).0, GREEN);
    assert_eq!(image.get_pixel(128, 384).0, BLUE);
    assert_eq!(image.get_pixel(384, 384).0[3], 0);
    assert_eq!(image.get_pixel(511, 511).0[3], 0);
}

#[tokio::test]
async fn test_undecodable_tile_counts_as_missing() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(|_| FetchOutcome::Bytes(bytes::Bytes::from_static(b"not an image")));
    let compositor = compositor(fetcher);

    let request = BboxRequest::new([-H, 0.0, 0.0, H], Crs::Epsg3857, 64, 64);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert_eq!(raster.tiles_missing, raster.tiles_total);
    assert!(raster.image.pixels().all(|p| p.0[3] == 0));
}

// =============================================================================
// Zoom selection and geographic requests
// =============================================================================

#[tokio::test]
async fn test_whole_world_geographic_uses_zoom_zero() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::solid(YELLOW);
    let compositor = compositor(fetcher.clone());

    let request = BboxRequest::new([-180.0, -90.0, 180.0, 90.0], Crs::Epsg4326, 256, 256);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert_eq!(raster.zoom, 0);
    assert_eq!(raster.tiles_total, 1);
    assert_eq!(fetcher.requested(), vec![(0, 0, 0)]);

    let image = &raster.image;
    assert_eq!(image.get_pixel(128, 128).0, YELLOW);
    // Beyond the mercator latitude limit nothing is drawn.
    assert_eq!(image.get_pixel(128, 0).0[3], 0);
    assert_eq!(image.get_pixel(128, 255).0[3], 0);
}

#[tokio::test]
async fn test_higher_resolution_picks_higher_zoom() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::solid(YELLOW);
    let compositor = compositor(fetcher.clone());

    let request = BboxRequest::new([-180.0, -85.0, 180.0, 85.0], Crs::Epsg4326, 1024, 512);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert_eq!(raster.zoom, 2);
    assert_eq!(raster.tiles_total, 16);
    assert!(fetcher.requested().iter().all(|(z, _, _)| *z == 2));
}

#[tokio::test]
async fn test_antimeridian_crossing() {
    let dir = TempDir::new().unwrap();
    // Column 0 is the western hemisphere, column 1 the eastern one.
    let fetcher = MockFetcher::new(|address| {
        let color = if address.column == 0 { BLUE } else { RED };
        FetchOutcome::Bytes(solid_png(color))
    });
    let compositor = compositor(fetcher.clone());

    // 90°E eastwards across the antimeridian to 90°W.
    let request = BboxRequest::new([90.0, -45.0, -90.0, 45.0], Crs::Epsg4326, 256, 128);
    let raster = compositor.compose(&layer(&dir), &request).await.unwrap();

    assert_eq!(raster.zoom, 1);
    assert_eq!(raster.tiles_total, 4);
    assert_eq!(raster.tiles_missing, 0);
    assert!(fetcher.requested().iter().all(|(_, column, _)| *column < 2));

    let image = &raster.image;
    assert_eq!(image.get_pixel(64, 64).0, RED);
    assert_eq!(image.get_pixel(192, 64).0, BLUE);
}

#[tokio::test]
async fn test_bbox_shifted_by_worlds_matches_original() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(|address| {
        let color = if address.column == 0 { BLUE } else { RED };
        FetchOutcome::Bytes(solid_png(color))
    });
    let compositor = compositor(fetcher);
    let layer = layer(&dir);

    let original = BboxRequest::new([-120.0, 0.0, -110.0, 10.0], Crs::Epsg4326, 32, 32);
    let east = BboxRequest::new([600.0, 0.0, 610.0, 10.0], Crs::Epsg4326, 32, 32);
    let west = BboxRequest::new([-840.0, 0.0, -830.0, 10.0], Crs::Epsg4326, 32, 32);

    let expected = compositor.compose(&layer, &original).await.unwrap();
    for request in [east, west] {
        let raster = compositor.compose(&layer, &request).await.unwrap();
        assert_eq!(raster.zoom, expected.zoom);
        assert!(raster.image == expected.image, "shifted bbox composed differently");
    }
    assert_eq!(expected.tiles_missing, 0);
}

#[tokio::test]
async fn test_missing_tiles_painted_with_layer_fill() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::not_found().with(1, 0, 0, FetchOutcome::Bytes(solid_png(RED)));
    let compositor = compositor(fetcher);
    let fill = Rgba([240, 240, 230, 255]);
    let layer = Arc::new(png_layer(dir.path(), "base").with_empty_color(fill));

    let request = BboxRequest::new([-H, 0.0, H, H], Crs::Epsg3857, 512, 256);
    let raster = compositor.compose(&layer, &request).await.unwrap();

    assert_eq!(raster.tiles_missing, 1);
    assert_eq!(raster.image.get_pixel(100, 100).0, RED);
    assert_eq!(*raster.image.get_pixel(400, 100), fill);
}

#[tokio::test]
async fn test_layers_are_stacked_in_order() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(|address| {
        // Overlay tiles exist only in the northern hemisphere.
        if address.layer_id == "overlay" && address.row == 1 {
            FetchOutcome::NotFound
        } else if address.layer_id == "overlay" {
            FetchOutcome::Bytes(solid_png(GREEN))
        } else {
            FetchOutcome::Bytes(solid_png(RED))
        }
    });
    let compositor = compositor(fetcher);
    let base = Arc::new(png_layer(dir.path(), "base"));
    let overlay = Arc::new(png_layer(dir.path(), "overlay"));

    let request = BboxRequest::new([-H, -H, H, H], Crs::Epsg3857, 512, 512);
    let raster = compositor
        .compose_layers(&[base, overlay], &request)
        .await
        .unwrap();

    assert_eq!(raster.tiles_total, 8);
    assert_eq!(raster.tiles_missing, 2);
    assert_eq!(raster.image.get_pixel(100, 100).0, GREEN);
    assert_eq!(raster.image.get_pixel(100, 400).0, RED);
}

// =============================================================================
// Limits and errors
// =============================================================================

#[tokio::test]
async fn test_oversized_output_rejected() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::solid(RED);
    let compositor = compositor(fetcher.clone());

    let request = BboxRequest::new([-10.0, -10.0, 10.0, 10.0], Crs::Epsg4326, 10_000, 10);
    let result = compositor.compose(&layer(&dir), &request).await;

    assert!(matches!(result, Err(TileError::InvalidSize { .. })));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_too_many_tiles_rejected() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::solid(RED);
    let config = CompositorConfig {
        max_tiles: 4,
        ..CompositorConfig::default()
    };
    let compositor = Compositor::new(Arc::new(TileResolver::new(fetcher.clone())), config);

    let request = BboxRequest::new([-180.0, -80.0, 180.0, 80.0], Crs::Epsg4326, 2048, 1024);
    let result = compositor.compose(&layer(&dir), &request).await;

    assert!(matches!(result, Err(TileError::TooManyTiles { limit: 4, .. })));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_bbox_outside_world_rejected() {
    let dir = TempDir::new().unwrap();
    let compositor = compositor(MockFetcher::solid(RED));

    let request = BboxRequest::new([-20.0, 86.0, 20.0, 89.0], Crs::Epsg4326, 256, 256);
    let result = compositor.compose(&layer(&dir), &request).await;

    assert!(matches!(result, Err(TileError::OutOfBounds { .. })));
}

#[tokio::test]
async fn test_huge_bbox_width_rejected() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::solid(RED);
    let compositor = compositor(fetcher.clone());

    for request in [
        BboxRequest::new([-1e20, 0.0, 10.0, 10.0], Crs::Epsg4326, 256, 256),
        BboxRequest::new([-1e20, 0.0, 1000.0, 1000.0], Crs::Epsg3857, 256, 256),
    ] {
        let result = compositor.compose(&layer(&dir), &request).await;
        assert!(matches!(result, Err(TileError::OutOfBounds { .. })));
    }
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_zoom_capped_by_layer_max_zoom() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::solid(RED);
    let compositor = compositor(fetcher.clone());
    let layer = Arc::new(png_layer(dir.path(), "base").with_zoom_range(0, 3));

    // Roughly 1 km wide at 1024 px would want zoom 15 or so.
    let request = BboxRequest::new([2.0, 48.0, 2.01, 48.005], Crs::Epsg4326, 1024, 512);
    let raster = compositor.compose(&layer, &request).await.unwrap();

    assert_eq!(raster.zoom, 3);
    assert_eq!(raster.tiles_total, 1);
}
