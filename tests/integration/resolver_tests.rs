//! Resolver behaviour against a real cache directory.
//!
//! Tests verify:
//! - Repeated resolution is served from cache without refetching
//! - Negative markers suppress fetches until they expire
//! - Stale tiles are served when the upstream fails
//! - Cache-only layers read tiles written by other tools
//! - Memory entries expire with the file they came from
//! - Missing tiles rebuilt from children or ancestors

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use tempfile::TempDir;

use tilegrid_proxy::fetch::FetchOutcome;
use tilegrid_proxy::grid::{path_for, CacheLayout, TileAddress};
use tilegrid_proxy::tile::{Resolved, TileOrigin, TileResolver};
use tilegrid_proxy::{Layer, TileError};

use super::test_utils::{
    assert_pixel_near, decode_rgba, gradient_png, png_layer, solid_png, MockFetcher, BLUE, GREEN, RED,
    YELLOW,
};

fn age(path: &std::path::Path, by: Duration) {
    let when = SystemTime::now() - by;
    filetime::set_file_mtime(path, FileTime::from_system_time(when)).unwrap();
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base");
    let fetcher = MockFetcher::solid(RED);
    let resolver = TileResolver::new(fetcher.clone());
    let address = TileAddress::new("base", 4, 3, 5).unwrap();

    let first = resolver.resolve(&layer, &address).await.unwrap();
    let second = resolver.resolve(&layer, &address).await.unwrap();

    let (Resolved::Tile { data: a, origin: oa }, Resolved::Tile { data: b, origin: ob }) =
        (first, second)
    else {
        panic!("expected two tiles");
    };
    assert_eq!(a, b);
    assert_eq!(oa, TileOrigin::Upstream);
    assert_eq!(ob, TileOrigin::Memory);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_resolve_from_disk_without_memory_cache() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base");
    let fetcher = MockFetcher::solid(GREEN);
    let resolver = TileResolver::with_memory_capacity(fetcher.clone(), 0);
    let address = TileAddress::new("base", 2, 1, 1).unwrap();

    resolver.resolve(&layer, &address).await.unwrap();
    let again = resolver.resolve(&layer, &address).await.unwrap();

    assert!(matches!(
        again,
        Resolved::Tile {
            origin: TileOrigin::Disk,
            ..
        }
    ));
    assert_eq!(fetcher.calls(), 1);
    assert!(dir.path().join("base/2/1/1.png").is_file());
}

#[tokio::test]
async fn test_concurrent_resolution_of_distinct_tiles() {
    let dir = TempDir::new().unwrap();
    let layer = Arc::new(png_layer(dir.path(), "base"));
    let fetcher = MockFetcher::solid(BLUE);
    let resolver = Arc::new(TileResolver::new(fetcher.clone()));

    let handles: Vec<_> = (0..16u32)
        .map(|i| {
            let resolver = Arc::clone(&resolver);
            let layer = Arc::clone(&layer);
            tokio::spawn(async move {
                let address = TileAddress::new("base", 4, i, 15 - i).unwrap();
                resolver.resolve_shared(layer, address).await
            })
        })
        .collect();

    for handle in handles {
        let resolved = handle.await.unwrap().unwrap();
        assert!(resolved.into_data().is_some());
    }
    assert_eq!(fetcher.calls(), 16);
    for i in 0..16u32 {
        let path = dir.path().join(format!("base/4/{i}/{}.png", 15 - i));
        assert!(path.is_file(), "missing {}", path.display());
    }
}

// =============================================================================
// Negative caching
// =============================================================================

#[tokio::test]
async fn test_negative_marker_suppresses_fetch() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base");
    let fetcher = MockFetcher::not_found();
    let resolver = TileResolver::with_memory_capacity(fetcher.clone(), 0);
    let address = TileAddress::new("base", 5, 10, 12).unwrap();

    assert_eq!(
        resolver.resolve(&layer, &address).await.unwrap(),
        Resolved::NotFound
    );
    let marker = dir.path().join("base/5/10/12.tne");
    assert!(marker.is_file());
    assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);

    for _ in 0..3 {
        assert_eq!(
            resolver.resolve(&layer, &address).await.unwrap(),
            Resolved::NotFound
        );
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_expired_negative_marker_refetches() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_negative_ttl(Duration::from_secs(60));
    let fetcher = MockFetcher::not_found();
    let resolver = TileResolver::with_memory_capacity(fetcher.clone(), 0);
    let address = TileAddress::new("base", 5, 1, 2).unwrap();

    resolver.resolve(&layer, &address).await.unwrap();
    age(&dir.path().join("base/5/1/2.tne"), Duration::from_secs(120));

    // The tile has appeared upstream since.
    fetcher.set(5, 1, 2, FetchOutcome::Bytes(solid_png(RED)));
    let resolved = resolver.resolve(&layer, &address).await.unwrap();

    assert!(matches!(
        resolved,
        Resolved::Tile {
            origin: TileOrigin::Upstream,
            ..
        }
    ));
    assert_eq!(fetcher.calls(), 2);
    assert!(!dir.path().join("base/5/1/2.tne").exists());
}

// =============================================================================
// Stale tiles
// =============================================================================

#[tokio::test]
async fn test_stale_tile_served_when_upstream_fails() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_ttl(Some(Duration::from_secs(3600)));
    let address = TileAddress::new("base", 3, 3, 3).unwrap();

    let original = solid_png(RED);
    let path = dir.path().join(path_for(&layer, &address));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, &original).unwrap();
    age(&path, Duration::from_secs(7200));

    let fetcher = MockFetcher::failing();
    let resolver = TileResolver::with_memory_capacity(fetcher.clone(), 0);
    let resolved = resolver.resolve(&layer, &address).await.unwrap();

    assert_eq!(
        resolved,
        Resolved::Tile {
            data: original,
            origin: TileOrigin::Stale,
        }
    );
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_stale_tile_is_refreshed_from_upstream() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_ttl(Some(Duration::from_secs(3600)));
    let address = TileAddress::new("base", 3, 4, 4).unwrap();

    let path = dir.path().join(path_for(&layer, &address));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, solid_png(RED)).unwrap();
    age(&path, Duration::from_secs(7200));

    let fresh = solid_png(GREEN);
    let resolver = TileResolver::with_memory_capacity(MockFetcher::solid(GREEN), 0);
    let resolved = resolver.resolve(&layer, &address).await.unwrap();

    assert_eq!(resolved.into_data(), Some(fresh.clone()));
    assert_eq!(Bytes::from(std::fs::read(&path).unwrap()), fresh);
}

#[tokio::test]
async fn test_transient_error_without_cache_is_an_error() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base");
    let resolver = TileResolver::new(MockFetcher::failing());
    let address = TileAddress::new("base", 1, 0, 0).unwrap();

    let result = resolver.resolve(&layer, &address).await;
    assert!(matches!(result, Err(TileError::Upstream { .. })));
    // Nothing is recorded for a transient failure.
    assert!(!dir.path().join("base/1/0/0.tne").exists());
    assert!(!dir.path().join("base/1/0/0.png").exists());
}

#[tokio::test]
async fn test_memory_entry_expires_with_its_file() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_ttl(Some(Duration::from_secs(1)));
    let address = TileAddress::new("base", 3, 2, 2).unwrap();

    // On disk and fresh for about 200 ms more.
    let path = dir.path().join(path_for(&layer, &address));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, solid_png(RED)).unwrap();
    age(&path, Duration::from_millis(800));

    let fetcher = MockFetcher::solid(GREEN);
    let resolver = TileResolver::new(fetcher.clone());

    let first = resolver.resolve(&layer, &address).await.unwrap();
    assert!(matches!(first, Resolved::Tile { origin: TileOrigin::Disk, .. }));
    assert_eq!(fetcher.calls(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = resolver.resolve(&layer, &address).await.unwrap();

    assert_eq!(
        second,
        Resolved::Tile {
            data: solid_png(GREEN),
            origin: TileOrigin::Upstream,
        }
    );
    assert_eq!(fetcher.calls(), 1);
}

// =============================================================================
// Cache-only layers
// =============================================================================

#[tokio::test]
async fn test_cache_only_gmt_layer_reads_existing_tiles() {
    let dir = TempDir::new().unwrap();
    let layer = Layer::new("archive", dir.path().to_path_buf())
        .with_extension("png")
        .with_layout(CacheLayout::Gmt);
    let address = TileAddress::new("archive", 2, 3, 1).unwrap();

    // GMT directories are one zoom level up.
    let path = dir.path().join("archive/z3/1/3.png");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, solid_png(BLUE)).unwrap();

    let fetcher = MockFetcher::solid(RED);
    let resolver = TileResolver::new(fetcher.clone());

    let hit = resolver.resolve(&layer, &address).await.unwrap();
    assert_eq!(hit.into_data(), Some(solid_png(BLUE)));

    let missing = TileAddress::new("archive", 2, 0, 0).unwrap();
    assert_eq!(
        resolver.resolve(&layer, &missing).await.unwrap(),
        Resolved::NotFound
    );
    assert_eq!(fetcher.calls(), 0);
    // No marker: the upstream was never asked.
    assert!(!dir.path().join("archive/z3/0/0.tne").exists());
}

#[tokio::test]
async fn test_wrapped_column_shares_cache_entry() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base");
    let fetcher = MockFetcher::solid(RED);
    let resolver = TileResolver::new(fetcher.clone());

    let east = TileAddress {
        layer_id: "base".to_string(),
        zoom: 2,
        column: 5,
        row: 1,
    };
    let west = TileAddress::new("base", 2, 1, 1).unwrap();

    resolver.resolve(&layer, &east).await.unwrap();
    resolver.resolve(&layer, &west).await.unwrap();

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fetcher.requested(), vec![(2, 1, 1)]);
}

// =============================================================================
// Tiles rebuilt from other zoom levels
// =============================================================================

#[tokio::test]
async fn test_scalable_layer_builds_tile_from_children() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_scalable(true);
    let fetcher = MockFetcher::not_found()
        .with(2, 2, 0, FetchOutcome::Bytes(solid_png(RED)))
        .with(2, 3, 0, FetchOutcome::Bytes(solid_png(GREEN)))
        .with(2, 2, 1, FetchOutcome::Bytes(solid_png(BLUE)))
        .with(2, 3, 1, FetchOutcome::Bytes(solid_png(YELLOW)));
    let resolver = TileResolver::new(fetcher.clone());
    let address = TileAddress::new("base", 1, 1, 0).unwrap();

    let Resolved::Tile { data, origin } = resolver.resolve(&layer, &address).await.unwrap() else {
        panic!("expected a tile built from children");
    };
    assert_eq!(origin, TileOrigin::Derived);

    let image = decode_rgba(&data);
    assert_eq!(image.dimensions(), (256, 256));
    assert_pixel_near(image.get_pixel(64, 64).0, RED, 2);
    assert_pixel_near(image.get_pixel(192, 64).0, GREEN, 2);
    assert_pixel_near(image.get_pixel(64, 192).0, BLUE, 2);
    assert_pixel_near(image.get_pixel(192, 192).0, YELLOW, 2);

    assert_eq!(
        fetcher.requested(),
        vec![(1, 1, 0), (2, 2, 0), (2, 3, 0), (2, 2, 1), (2, 3, 1)]
    );
    // The parent stays negatively cached; derived tiles are not stored.
    assert!(dir.path().join("base/1/1/0.tne").is_file());
    assert!(!dir.path().join("base/1/1/0.png").exists());
}

#[tokio::test]
async fn test_scalable_layer_needs_all_four_children() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_scalable(true);
    let fetcher = MockFetcher::not_found()
        .with(2, 2, 0, FetchOutcome::Bytes(solid_png(RED)))
        .with(2, 2, 1, FetchOutcome::Bytes(solid_png(BLUE)));
    let resolver = TileResolver::new(fetcher.clone());
    let address = TileAddress::new("base", 1, 1, 0).unwrap();

    assert_eq!(
        resolver.resolve(&layer, &address).await.unwrap(),
        Resolved::NotFound
    );
    // Stops at the first missing child.
    assert_eq!(fetcher.requested(), vec![(1, 1, 0), (2, 2, 0), (2, 3, 0)]);
}

#[tokio::test]
async fn test_missing_tile_filled_from_parent() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_fill_from_parent(true);
    let fetcher = MockFetcher::not_found().with(0, 0, 0, FetchOutcome::Bytes(gradient_png(9)));
    let resolver = TileResolver::new(fetcher.clone());
    let address = TileAddress::new("base", 2, 1, 2).unwrap();

    let Resolved::Tile { data, origin } = resolver.resolve(&layer, &address).await.unwrap() else {
        panic!("expected a tile upscaled from the root tile");
    };
    assert_eq!(origin, TileOrigin::Derived);

    // Tile 2/1/2 is the 64 px square at (64, 128) of the root tile, scaled 4x.
    let image = decode_rgba(&data);
    assert_eq!(image.dimensions(), (256, 256));
    assert_pixel_near(image.get_pixel(128, 128).0, [96, 160, 9, 255], 2);
    assert_pixel_near(image.get_pixel(40, 200).0, [74, 178, 9, 255], 2);
    assert_eq!(fetcher.requested(), vec![(2, 1, 2), (1, 0, 1), (0, 0, 0)]);
}

#[tokio::test]
async fn test_upstream_failure_filled_from_ancestor() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base").with_fill_from_parent(true);
    let fetcher = MockFetcher::new(|address| {
        if address.zoom == 0 {
            FetchOutcome::Bytes(solid_png(RED))
        } else {
            FetchOutcome::TransientError("timeout".to_string())
        }
    });
    let resolver = TileResolver::new(fetcher.clone());
    let address = TileAddress::new("base", 3, 5, 6).unwrap();

    let Resolved::Tile { data, origin } = resolver.resolve(&layer, &address).await.unwrap() else {
        panic!("expected a derived tile");
    };
    assert_eq!(origin, TileOrigin::Derived);
    assert_pixel_near(decode_rgba(&data).get_pixel(100, 100).0, RED, 1);
    assert_eq!(fetcher.requested(), vec![(3, 5, 6), (2, 2, 3), (1, 1, 1), (0, 0, 0)]);
}

#[tokio::test]
async fn test_no_fallback_unless_enabled() {
    let dir = TempDir::new().unwrap();
    let layer = png_layer(dir.path(), "base");
    let fetcher = MockFetcher::not_found().with(0, 0, 0, FetchOutcome::Bytes(solid_png(RED)));
    let resolver = TileResolver::new(fetcher.clone());
    let address = TileAddress::new("base", 1, 0, 0).unwrap();

    assert_eq!(
        resolver.resolve(&layer, &address).await.unwrap(),
        Resolved::NotFound
    );
    assert_eq!(fetcher.calls(), 1);
}
