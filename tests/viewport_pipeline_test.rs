use std::time::{Duration, Instant};

use pagetiles::test_utils::test_helpers::{FixedDocument, SolidRasterizer, wait_until_idle};
use pagetiles::tiles::{
    BitmapCache, CacheKey, Completion, DocumentId, ServiceConfig, TileService, TilingConfig,
};
use pagetiles::viewport::{ScrollDirection, Viewport, ViewportState};

const DOC: DocumentId = DocumentId(1);
const PAGES: [(f32, f32); 4] = [(600.0, 800.0); 4];
const VIEW: Viewport = Viewport {
    width: 600,
    height: 400,
};

fn show(service: &TileService, view: &ViewportState) {
    let now = Instant::now();
    service
        .scroll(DOC, view.visible_pages(&PAGES, VIEW, 10), now)
        .unwrap();
    service.tick(now + service.config().scroll_throttle);
}

fn render_into(service: &TileService, cache: &mut BitmapCache) {
    service.render_pending(DOC).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while service.in_flight_count() > 0 && Instant::now() < deadline {
        for completion in service.wait_renders(Duration::from_millis(50)) {
            if let Completion::Ready {
                page_index,
                tile_id,
                bitmap,
                ..
            } = completion
            {
                cache.insert(CacheKey::new(page_index, tile_id), bitmap);
            }
        }
    }
}

#[test]
fn test_scrolling_reuses_cached_tiles() {
    let rasterizer = SolidRasterizer::new();
    let service = TileService::with_config(rasterizer.clone(), ServiceConfig::default());
    service
        .open_document(DOC, FixedDocument::new(4, 600.0, 800.0), TilingConfig::default())
        .unwrap();
    let mut cache = BitmapCache::new(1024);
    let mut view = ViewportState::default();

    show(&service, &view);
    render_into(&service, &mut cache);
    let first_pass = rasterizer.calls();
    assert!(first_pass > 0);
    assert_eq!(cache.len(), first_pass);

    // a small scroll stays inside the prefetched ring
    view.pan(ScrollDirection::Down);
    show(&service, &view);
    assert_eq!(service.stats(DOC).unwrap().pending, 0);
    render_into(&service, &mut cache);
    assert_eq!(rasterizer.calls(), first_pass);
}

#[test]
fn test_zoom_evicts_retired_bitmaps() {
    let service = TileService::with_config(SolidRasterizer::new(), ServiceConfig::default());
    service
        .open_document(DOC, FixedDocument::new(4, 600.0, 800.0), TilingConfig::default())
        .unwrap();
    let mut cache = BitmapCache::new(1024);
    let mut view = ViewportState::default();
    show(&service, &view);
    render_into(&service, &mut cache);
    let before = cache.len();

    view.step_in();
    service.set_scale(DOC, view.factor()).unwrap();
    show(&service, &view);

    // fallbacks still reference the old bitmaps
    assert_eq!(cache.retain_tile_set(&service.tiles(DOC).unwrap()), 0);
    assert_eq!(cache.len(), before);

    render_into(&service, &mut cache);
    assert!(wait_until_idle(&service, Duration::from_secs(5)));
    let evicted = cache.retain_tile_set(&service.tiles(DOC).unwrap());
    assert!(evicted > 0, "old-scale bitmaps go once their fallbacks retire");
    assert_eq!(service.stats(DOC).unwrap().fallback, 0);
}
