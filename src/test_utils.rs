pub mod test_helpers {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use crate::tiles::{
        Bitmap, DocumentId, DocumentModel, Rect, RenderFault, RenderJob, TileService,
        VisibilityMetric, VisibilitySnapshot,
    };

    /// Document whose pages all share one size
    pub struct FixedDocument {
        pub pages: usize,
        pub width: f32,
        pub height: f32,
    }

    impl FixedDocument {
        pub fn new(pages: usize, width: f32, height: f32) -> Arc<Self> {
            Arc::new(Self {
                pages,
                width,
                height,
            })
        }
    }

    impl DocumentModel for FixedDocument {
        fn page_count(&self) -> usize {
            self.pages
        }

        fn page_size(&self, index: usize) -> Option<(f32, f32)> {
            (index < self.pages).then_some((self.width, self.height))
        }
    }

    /// Rasterizer that fills every tile with one color and counts calls
    #[derive(Default)]
    pub struct SolidRasterizer {
        pub calls: AtomicUsize,
    }

    impl SolidRasterizer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl crate::tiles::Rasterizer for SolidRasterizer {
        fn render_rect(&self, job: &RenderJob) -> Result<Bitmap, RenderFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bitmap::filled(
                job.pixel_rect.width,
                job.pixel_rect.height,
                [255, 255, 255, 255],
            ))
        }
    }

    /// Rasterizer that fails every job
    pub struct FailingRasterizer;

    impl crate::tiles::Rasterizer for FailingRasterizer {
        fn render_rect(&self, job: &RenderJob) -> Result<Bitmap, RenderFault> {
            Err(RenderFault::rasterizer(format!("cannot draw page {}", job.page_index)))
        }
    }

    /// Rasterizer that never finishes within a test's patience
    pub struct StallingRasterizer(pub Duration);

    impl crate::tiles::Rasterizer for StallingRasterizer {
        fn render_rect(&self, job: &RenderJob) -> Result<Bitmap, RenderFault> {
            std::thread::sleep(self.0);
            Ok(Bitmap::filled(job.pixel_rect.width, job.pixel_rect.height, [0, 0, 0, 255]))
        }
    }

    /// Snapshot showing the given pages in full
    pub fn full_page_snapshot(pages: &[usize], width: f32, height: f32) -> VisibilitySnapshot {
        pages
            .iter()
            .enumerate()
            .map(|(position, &page_index)| VisibilityMetric {
                page_index,
                visible_rect: Rect::new(0.0, 0.0, width, height),
                scroll_position: position + 1,
            })
            .collect()
    }

    /// Snapshot showing part of a single page
    pub fn partial_snapshot(page_index: usize, visible_rect: Rect) -> VisibilitySnapshot {
        vec![VisibilityMetric {
            page_index,
            visible_rect,
            scroll_position: 1,
        }]
    }

    /// Apply completions until nothing is in flight or `timeout` elapses.
    /// Returns whether the service drained.
    pub fn wait_until_idle(service: &TileService, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            service.wait_renders(Duration::from_millis(20));
            if service.in_flight_count() == 0 {
                service.poll_renders();
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Open `pages` pages of `width` x `height`, scroll them into view and
    /// flush the throttle so the tile set is populated.
    pub fn open_and_show(
        service: &TileService,
        id: DocumentId,
        pages: usize,
        width: f32,
        height: f32,
    ) {
        let model = FixedDocument::new(pages, width, height);
        service
            .open_document(id, model, crate::tiles::TilingConfig::default())
            .expect("open document");
        let visible: Vec<usize> = (0..pages).collect();
        let now = Instant::now();
        service
            .scroll(id, full_page_snapshot(&visible, width, height), now)
            .expect("scroll");
        service.tick(now + Duration::from_secs(1));
    }
}
