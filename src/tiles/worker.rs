//! Tile render worker - runs in separate thread(s)

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use flume::{Receiver, Sender};
use log::{debug, warn};

use super::request::{RenderFault, RenderJob, RenderRequest, RenderResponse, RequestId};
use super::types::Bitmap;

/// Produces pixels for a page rectangle. Implemented by the embedding viewer.
pub trait Rasterizer: Send + Sync {
    fn render_rect(&self, job: &RenderJob) -> Result<Bitmap, RenderFault>;
}

impl<F> Rasterizer for F
where
    F: Fn(&RenderJob) -> Result<Bitmap, RenderFault> + Send + Sync,
{
    fn render_rect(&self, job: &RenderJob) -> Result<Bitmap, RenderFault> {
        self(job)
    }
}

/// Request ids whose results nobody wants anymore
pub type CancelSet = Arc<Mutex<HashSet<RequestId>>>;

/// Main worker function - runs in a dedicated thread
#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
pub fn render_worker(
    rasterizer: Arc<dyn Rasterizer>,
    requests: Receiver<RenderRequest>,
    responses: Sender<RenderResponse>,
    cancelled: CancelSet,
) {
    for request in requests {
        match request {
            RenderRequest::Tile { id, job } => {
                let was_cancelled = cancelled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                let response = if was_cancelled {
                    debug!("Skipping cancelled render of {}", job.tile_id);
                    RenderResponse::Cancelled(id)
                } else {
                    render_tile(rasterizer.as_ref(), id, &job)
                };
                if responses.send(response).is_err() {
                    break;
                }
            }

            RenderRequest::Shutdown => break,
        }
    }
}

fn render_tile(rasterizer: &dyn Rasterizer, id: RequestId, job: &RenderJob) -> RenderResponse {
    let result = panic::catch_unwind(AssertUnwindSafe(|| rasterizer.render_rect(job)))
        .unwrap_or_else(|_| Err(RenderFault::rasterizer("rasterizer panicked")));

    match result {
        Ok(bitmap) => RenderResponse::Tile {
            id,
            bitmap: Arc::new(bitmap),
        },
        Err(error) => {
            warn!(
                "Render of {} (page {}) failed: {error}",
                job.tile_id, job.page_index
            );
            RenderResponse::Error { id, error }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::tiles::types::{DocumentId, Epoch, PixelRect, Rect, Rotation, ScaleBucket, TileId};

    fn job(page_index: usize) -> RenderJob {
        let epoch = Epoch {
            scale: ScaleBucket::from_scale(1.0),
            rotation: Rotation::Deg0,
        };
        RenderJob {
            document: DocumentId(1),
            page_index,
            tile_id: TileId::new(page_index, 0, 0, epoch, None),
            page_rect: Rect::new(0.0, 0.0, 4.0, 2.0),
            pixel_rect: PixelRect::new(0, 0, 4, 2),
            scale: 1.0,
            rotation: Rotation::Deg0,
        }
    }

    fn spawn(rasterizer: Arc<dyn Rasterizer>) -> (Sender<RenderRequest>, Receiver<RenderResponse>, CancelSet) {
        let (request_tx, request_rx) = flume::unbounded();
        let (response_tx, response_rx) = flume::unbounded();
        let cancelled = CancelSet::default();
        let cancel_clone = cancelled.clone();
        thread::spawn(move || render_worker(rasterizer, request_rx, response_tx, cancel_clone));
        (request_tx, response_rx, cancelled)
    }

    #[test]
    fn renders_and_reports_failures() {
        let rasterizer = |job: &RenderJob| {
            if job.page_index == 1 {
                Err(RenderFault::rasterizer("broken page"))
            } else {
                Ok(Bitmap::filled(job.pixel_rect.width, job.pixel_rect.height, [0, 0, 0, 255]))
            }
        };
        let (tx, rx, _) = spawn(Arc::new(rasterizer));

        tx.send(RenderRequest::Tile { id: RequestId(1), job: job(0) }).expect("send");
        tx.send(RenderRequest::Tile { id: RequestId(2), job: job(1) }).expect("send");
        tx.send(RenderRequest::Shutdown).expect("send");

        let responses: Vec<_> = rx.iter().collect();
        assert_eq!(responses.len(), 2);
        match &responses[0] {
            RenderResponse::Tile { id, bitmap } => {
                assert_eq!(*id, RequestId(1));
                assert_eq!(bitmap.byte_len(), 4 * 2 * 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            &responses[1],
            RenderResponse::Error { id: RequestId(2), .. }
        ));
    }

    #[test]
    fn cancelled_requests_are_skipped() {
        let rasterizer = |_: &RenderJob| -> Result<Bitmap, RenderFault> {
            panic!("must not render a cancelled request")
        };
        let (tx, rx, cancelled) = spawn(Arc::new(rasterizer));
        cancelled.lock().expect("lock").insert(RequestId(9));

        tx.send(RenderRequest::Tile { id: RequestId(9), job: job(0) }).expect("send");
        tx.send(RenderRequest::Shutdown).expect("send");

        let responses: Vec<_> = rx.iter().collect();
        assert!(matches!(responses.as_slice(), [RenderResponse::Cancelled(RequestId(9))]));
    }

    #[test]
    fn panicking_rasterizer_becomes_a_fault() {
        let rasterizer = |_: &RenderJob| -> Result<Bitmap, RenderFault> { panic!("boom") };
        let (tx, rx, _) = spawn(Arc::new(rasterizer));

        tx.send(RenderRequest::Tile { id: RequestId(3), job: job(0) }).expect("send");
        tx.send(RenderRequest::Shutdown).expect("send");

        let responses: Vec<_> = rx.iter().collect();
        assert!(matches!(
            responses.as_slice(),
            [RenderResponse::Error { error: RenderFault::Rasterizer { .. }, .. }]
        ));
    }
}
