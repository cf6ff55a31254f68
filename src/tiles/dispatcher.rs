//! Render dispatcher - fans tile jobs out to a worker pool

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use super::request::{RenderFault, RenderJob, RenderRequest, RenderResponse, RequestId};
use super::types::{Bitmap, DocumentId, TileError, TileId};
use super::worker::{CancelSet, Rasterizer, render_worker};

/// Default number of render threads
pub const DEFAULT_WORKERS: usize = 2;

#[derive(Clone, Debug)]
struct InFlight {
    document: DocumentId,
    page_index: usize,
    tile_id: TileId,
    issued_at: Instant,
}

/// Outcome of one render request, as seen by the cache
#[derive(Clone, Debug)]
pub enum Completion {
    Ready {
        document: DocumentId,
        page_index: usize,
        tile_id: TileId,
        bitmap: Arc<Bitmap>,
    },
    Failed {
        document: DocumentId,
        page_index: usize,
        tile_id: TileId,
        error: RenderFault,
    },
    Cancelled {
        document: DocumentId,
        page_index: usize,
        tile_id: TileId,
    },
}

impl Completion {
    #[must_use]
    pub fn document(&self) -> DocumentId {
        match self {
            Self::Ready { document, .. }
            | Self::Failed { document, .. }
            | Self::Cancelled { document, .. } => *document,
        }
    }

    #[must_use]
    pub fn tile_id(&self) -> &TileId {
        match self {
            Self::Ready { tile_id, .. }
            | Self::Failed { tile_id, .. }
            | Self::Cancelled { tile_id, .. } => tile_id,
        }
    }

    fn from_response(response: RenderResponse, req: InFlight) -> Self {
        let InFlight {
            document,
            page_index,
            tile_id,
            ..
        } = req;
        match response {
            RenderResponse::Tile { bitmap, .. } => Self::Ready {
                document,
                page_index,
                tile_id,
                bitmap,
            },
            RenderResponse::Error { error, .. } => Self::Failed {
                document,
                page_index,
                tile_id,
                error,
            },
            RenderResponse::Cancelled(_) => Self::Cancelled {
                document,
                page_index,
                tile_id,
            },
        }
    }
}

/// Issues render requests and tracks them until they complete
pub struct RenderDispatcher {
    request_tx: Sender<RenderRequest>,
    response_rx: Receiver<RenderResponse>,
    next_request_id: AtomicU64,
    in_flight: Mutex<HashMap<RequestId, InFlight>>,
    cancelled: CancelSet,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl RenderDispatcher {
    /// Spawn `num_workers` render threads (at least one)
    #[must_use]
    pub fn new(rasterizer: Arc<dyn Rasterizer>, num_workers: usize) -> Self {
        // flume gives MPMC: every worker pulls from one shared queue
        let (request_tx, request_rx) = flume::unbounded();
        let (response_tx, response_rx) = flume::unbounded();
        let cancelled = CancelSet::default();
        let num_workers = num_workers.max(1);

        let workers = (0..num_workers)
            .map(|_| {
                let rasterizer = Arc::clone(&rasterizer);
                let rx = request_rx.clone();
                let tx = response_tx.clone();
                let cancelled = Arc::clone(&cancelled);
                std::thread::spawn(move || render_worker(rasterizer, rx, tx, cancelled))
            })
            .collect();

        Self {
            request_tx,
            response_rx,
            next_request_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            cancelled,
            workers: Mutex::new(workers),
            num_workers,
        }
    }

    /// Queue a render job
    pub fn dispatch(&self, job: RenderJob) -> Result<RequestId, TileError> {
        let id = RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let entry = InFlight {
            document: job.document,
            page_index: job.page_index,
            tile_id: job.tile_id.clone(),
            issued_at: Instant::now(),
        };

        self.lock_in_flight().insert(id, entry);
        if self.request_tx.send(RenderRequest::Tile { id, job }).is_err() {
            self.lock_in_flight().remove(&id);
            return Err(TileError::DispatcherClosed);
        }
        Ok(id)
    }

    /// Collect finished requests without blocking
    pub fn poll(&self) -> Vec<Completion> {
        let responses: Vec<_> = self.response_rx.try_iter().collect();
        self.resolve(responses)
    }

    /// Block up to `timeout` for the first completion, then drain the rest
    pub fn wait(&self, timeout: Duration) -> Vec<Completion> {
        let first = match self.response_rx.recv_timeout(timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return Vec::new(),
        };
        let mut responses = vec![first];
        responses.extend(self.response_rx.try_iter());
        self.resolve(responses)
    }

    /// Forget in-flight requests for these tiles; workers skip them if not started
    pub fn cancel_tiles(&self, document: DocumentId, tiles: &[TileId]) -> usize {
        if tiles.is_empty() {
            return 0;
        }
        self.cancel_where(|req| req.document == document && tiles.contains(&req.tile_id))
    }

    /// Forget every in-flight request of a document
    pub fn cancel_document(&self, document: DocumentId) -> usize {
        self.cancel_where(|req| req.document == document)
    }

    /// Give up on requests older than `timeout`
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<Completion> {
        let mut in_flight = self.lock_in_flight();
        let overdue: Vec<RequestId> = in_flight
            .iter()
            .filter(|(_, req)| now.saturating_duration_since(req.issued_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut cancelled = self.lock_cancelled();
        overdue
            .into_iter()
            .filter_map(|id| {
                let req = in_flight.remove(&id)?;
                cancelled.insert(id);
                warn!("Render of {} timed out after {timeout:?}", req.tile_id);
                Some(Completion::Failed {
                    document: req.document,
                    page_index: req.page_index,
                    tile_id: req.tile_id,
                    error: RenderFault::TimedOut,
                })
            })
            .collect()
    }

    /// True once every worker has exited and no job can be queued
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.request_tx.is_disconnected()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    #[must_use]
    pub fn is_in_flight(&self, document: DocumentId, tile: &TileId) -> bool {
        self.lock_in_flight()
            .values()
            .any(|req| req.document == document && req.tile_id == *tile)
    }

    /// Stop all workers and wait for them to exit
    pub fn shutdown(&self) {
        for _ in 0..self.num_workers {
            let _ = self.request_tx.send(RenderRequest::Shutdown);
        }
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("Render worker panicked during shutdown");
            }
        }
    }

    fn resolve(&self, responses: Vec<RenderResponse>) -> Vec<Completion> {
        let mut in_flight = self.lock_in_flight();
        let mut completions = Vec::with_capacity(responses.len());
        for response in responses {
            let id = response.id();
            match in_flight.remove(&id) {
                Some(req) => completions.push(Completion::from_response(response, req)),
                None => {
                    // cancelled, expired or belonged to a closed document
                    self.lock_cancelled().remove(&id);
                    debug!("Discarding stale render response {id:?}");
                }
            }
        }
        completions
    }

    fn cancel_where(&self, pred: impl Fn(&InFlight) -> bool) -> usize {
        let mut in_flight = self.lock_in_flight();
        let ids: Vec<RequestId> = in_flight
            .iter()
            .filter(|(_, req)| pred(req))
            .map(|(id, _)| *id)
            .collect();

        let mut cancelled = self.lock_cancelled();
        for id in &ids {
            in_flight.remove(id);
            cancelled.insert(*id);
        }
        if !ids.is_empty() {
            debug!("Cancelled {} render request(s)", ids.len());
        }
        ids.len()
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<RequestId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancelled(&self) -> MutexGuard<'_, HashSet<RequestId>> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RenderDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::tiles::types::{Epoch, PixelRect, Rect, Rotation, ScaleBucket};

    fn job(document: u64, column: u32) -> RenderJob {
        let epoch = Epoch {
            scale: ScaleBucket::from_scale(1.0),
            rotation: Rotation::Deg0,
        };
        RenderJob {
            document: DocumentId(document),
            page_index: 0,
            tile_id: TileId::new(0, column, 0, epoch, None),
            page_rect: Rect::new(0.0, 0.0, 2.0, 2.0),
            pixel_rect: PixelRect::new(0, 0, 2, 2),
            scale: 1.0,
            rotation: Rotation::Deg0,
        }
    }

    fn solid(job: &RenderJob) -> Result<Bitmap, RenderFault> {
        Ok(Bitmap::filled(job.pixel_rect.width, job.pixel_rect.height, [255; 4]))
    }

    fn wait_for(dispatcher: &RenderDispatcher, count: usize) -> Vec<Completion> {
        let mut done = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.len() < count && Instant::now() < deadline {
            done.extend(dispatcher.wait(Duration::from_millis(50)));
        }
        done
    }

    #[test]
    fn completions_carry_tile_identity() {
        let dispatcher = RenderDispatcher::new(Arc::new(solid), 2);
        for column in 0..4 {
            dispatcher.dispatch(job(1, column)).expect("dispatch");
        }

        let done = wait_for(&dispatcher, 4);
        assert_eq!(done.len(), 4);
        assert!(done.iter().all(|c| matches!(c, Completion::Ready { .. })));
        assert!(done.iter().all(|c| c.document() == DocumentId(1)));
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[test]
    fn cancelled_tiles_complete_as_stale() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let blocking = move |job: &RenderJob| {
            let _ = gate.lock().expect("gate").recv();
            solid(job)
        };
        let dispatcher = RenderDispatcher::new(Arc::new(blocking), 1);
        let target = job(1, 0);
        dispatcher.dispatch(target.clone()).expect("dispatch");
        assert!(dispatcher.is_in_flight(DocumentId(1), &target.tile_id));

        assert_eq!(dispatcher.cancel_tiles(DocumentId(1), &[target.tile_id.clone()]), 1);
        assert!(!dispatcher.is_in_flight(DocumentId(1), &target.tile_id));
        gate_tx.send(()).expect("release worker");

        // the late response is swallowed
        std::thread::sleep(Duration::from_millis(100));
        assert!(dispatcher.poll().is_empty());
    }

    #[test]
    fn expire_reports_timeouts_once() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let blocking = move |job: &RenderJob| {
            let _ = gate.lock().expect("gate").recv();
            solid(job)
        };
        let dispatcher = RenderDispatcher::new(Arc::new(blocking), 1);
        dispatcher.dispatch(job(3, 0)).expect("dispatch");

        let later = Instant::now() + Duration::from_secs(10);
        let expired = dispatcher.expire(later, Duration::from_secs(1));
        assert!(matches!(
            expired.as_slice(),
            [Completion::Failed { error: RenderFault::TimedOut, .. }]
        ));
        assert!(dispatcher.expire(later, Duration::from_secs(1)).is_empty());
        drop(gate_tx);
    }

    #[test]
    fn cancel_document_only_touches_that_document() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let blocking = move |job: &RenderJob| {
            let _ = gate.lock().expect("gate").recv();
            solid(job)
        };
        let dispatcher = RenderDispatcher::new(Arc::new(blocking), 1);
        dispatcher.dispatch(job(1, 0)).expect("dispatch");
        dispatcher.dispatch(job(2, 0)).expect("dispatch");

        assert_eq!(dispatcher.cancel_document(DocumentId(1)), 1);
        assert_eq!(dispatcher.in_flight_count(), 1);
        drop(gate_tx);
    }

    #[test]
    fn dispatch_after_shutdown_is_refused() {
        let dispatcher = RenderDispatcher::new(Arc::new(solid), 2);
        assert!(!dispatcher.is_closed());

        dispatcher.shutdown();

        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.dispatch(job(1, 0)),
            Err(TileError::DispatcherClosed)
        ));
        assert_eq!(dispatcher.in_flight_count(), 0);
    }
}
