//! Tile service - document sessions, render dispatch and change fan-out
//!
//! Every open document is one session behind its own mutex: all merges and
//! status transitions of a document are serialized, different documents
//! proceed independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;

use super::dispatcher::{Completion, DEFAULT_WORKERS, RenderDispatcher};
use super::feed::{DEFAULT_THROTTLE, VisibilityFeed};
use super::geometry::compute_tiles;
use super::notifier::{ChangeNotifier, Subscription};
use super::request::{RenderJob, RequestId};
use super::state::{Command, Effect, ViewState};
use super::store::{MergeOutcome, StatusChange, TilingDocumentState};
use super::types::{
    DocumentId, Rotation, Tile, TileError, TileId, TileSet, TileStats, TileStatus, TilingConfig,
    VisibilitySnapshot,
};
use super::worker::Rasterizer;

/// Page count and page sizes of a document
pub trait DocumentModel: Send + Sync {
    fn page_count(&self) -> usize;

    /// Width and height of a page in document units
    fn page_size(&self, index: usize) -> Option<(f32, f32)>;
}

/// Service-wide knobs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub workers: usize,
    /// Trailing-edge window for scroll snapshots
    pub scroll_throttle: Duration,
    /// In-flight renders older than this count as failed
    pub render_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            scroll_throttle: DEFAULT_THROTTLE,
            render_timeout: Some(Duration::from_secs(5)),
        }
    }
}

struct DocumentSession {
    model: Arc<dyn DocumentModel>,
    config: TilingConfig,
    view: ViewState,
    store: TilingDocumentState,
    feed: VisibilityFeed,
}

#[derive(Debug, Default)]
struct SessionChange {
    changed: bool,
    dropped: Vec<TileId>,
}

impl SessionChange {
    fn absorb(&mut self, outcome: MergeOutcome) {
        self.changed |= outcome.changed;
        self.dropped.extend(outcome.dropped);
    }
}

impl DocumentSession {
    fn apply(&mut self, commands: Vec<Command>) -> SessionChange {
        let mut effects = Vec::new();
        for cmd in commands {
            effects.extend(self.view.apply(cmd));
        }
        effects.dedup();
        self.execute_effects(effects)
    }

    fn execute_effects(&mut self, effects: Vec<Effect>) -> SessionChange {
        let mut change = SessionChange::default();
        for effect in effects {
            let pages = match effect {
                Effect::RecomputeVisible => self.visible_and_stale_pages(),
                Effect::RecomputePages(pages) => pages,
            };
            self.recompute(&pages, &mut change);
        }
        change
    }

    /// Snapshot pages in scroll order, then pages that left the snapshot
    fn visible_and_stale_pages(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut pages: Vec<usize> = self
            .view
            .snapshot
            .iter()
            .map(|m| m.page_index)
            .filter(|page| seen.insert(*page))
            .collect();
        pages.extend(self.store.pages().filter(|page| !seen.contains(page)));
        pages
    }

    fn recompute(&mut self, pages: &[usize], change: &mut SessionChange) {
        let model = self.model.as_ref();
        let view = &self.view;
        let config = &self.config;

        // geometry is pure and per page; merges stay sequential
        let computed: Vec<(usize, Vec<Tile>)> = pages
            .par_iter()
            .map(|&page| (page, tiles_for_page(model, view, config, page)))
            .collect();

        for (page, tiles) in computed {
            change.absorb(self.store.merge(page, tiles));
        }
    }
}

fn tiles_for_page(
    model: &dyn DocumentModel,
    view: &ViewState,
    config: &TilingConfig,
    page: usize,
) -> Vec<Tile> {
    let Some(metric) = view.metric(page) else {
        return Vec::new();
    };
    if page >= model.page_count() {
        debug!("Skipping page {page}: document has {} pages", model.page_count());
        return Vec::new();
    }
    let Some(size) = model.page_size(page) else {
        debug!("Skipping page {page}: no page size");
        return Vec::new();
    };

    let geometry = view.page_geometry(page, size);
    compute_tiles(&geometry, metric, config, view.refresh_token(page))
}

/// Viewport-driven tile cache for any number of open documents
pub struct TileService {
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<DocumentSession>>>>,
    notifier: ChangeNotifier,
    dispatcher: RenderDispatcher,
    config: ServiceConfig,
}

impl TileService {
    /// Create a service with default configuration
    #[must_use]
    pub fn new(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self::with_config(rasterizer, ServiceConfig::default())
    }

    #[must_use]
    pub fn with_config(rasterizer: Arc<dyn Rasterizer>, config: ServiceConfig) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            notifier: ChangeNotifier::new(),
            dispatcher: RenderDispatcher::new(rasterizer, config.workers),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Open a document with its tiling parameters
    pub fn open_document(
        &self,
        id: DocumentId,
        model: Arc<dyn DocumentModel>,
        config: TilingConfig,
    ) -> Result<(), TileError> {
        config.validate()?;

        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        if documents.contains_key(&id) {
            return Err(TileError::DocumentAlreadyOpen(id));
        }

        info!(
            "Opening {id}: {} pages, tile {}px, overlap {}px, {} extra ring(s){}",
            model.page_count(),
            config.tile_size,
            config.overlap_px,
            config.extra_rings,
            if config.enabled { "" } else { ", tiling disabled" }
        );
        let session = DocumentSession {
            model,
            config,
            view: ViewState::default(),
            store: TilingDocumentState::new(),
            feed: VisibilityFeed::new(self.config.scroll_throttle),
        };
        documents.insert(id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Close a document; subscribers get an empty tile set, then disconnect
    pub fn close_document(&self, id: DocumentId) -> Result<(), TileError> {
        let session = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(TileError::UnknownDocument(id))?;

        let cancelled = self.dispatcher.cancel_document(id);
        let mut session = lock(&session);
        session.store.clear();
        self.notifier.notify(id, session.store.tile_set());
        self.notifier.close(id);
        info!("Closed {id} ({cancelled} render(s) abandoned)");
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self, id: DocumentId) -> bool {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Stream of tile sets for `id`, one per store change
    pub fn subscribe(&self, id: DocumentId) -> Result<Subscription, TileError> {
        self.session(id)?;
        Ok(self.notifier.subscribe(id))
    }

    /// Feed a scroll snapshot; recomputes once the throttle window closes.
    ///
    /// A snapshot arriving inside an open window is only queued. It is
    /// applied by [`tick`](Self::tick) at or after
    /// [`next_deadline`](Self::next_deadline), a `scroll` arriving after the
    /// deadline (which supersedes it), or a flush
    /// from `set_scale`, `set_rotation` or `invalidate`. Callers that stop
    /// scrolling must keep ticking or the last snapshot is never applied.
    pub fn scroll(
        &self,
        id: DocumentId,
        snapshot: VisibilitySnapshot,
        now: Instant,
    ) -> Result<(), TileError> {
        let session = self.session(id)?;
        let mut session = lock(&session);
        session.feed.push_scroll(snapshot, now);
        if let Some(cmd) = session.feed.poll(now) {
            self.apply(id, &mut session, vec![cmd]);
        }
        Ok(())
    }

    /// Scale changes recompute immediately
    pub fn set_scale(&self, id: DocumentId, scale: f32) -> Result<(), TileError> {
        self.with_feed(id, |feed| feed.scale_changed(scale))
    }

    /// Rotation changes recompute immediately
    pub fn set_rotation(&self, id: DocumentId, rotation: Rotation) -> Result<(), TileError> {
        self.with_feed(id, |feed| feed.rotation_changed(rotation))
    }

    /// Force every tile of `pages` through a fresh render cycle
    pub fn invalidate(&self, id: DocumentId, pages: &[usize]) -> Result<(), TileError> {
        self.with_feed(id, |feed| feed.invalidated(pages.to_vec()))
    }

    /// Run due scroll recomputes and expire overdue renders
    pub fn tick(&self, now: Instant) {
        for (id, session) in self.sessions() {
            let mut session = lock(&session);
            if let Some(cmd) = session.feed.poll(now) {
                self.apply(id, &mut session, vec![cmd]);
            }
        }
        self.expire_overdue(now);
    }

    /// Earliest instant at which `tick` has scroll work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions()
            .into_iter()
            .filter_map(|(_, session)| lock(&session).feed.next_deadline())
            .min()
    }

    /// Current tile set of a document
    pub fn tiles(&self, id: DocumentId) -> Result<TileSet, TileError> {
        let session = self.session(id)?;
        let tiles = lock(&session).store.tile_set().clone();
        Ok(tiles)
    }

    pub fn stats(&self, id: DocumentId) -> Result<TileStats, TileError> {
        let session = self.session(id)?;
        let stats = lock(&session).store.stats();
        Ok(stats)
    }

    /// Current scale and rotation of a document
    pub fn view(&self, id: DocumentId) -> Result<(f32, Rotation), TileError> {
        let session = self.session(id)?;
        let session = lock(&session);
        Ok((session.view.scale, session.view.rotation))
    }

    /// Move a pending tile to `rendering` and hand it to the worker pool
    pub fn request_render(
        &self,
        id: DocumentId,
        page: usize,
        tile: &TileId,
    ) -> Result<RequestId, TileError> {
        let session = self.session(id)?;
        let mut session = lock(&session);
        let request = self.dispatch_tile(id, &mut session, page, tile)?;
        self.notifier.notify(id, session.store.tile_set());
        Ok(request)
    }

    /// Request every pending tile of a document, in page then list order
    pub fn render_pending(&self, id: DocumentId) -> Result<Vec<RequestId>, TileError> {
        let session = self.session(id)?;
        let mut session = lock(&session);
        let pending: Vec<(usize, TileId)> = session
            .store
            .tile_set()
            .iter()
            .flat_map(|(page, tiles)| {
                tiles
                    .iter()
                    .filter(|t| !t.is_fallback && t.status == TileStatus::Pending)
                    .map(move |t| (*page, t.id.clone()))
            })
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut requests = Vec::with_capacity(pending.len());
        let mut failure = None;
        for (page, tile) in &pending {
            match self.dispatch_tile(id, &mut session, *page, tile) {
                Ok(request) => requests.push(request),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.notifier.notify(id, session.store.tile_set());
        match failure {
            Some(e) => Err(e),
            None => Ok(requests),
        }
    }

    /// `pending -> rendering` for callers that rasterize on their own
    pub fn mark_rendering(&self, id: DocumentId, page: usize, tile: &TileId) -> Result<(), TileError> {
        let session = self.session(id)?;
        let mut session = lock(&session);
        session.store.mark_rendering(page, tile)?;
        self.notifier.notify(id, session.store.tile_set());
        Ok(())
    }

    /// `rendering -> ready` for callers that rasterize on their own
    pub fn mark_ready(
        &self,
        id: DocumentId,
        page: usize,
        tile: &TileId,
    ) -> Result<StatusChange, TileError> {
        let Ok(session) = self.session(id) else {
            debug!("Discarding completion of {tile} for closed {id}");
            return Ok(StatusChange::Stale);
        };
        let mut session = lock(&session);
        let change = session.store.mark_ready(page, tile)?;
        match change {
            StatusChange::Applied { .. } => self.notifier.notify(id, session.store.tile_set()),
            StatusChange::Stale => debug!("Discarding stale completion of {tile}"),
        }
        Ok(change)
    }

    /// Record a failed render; the tile stays `rendering`
    pub fn mark_failed(&self, id: DocumentId, page: usize, tile: &TileId) -> StatusChange {
        let Ok(session) = self.session(id) else {
            return StatusChange::Stale;
        };
        let change = lock(&session).store.mark_failed(page, tile);
        if change == StatusChange::Stale {
            debug!("Discarding stale failure of {tile}");
        }
        change
    }

    /// Apply finished renders without blocking; returns the live ones
    pub fn poll_renders(&self) -> Vec<Completion> {
        let completions = self.dispatcher.poll();
        self.apply_completions(completions)
    }

    /// Like `poll_renders`, blocking up to `timeout` for the first result
    pub fn wait_renders(&self, timeout: Duration) -> Vec<Completion> {
        let completions = self.dispatcher.wait(timeout);
        self.apply_completions(completions)
    }

    /// Fail renders that exceeded the configured timeout
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let Some(timeout) = self.config.render_timeout else {
            return 0;
        };
        let expired = self.dispatcher.expire(now, timeout);
        let count = expired.len();
        self.apply_completions(expired);
        count
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.dispatcher.in_flight_count()
    }

    fn apply_completions(&self, completions: Vec<Completion>) -> Vec<Completion> {
        let mut live = Vec::with_capacity(completions.len());
        for completion in completions {
            match &completion {
                Completion::Ready {
                    document,
                    page_index,
                    tile_id,
                    ..
                } => match self.mark_ready(*document, *page_index, tile_id) {
                    Ok(StatusChange::Applied { .. }) => live.push(completion),
                    Ok(StatusChange::Stale) => {}
                    Err(e) => debug!("Ignoring completion of {tile_id}: {e}"),
                },
                Completion::Failed {
                    document,
                    page_index,
                    tile_id,
                    error,
                } => {
                    warn!("Tile {tile_id} of {document} failed: {error}");
                    if self.mark_failed(*document, *page_index, tile_id) != StatusChange::Stale {
                        live.push(completion);
                    }
                }
                Completion::Cancelled { tile_id, .. } => {
                    debug!("Render of {tile_id} cancelled");
                }
            }
        }
        live
    }

    fn dispatch_tile(
        &self,
        id: DocumentId,
        session: &mut DocumentSession,
        page: usize,
        tile: &TileId,
    ) -> Result<RequestId, TileError> {
        if self.dispatcher.is_closed() {
            return Err(TileError::DispatcherClosed);
        }
        session.store.mark_rendering(page, tile)?;
        let job = session
            .store
            .tile(page, tile)
            .map(|t| RenderJob::for_tile(id, t))
            .ok_or_else(|| TileError::UnknownTile {
                page,
                tile: tile.clone(),
            })?;
        self.dispatcher.dispatch(job).inspect_err(|e| {
            warn!("Tile {tile} on page {page} of {id:?} left rendering: {e}");
        })
    }

    fn with_feed(
        &self,
        id: DocumentId,
        f: impl FnOnce(&mut VisibilityFeed) -> Vec<Command>,
    ) -> Result<(), TileError> {
        let session = self.session(id)?;
        let mut session = lock(&session);
        let commands = f(&mut session.feed);
        self.apply(id, &mut session, commands);
        Ok(())
    }

    fn apply(&self, id: DocumentId, session: &mut DocumentSession, commands: Vec<Command>) {
        let change = session.apply(commands);
        if !change.dropped.is_empty() {
            self.dispatcher.cancel_tiles(id, &change.dropped);
        }
        if change.changed {
            let stats = session.store.stats();
            debug!(
                "{id}: {} pending, {} rendering, {} ready, {} fallback on {} page(s)",
                stats.pending, stats.rendering, stats.ready, stats.fallback, stats.pages
            );
            self.notifier.notify(id, session.store.tile_set());
        }
    }

    fn session(&self, id: DocumentId) -> Result<Arc<Mutex<DocumentSession>>, TileError> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(TileError::UnknownDocument(id))
    }

    fn sessions(&self) -> Vec<(DocumentId, Arc<Mutex<DocumentSession>>)> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, session)| (*id, Arc::clone(session)))
            .collect()
    }
}

fn lock(session: &Mutex<DocumentSession>) -> MutexGuard<'_, DocumentSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
