//! Tile render cache infrastructure

mod cache;
mod dispatcher;
mod feed;
pub mod geometry;
mod notifier;
mod request;
mod service;
mod state;
mod store;
mod types;
mod worker;

pub use cache::{BitmapCache, CacheKey, DEFAULT_CACHE_SIZE};
pub use dispatcher::{Completion, DEFAULT_WORKERS, RenderDispatcher};
pub use feed::{DEFAULT_THROTTLE, VisibilityFeed};
pub use geometry::compute_tiles;
pub use notifier::{ChangeNotifier, Subscription, TileSetChanged};
pub use request::{RenderFault, RenderJob, RequestId};
pub use service::{DocumentModel, ServiceConfig, TileService};
pub use state::{Command, Effect, ViewState};
pub use store::{MergeOutcome, StatusChange, TilingDocumentState};
pub use types::*;
pub use worker::Rasterizer;
