//! Render request and response types

use std::sync::Arc;

use super::types::{Bitmap, DocumentId, PixelRect, Rect, Rotation, Tile, TileId};

/// Unique identifier for render requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Everything a rasterizer needs to produce one tile
#[derive(Clone, Debug, PartialEq)]
pub struct RenderJob {
    pub document: DocumentId,
    pub page_index: usize,
    pub tile_id: TileId,
    /// Area to render, page-local units
    pub page_rect: Rect,
    /// Target area in device pixels of the rotated page
    pub pixel_rect: PixelRect,
    pub scale: f32,
    pub rotation: Rotation,
}

impl RenderJob {
    #[must_use]
    pub fn for_tile(document: DocumentId, tile: &Tile) -> Self {
        Self {
            document,
            page_index: tile.page_index,
            tile_id: tile.id.clone(),
            page_rect: tile.page_rect,
            pixel_rect: tile.pixel_rect,
            scale: tile.src_scale,
            rotation: tile.rotation,
        }
    }
}

/// Request sent to render workers
#[derive(Debug)]
pub enum RenderRequest {
    /// Rasterize one tile
    Tile { id: RequestId, job: RenderJob },

    /// Shutdown the worker
    Shutdown,
}

/// Errors from render workers
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RenderFault {
    #[error("rasterizer: {detail}")]
    Rasterizer { detail: String },

    #[error("render timed out")]
    TimedOut,
}

impl RenderFault {
    pub fn rasterizer(msg: impl Into<String>) -> Self {
        Self::Rasterizer { detail: msg.into() }
    }
}

/// Response from render workers
#[derive(Debug)]
pub enum RenderResponse {
    /// Rendered tile pixels
    Tile { id: RequestId, bitmap: Arc<Bitmap> },

    /// Request was cancelled before it started
    Cancelled(RequestId),

    /// Error during rendering
    Error { id: RequestId, error: RenderFault },
}

impl RenderResponse {
    #[must_use]
    pub fn id(&self) -> RequestId {
        match self {
            Self::Tile { id, .. } | Self::Cancelled(id) | Self::Error { id, .. } => *id,
        }
    }
}
