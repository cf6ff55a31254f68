pub mod settings;
pub mod tiles;
pub mod viewport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export the service surface
pub use tiles::{
    DocumentId, DocumentModel, Rasterizer, ServiceConfig, Tile, TileError, TileService, TileSet,
    TileStatus, TilingConfig,
};
