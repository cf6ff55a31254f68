//! Core types for tiled page rendering

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an open document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// Rectangle in page-local document units (unscaled, unrotated)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[must_use]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// True for zero-area, negative or non-finite rectangles
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite())
            || self.width <= 0.0
            || self.height <= 0.0
    }

    /// Intersection of two rectangles, `None` when they do not overlap
    #[must_use]
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        let rect = Rect::new(x0, y0, x1 - x0, y1 - y0);
        (!rect.is_empty()).then_some(rect)
    }
}

/// Rectangle in device pixels of the scaled, rotated page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from edge coordinates; inverted edges collapse to an empty rect
    #[must_use]
    pub fn from_edges(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    #[must_use]
    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    #[must_use]
    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Page rotation, clockwise
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Normalize any multiple of 90 degrees (negative values included)
    #[must_use]
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    #[must_use]
    pub const fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Width and height trade places
    #[must_use]
    pub const fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    #[must_use]
    pub const fn rotate_cw(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg90,
            Self::Deg90 => Self::Deg180,
            Self::Deg180 => Self::Deg270,
            Self::Deg270 => Self::Deg0,
        }
    }
}

/// Page dimensions plus the transform currently applied to it
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageGeometry {
    /// Page index (0-based)
    pub index: usize,
    /// Width in document units
    pub width: f32,
    /// Height in document units
    pub height: f32,
    /// Device pixels per document unit
    pub scale: f32,
    pub rotation: Rotation,
}

impl PageGeometry {
    /// Dimensions and scale are finite and positive
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.width.is_finite()
            && self.height.is_finite()
            && self.scale.is_finite()
            && self.width > 0.0
            && self.height > 0.0
            && self.scale > 0.0
    }

    /// Page bounds in page-local units
    #[must_use]
    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width, self.height)
    }

    /// Size of the rotated, scaled page in device pixels
    #[must_use]
    pub fn device_size(&self) -> (u32, u32) {
        let (w, h) = if self.rotation.is_quarter_turn() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        };
        (
            (w * self.scale).ceil().max(0.0) as u32,
            (h * self.scale).ceil().max(0.0) as u32,
        )
    }
}

/// Visible part of one page, as reported by the viewport
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisibilityMetric {
    pub page_index: usize,
    /// Visible rectangle in page-local, unscaled coordinates
    pub visible_rect: Rect,
    /// 1-based position of the page in scroll order
    pub scroll_position: usize,
}

/// All pages intersecting the viewport at one instant
pub type VisibilitySnapshot = Vec<VisibilityMetric>;

/// Quantized scale so float jitter does not mint new tile ids
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScaleBucket(pub u32);

impl ScaleBucket {
    /// Buckets per unit of scale (0.001 resolution)
    pub const PER_UNIT: f32 = 1000.0;

    #[must_use]
    pub fn from_scale(scale: f32) -> Self {
        if scale.is_finite() && scale > 0.0 {
            Self((scale * Self::PER_UNIT).round() as u32)
        } else {
            Self(0)
        }
    }
}

/// The scale and rotation a set of tiles was computed for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Epoch {
    pub scale: ScaleBucket,
    pub rotation: Rotation,
}

/// Deterministic tile identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(String);

impl TileId {
    #[must_use]
    pub fn new(
        page: usize,
        column: u32,
        row: u32,
        epoch: Epoch,
        refresh_token: Option<u64>,
    ) -> Self {
        let mut id = format!(
            "p{page}:c{column}:r{row}:s{}:o{}",
            epoch.scale.0,
            epoch.rotation.degrees()
        );
        if let Some(token) = refresh_token {
            id.push_str(&format!(":t{token}"));
        }
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render lifecycle of a tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TileStatus {
    /// In the store, no render issued yet
    Pending,
    /// Render request in flight
    Rendering,
    /// Pixels produced
    Ready,
}

impl TileStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TileStatus::Pending => "pending",
            TileStatus::Rendering => "rendering",
            TileStatus::Ready => "ready",
        }
    }
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic unit of the cache
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    pub id: TileId,
    pub page_index: usize,
    /// Grid column in device space
    pub column: u32,
    /// Grid row in device space
    pub row: u32,
    /// Area covered, in page-local units
    pub page_rect: Rect,
    /// Area covered, in device pixels (overlap included)
    pub pixel_rect: PixelRect,
    /// Scale this tile was computed for
    pub src_scale: f32,
    pub rotation: Rotation,
    /// Stale tile kept on screen until its replacement epoch is ready
    pub is_fallback: bool,
    pub status: TileStatus,
}

impl Tile {
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        Epoch {
            scale: ScaleBucket::from_scale(self.src_scale),
            rotation: self.rotation,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == TileStatus::Ready
    }
}

/// Page index -> tiles, as handed to the presentation layer
pub type TileSet = BTreeMap<usize, Vec<Tile>>;

/// Rendered pixels for one tile (RGBA, row-major)
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Allocate a bitmap filled with one color
    #[must_use]
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let len = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(len * 4);
        for _ in 0..len {
            pixels.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Per-document tiling parameters, fixed at document open
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Edge of a grid cell in device pixels, before overlap
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    /// Pixels each tile bleeds past its cell on every side
    #[serde(default = "default_overlap_px")]
    pub overlap_px: u32,
    /// Tile rings fetched beyond the visible area
    #[serde(default = "default_extra_rings")]
    pub extra_rings: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_tile_size() -> u32 {
    256
}

fn default_overlap_px() -> u32 {
    2
}

fn default_extra_rings() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            overlap_px: default_overlap_px(),
            extra_rings: default_extra_rings(),
            enabled: true,
        }
    }
}

impl TilingConfig {
    pub fn validate(&self) -> Result<(), TileError> {
        if self.tile_size == 0 {
            return Err(TileError::InvalidConfig {
                detail: "tile_size must be positive".to_string(),
            });
        }
        if self.overlap_px >= self.tile_size {
            return Err(TileError::InvalidConfig {
                detail: format!(
                    "overlap_px ({}) must be smaller than tile_size ({})",
                    self.overlap_px, self.tile_size
                ),
            });
        }
        Ok(())
    }
}

/// Tile counts for one document
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileStats {
    pub pages: usize,
    pub pending: usize,
    pub rendering: usize,
    pub ready: usize,
    pub fallback: usize,
}

impl TileStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.rendering + self.ready + self.fallback
    }
}

/// Errors surfaced by the tile cache
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("unknown document {0}")]
    UnknownDocument(DocumentId),

    #[error("document {0} is already open")]
    DocumentAlreadyOpen(DocumentId),

    #[error("no tile {tile} on page {page}")]
    UnknownTile { page: usize, tile: TileId },

    #[error("tile {tile} cannot go from {from} to {to}")]
    InvalidTransition {
        tile: TileId,
        from: TileStatus,
        to: TileStatus,
    },

    #[error("tile {0} is a fallback tile and cannot change status")]
    FallbackTile(TileId),

    #[error("invalid tiling config: {detail}")]
    InvalidConfig { detail: String },

    #[error("render workers have shut down")]
    DispatcherClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_normalizes_degrees() {
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Deg270.rotate_cw(), Rotation::Deg0);
    }

    #[test]
    fn scale_bucket_absorbs_jitter() {
        assert_eq!(
            ScaleBucket::from_scale(1.0),
            ScaleBucket::from_scale(1.000_2)
        );
        assert_ne!(ScaleBucket::from_scale(1.0), ScaleBucket::from_scale(1.5));
        assert_eq!(ScaleBucket::from_scale(f32::NAN), ScaleBucket(0));
    }

    #[test]
    fn tile_id_encodes_refresh_token() {
        let epoch = Epoch {
            scale: ScaleBucket::from_scale(1.5),
            rotation: Rotation::Deg90,
        };
        assert_eq!(TileId::new(3, 1, 2, epoch, None).as_str(), "p3:c1:r2:s1500:o90");
        assert_eq!(
            TileId::new(3, 1, 2, epoch, Some(7)).as_str(),
            "p3:c1:r2:s1500:o90:t7"
        );
    }

    #[test]
    fn rect_intersection() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        let b = Rect::new(50.0, 80.0, 100.0, 100.0);
        assert_eq!(a.intersect(&b), Some(Rect::new(50.0, 80.0, 50.0, 20.0)));
        assert_eq!(a.intersect(&Rect::new(200.0, 0.0, 10.0, 10.0)), None);
        assert_eq!(a.intersect(&Rect::new(10.0, 10.0, 0.0, 10.0)), None);
    }

    #[test]
    fn device_size_swaps_on_quarter_turn() {
        let page = PageGeometry {
            index: 0,
            width: 100.0,
            height: 200.0,
            scale: 1.5,
            rotation: Rotation::Deg90,
        };
        assert_eq!(page.device_size(), (300, 150));
    }

    #[test]
    fn config_validation() {
        assert!(TilingConfig::default().validate().is_ok());
        let zero = TilingConfig {
            tile_size: 0,
            ..TilingConfig::default()
        };
        assert!(matches!(zero.validate(), Err(TileError::InvalidConfig { .. })));
        let wide_overlap = TilingConfig {
            tile_size: 8,
            overlap_px: 8,
            ..TilingConfig::default()
        };
        assert!(wide_overlap.validate().is_err());
    }
}
