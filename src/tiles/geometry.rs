//! Tile geometry: which device-pixel cells of a page need rendering
//!
//! Pure functions only. The grid is anchored at the device-space origin of
//! the rotated, scaled page, so a cell keeps its column/row (and therefore
//! its id) while the viewport scrolls.

use log::debug;

use super::types::{
    Epoch, PageGeometry, PixelRect, Rect, Rotation, ScaleBucket, Tile, TileId, TileStatus,
    TilingConfig, VisibilityMetric,
};

/// Compute the tiles covering the visible part of `page` plus `extra_rings`.
///
/// Invalid page dimensions, a disabled config, or an empty visible area all
/// yield an empty list.
#[must_use]
pub fn compute_tiles(
    page: &PageGeometry,
    metric: &VisibilityMetric,
    config: &TilingConfig,
    refresh_token: Option<u64>,
) -> Vec<Tile> {
    if !config.enabled || config.tile_size == 0 {
        return Vec::new();
    }
    if !page.is_valid() {
        debug!(
            "Skipping page {}: invalid geometry {}x{} at scale {}",
            page.index, page.width, page.height, page.scale
        );
        return Vec::new();
    }
    if metric.page_index != page.index {
        debug!(
            "Skipping page {}: visibility reported for page {}",
            page.index, metric.page_index
        );
        return Vec::new();
    }

    let Some(visible) = metric.visible_rect.intersect(&page.bounds()) else {
        return Vec::new();
    };
    let visible_px = page_to_device(&visible, page);
    if visible_px.is_empty() {
        return Vec::new();
    }

    let (device_w, device_h) = page.device_size();
    let tile = config.tile_size;
    let ring = config.extra_rings.saturating_mul(tile);

    let x0 = visible_px.x.saturating_sub(ring);
    let y0 = visible_px.y.saturating_sub(ring);
    let x1 = visible_px.right().saturating_add(ring).min(device_w);
    let y1 = visible_px.bottom().saturating_add(ring).min(device_h);
    if x1 <= x0 || y1 <= y0 {
        return Vec::new();
    }

    let epoch = Epoch {
        scale: ScaleBucket::from_scale(page.scale),
        rotation: page.rotation,
    };

    let (first_col, last_col) = (x0 / tile, (x1 - 1) / tile);
    let (first_row, last_row) = (y0 / tile, (y1 - 1) / tile);
    let mut tiles = Vec::with_capacity(cell_count((first_col, last_col), (first_row, last_row)));

    for row in first_row..=last_row {
        for column in first_col..=last_col {
            let pixel_rect = cell_rect(column, row, config, (device_w, device_h));
            if pixel_rect.is_empty() {
                continue;
            }
            tiles.push(Tile {
                id: TileId::new(page.index, column, row, epoch, refresh_token),
                page_index: page.index,
                column,
                row,
                page_rect: device_to_page(&pixel_rect, page),
                pixel_rect,
                src_scale: page.scale,
                rotation: page.rotation,
                is_fallback: false,
                status: TileStatus::Pending,
            });
        }
    }

    tiles
}

/// Number of cells in inclusive column and row ranges, widened before multiplying
fn cell_count((first_col, last_col): (u32, u32), (first_row, last_row): (u32, u32)) -> usize {
    let columns = (last_col - first_col) as usize + 1;
    let rows = (last_row - first_row) as usize + 1;
    columns.saturating_mul(rows)
}

/// Grid cell `(column, row)` grown by the overlap and clamped to the page
#[must_use]
pub fn cell_rect(column: u32, row: u32, config: &TilingConfig, device: (u32, u32)) -> PixelRect {
    let tile = config.tile_size;
    let overlap = config.overlap_px;
    let cell_x = column.saturating_mul(tile);
    let cell_y = row.saturating_mul(tile);

    PixelRect::from_edges(
        cell_x.saturating_sub(overlap).min(device.0),
        cell_y.saturating_sub(overlap).min(device.1),
        cell_x
            .saturating_add(tile)
            .saturating_add(overlap)
            .min(device.0),
        cell_y
            .saturating_add(tile)
            .saturating_add(overlap)
            .min(device.1),
    )
}

/// Map a page-local rectangle to device pixels, rounding outward
#[must_use]
pub fn page_to_device(rect: &Rect, page: &PageGeometry) -> PixelRect {
    let (w, h) = (page.width, page.height);
    let (ax, ay) = rotate_point(rect.x, rect.y, w, h, page.rotation);
    let (bx, by) = rotate_point(rect.right(), rect.bottom(), w, h, page.rotation);
    let (device_w, device_h) = page.device_size();

    let to_px = |v: f32, round: fn(f32) -> f32, limit: u32| -> u32 {
        (round(v * page.scale).max(0.0) as u32).min(limit)
    };

    PixelRect::from_edges(
        to_px(ax.min(bx), f32::floor, device_w),
        to_px(ay.min(by), f32::floor, device_h),
        to_px(ax.max(bx), f32::ceil, device_w),
        to_px(ay.max(by), f32::ceil, device_h),
    )
}

/// Map device pixels back to page-local units, clamped to the page
#[must_use]
pub fn device_to_page(rect: &PixelRect, page: &PageGeometry) -> Rect {
    let (w, h) = (page.width, page.height);
    let scale = page.scale;
    let (ax, ay) = unrotate_point(rect.x as f32 / scale, rect.y as f32 / scale, w, h, page.rotation);
    let (bx, by) = unrotate_point(
        rect.right() as f32 / scale,
        rect.bottom() as f32 / scale,
        w,
        h,
        page.rotation,
    );

    let x0 = ax.min(bx).clamp(0.0, w);
    let y0 = ay.min(by).clamp(0.0, h);
    let x1 = ax.max(bx).clamp(0.0, w);
    let y1 = ay.max(by).clamp(0.0, h);
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

fn rotate_point(x: f32, y: f32, w: f32, h: f32, rotation: Rotation) -> (f32, f32) {
    match rotation {
        Rotation::Deg0 => (x, y),
        Rotation::Deg90 => (h - y, x),
        Rotation::Deg180 => (w - x, h - y),
        Rotation::Deg270 => (y, w - x),
    }
}

fn unrotate_point(u: f32, v: f32, w: f32, h: f32, rotation: Rotation) -> (f32, f32) {
    match rotation {
        Rotation::Deg0 => (u, v),
        Rotation::Deg90 => (v, h - u),
        Rotation::Deg180 => (w - u, h - v),
        Rotation::Deg270 => (w - v, u),
    }
}
