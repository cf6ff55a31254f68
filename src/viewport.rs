//! Zoom, rotation and scroll state of a continuous vertical page layout
//!
//! Stands in for the viewer's scroll subsystem: it turns a scroll offset and
//! a viewport size into the visibility snapshots the tile service consumes.

use crate::tiles::geometry::device_to_page;
use crate::tiles::{PageGeometry, PixelRect, Rotation, VisibilityMetric, VisibilitySnapshot};

/// Scroll/pan direction
#[derive(Clone, Copy, Debug)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Visible area in device pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Zoom, rotation and scroll state for a stack of pages
#[derive(Debug)]
pub struct ViewportState {
    /// Current zoom factor (1.0 = one device pixel per document unit)
    pub factor: f32,

    pub rotation: Rotation,

    /// Horizontal pan in device pixels from the left page edge
    pub pan_x: u32,

    /// Vertical scroll offset in device pixels from the top of the first page
    pub global_scroll_offset: u32,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            factor: 1.0,
            rotation: Rotation::Deg0,
            pan_x: 0,
            global_scroll_offset: 0,
        }
    }
}

impl ViewportState {
    /// Zoom in rate multiplier per step - 10%
    pub const ZOOM_IN_RATE: f32 = 1.1;
    /// Zoom out rate divisor per step - 5%
    pub const ZOOM_OUT_RATE: f32 = 1.05;
    /// Minimum allowed zoom factor
    pub const MIN_SCALE: f32 = 0.1;

    /// Base pan step in device pixels at zoom 1.0
    pub const BASE_PAN_STEP: f32 = 64.0;

    pub fn factor(&self) -> f32 {
        self.factor
    }

    /// Zoom in by one step
    pub fn step_in(&mut self) {
        self.factor = Self::clamp_factor(self.factor * Self::ZOOM_IN_RATE);
    }

    /// Zoom out by one step
    pub fn step_out(&mut self) {
        self.factor = Self::clamp_factor(self.factor / Self::ZOOM_OUT_RATE);
    }

    pub fn rotate_cw(&mut self) {
        self.rotation = self.rotation.rotate_cw();
    }

    /// Pan in the given direction, step grows with the zoom factor
    pub fn pan(&mut self, direction: ScrollDirection) {
        let step = (Self::BASE_PAN_STEP * self.factor).max(1.0) as u32;

        match direction {
            ScrollDirection::Up => {
                self.global_scroll_offset = self.global_scroll_offset.saturating_sub(step);
            }
            ScrollDirection::Down => {
                self.global_scroll_offset = self.global_scroll_offset.saturating_add(step);
            }
            ScrollDirection::Left => {
                self.pan_x = self.pan_x.saturating_sub(step);
            }
            ScrollDirection::Right => {
                self.pan_x = self.pan_x.saturating_add(step);
            }
        }
    }

    /// Scroll so the given page starts at the top of the viewport
    pub fn scroll_to_page(&mut self, page: usize, page_sizes: &[(f32, f32)], gap: u32) {
        self.global_scroll_offset = self
            .page_extents(page_sizes)
            .iter()
            .take(page)
            .map(|&(_, h)| h + gap)
            .sum();
    }

    /// Scroll to the top of the document
    pub fn scroll_to_top(&mut self) {
        self.global_scroll_offset = 0;
    }

    /// Clamp factor to valid range, handling NaN/Inf
    pub fn clamp_factor(factor: f32) -> f32 {
        if !factor.is_finite() {
            1.0
        } else {
            factor.max(Self::MIN_SCALE)
        }
    }

    /// Device size of every page at the current zoom and rotation
    #[must_use]
    pub fn page_extents(&self, page_sizes: &[(f32, f32)]) -> Vec<(u32, u32)> {
        page_sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| {
                let geometry = self.geometry(index, size);
                if geometry.is_valid() {
                    geometry.device_size()
                } else {
                    (0, 0)
                }
            })
            .collect()
    }

    /// Pages intersecting `viewport`, top to bottom, with page-local visible rects
    #[must_use]
    pub fn visible_pages(
        &self,
        page_sizes: &[(f32, f32)],
        viewport: Viewport,
        gap: u32,
    ) -> VisibilitySnapshot {
        let view_top = self.global_scroll_offset;
        let view_bottom = view_top.saturating_add(viewport.height);
        let view_left = self.pan_x;
        let view_right = view_left.saturating_add(viewport.width);

        let mut snapshot = Vec::new();
        let mut top = 0u32;
        for (index, &size) in page_sizes.iter().enumerate() {
            if top >= view_bottom {
                break;
            }
            let geometry = self.geometry(index, size);
            if !geometry.is_valid() {
                continue;
            }
            let (width, height) = geometry.device_size();
            let bottom = top.saturating_add(height);

            let y0 = view_top.max(top);
            let y1 = view_bottom.min(bottom);
            let x0 = view_left.min(width);
            let x1 = view_right.min(width);
            if y1 > y0 && x1 > x0 {
                let device = PixelRect::from_edges(x0, y0 - top, x1, y1 - top);
                snapshot.push(VisibilityMetric {
                    page_index: index,
                    visible_rect: device_to_page(&device, &geometry),
                    scroll_position: snapshot.len() + 1,
                });
            }
            top = bottom.saturating_add(gap);
        }
        snapshot
    }

    fn geometry(&self, index: usize, (width, height): (f32, f32)) -> PageGeometry {
        PageGeometry {
            index,
            width,
            height,
            scale: self.factor,
            rotation: self.rotation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::Rect;

    const PAGES: [(f32, f32); 3] = [(100.0, 200.0), (100.0, 200.0), (100.0, 200.0)];
    const VIEW: Viewport = Viewport {
        width: 100,
        height: 250,
    };

    #[test]
    fn top_of_document_shows_first_two_pages() {
        let state = ViewportState::default();

        let snapshot = state.visible_pages(&PAGES, VIEW, 10);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].visible_rect, Rect::new(0.0, 0.0, 100.0, 200.0));
        assert_eq!(snapshot[0].scroll_position, 1);
        assert_eq!(snapshot[1].page_index, 1);
        assert_eq!(snapshot[1].visible_rect, Rect::new(0.0, 0.0, 100.0, 40.0));
        assert_eq!(snapshot[1].scroll_position, 2);
    }

    #[test]
    fn scroll_to_page_skips_gaps() {
        let mut state = ViewportState::default();
        state.scroll_to_page(2, &PAGES, 10);
        assert_eq!(state.global_scroll_offset, 420);

        let snapshot = state.visible_pages(&PAGES, VIEW, 10);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].page_index, 2);
        assert_eq!(snapshot[0].scroll_position, 1);

        state.scroll_to_top();
        assert_eq!(state.global_scroll_offset, 0);
    }

    #[test]
    fn zoom_narrows_the_visible_rect() {
        let mut state = ViewportState {
            factor: 2.0,
            ..ViewportState::default()
        };
        state.pan(ScrollDirection::Right);
        assert_eq!(state.pan_x, 128);

        let snapshot = state.visible_pages(&PAGES, VIEW, 0);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].visible_rect, Rect::new(64.0, 0.0, 36.0, 125.0));
    }

    #[test]
    fn rotation_maps_back_to_page_coordinates() {
        let state = ViewportState {
            rotation: Rotation::Deg90,
            ..ViewportState::default()
        };

        let snapshot = state.visible_pages(&PAGES, VIEW, 0);

        // rotated pages are 200x100, the viewport sees the left half of each
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].visible_rect, Rect::new(0.0, 100.0, 100.0, 100.0));
    }

    #[test]
    fn zoom_steps_respect_minimum() {
        let mut state = ViewportState::default();
        state.step_in();
        assert!((state.factor() - 1.1).abs() < 1e-6);

        for _ in 0..200 {
            state.step_out();
        }
        assert_eq!(state.factor(), ViewportState::MIN_SCALE);
        assert_eq!(ViewportState::clamp_factor(f32::NAN), 1.0);
    }

    #[test]
    fn invalid_pages_are_skipped() {
        let state = ViewportState::default();
        let pages = [(0.0, 200.0), (100.0, 100.0)];

        let snapshot = state.visible_pages(&pages, VIEW, 0);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].page_index, 1);
        assert_eq!(state.page_extents(&pages), vec![(0, 0), (100, 100)]);
    }
}
