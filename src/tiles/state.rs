//! View state of one document: scale, rotation, visibility, refresh tokens

use std::collections::HashMap;

use super::types::{PageGeometry, Rotation, ScaleBucket, VisibilityMetric, VisibilitySnapshot};

/// Current view parameters of a document
#[derive(Clone, Debug)]
pub struct ViewState {
    /// Device pixels per document unit
    pub scale: f32,

    pub rotation: Rotation,

    /// Latest visibility snapshot, in scroll order
    pub snapshot: VisibilitySnapshot,

    refresh_tokens: HashMap<usize, u64>,
    next_refresh_token: u64,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new(1.0, Rotation::Deg0)
    }
}

impl ViewState {
    /// Smallest scale accepted
    pub const MIN_SCALE: f32 = 0.01;

    #[must_use]
    pub fn new(scale: f32, rotation: Rotation) -> Self {
        Self {
            scale: Self::clamp_scale(scale).unwrap_or(1.0),
            rotation,
            snapshot: Vec::new(),
            refresh_tokens: HashMap::new(),
            next_refresh_token: 1,
        }
    }

    /// Apply a command and return resulting effects
    #[must_use]
    pub fn apply(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::UpdateVisibility(snapshot) => {
                self.snapshot = snapshot;
                vec![Effect::RecomputeVisible]
            }

            Command::SetScale(scale) => {
                let Some(clamped) = Self::clamp_scale(scale) else {
                    return vec![];
                };
                let bucket_changed =
                    ScaleBucket::from_scale(clamped) != ScaleBucket::from_scale(self.scale);
                self.scale = clamped;
                if bucket_changed {
                    vec![Effect::RecomputeVisible]
                } else {
                    vec![]
                }
            }

            Command::SetRotation(rotation) => {
                if self.rotation != rotation {
                    self.rotation = rotation;
                    vec![Effect::RecomputeVisible]
                } else {
                    vec![]
                }
            }

            Command::Invalidate(pages) => {
                if pages.is_empty() {
                    return vec![];
                }
                let token = self.next_refresh_token;
                self.next_refresh_token += 1;
                for &page in &pages {
                    self.refresh_tokens.insert(page, token);
                }
                vec![Effect::RecomputePages(pages)]
            }
        }
    }

    /// Refresh token minted by the last invalidation of `page`
    #[must_use]
    pub fn refresh_token(&self, page: usize) -> Option<u64> {
        self.refresh_tokens.get(&page).copied()
    }

    /// Visibility of `page` in the latest snapshot
    #[must_use]
    pub fn metric(&self, page: usize) -> Option<&VisibilityMetric> {
        self.snapshot.iter().find(|m| m.page_index == page)
    }

    /// Geometry of a page of the given size under the current transform
    #[must_use]
    pub fn page_geometry(&self, index: usize, (width, height): (f32, f32)) -> PageGeometry {
        PageGeometry {
            index,
            width,
            height,
            scale: self.scale,
            rotation: self.rotation,
        }
    }

    /// Clamp to the valid range; NaN and infinities are rejected
    #[must_use]
    pub fn clamp_scale(scale: f32) -> Option<f32> {
        scale.is_finite().then(|| scale.max(Self::MIN_SCALE))
    }
}

/// Commands that modify view state
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Replace the visibility snapshot
    UpdateVisibility(VisibilitySnapshot),
    /// Set the scale factor
    SetScale(f32),
    /// Set the page rotation
    SetRotation(Rotation),
    /// Force fresh tile ids for these pages
    Invalidate(Vec<usize>),
}

/// Effects produced by state changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Recompute every page of the snapshot and empty pages that left it
    RecomputeVisible,
    /// Recompute specific pages
    RecomputePages(Vec<usize>),
}
