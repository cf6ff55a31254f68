//! Per-document tile store and the merge that keeps it flicker-free
//!
//! Every page holds one list of tiles. At most one epoch (scale + rotation)
//! of non-fallback tiles is authoritative; ready tiles of the previous epoch
//! stay behind as fallback tiles until the new epoch is fully ready.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use super::types::{TileError, TileId, Tile, TileSet, TileStats, TileStatus};

/// Summary of what a merge did to one page
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeOutcome {
    /// Store contents differ from before the merge
    pub changed: bool,
    /// Tiles appended as new `pending` tiles
    pub added: usize,
    /// Ready tiles turned into fallback tiles
    pub promoted: usize,
    /// Fallback tiles discarded
    pub retired: usize,
    /// Non-fallback tiles removed without promotion
    pub dropped: Vec<TileId>,
}

/// Result of a status callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChange {
    /// The tile changed status; `retired` fallback tiles were discarded
    Applied { retired: usize },
    /// The tile is gone or already in the target state
    Stale,
}

/// Tile lists of one open document
#[derive(Debug, Default)]
pub struct TilingDocumentState {
    visible_tiles: BTreeMap<usize, Vec<Tile>>,
}

impl TilingDocumentState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tiles of `page`; an absent page simply has none
    #[must_use]
    pub fn tiles(&self, page: usize) -> &[Tile] {
        self.visible_tiles.get(&page).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn tile_set(&self) -> &TileSet {
        &self.visible_tiles
    }

    /// Page indexes that currently hold tiles, ascending
    pub fn pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.visible_tiles.keys().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visible_tiles.is_empty()
    }

    /// Reconcile `page` with a freshly computed, non-fallback tile list.
    pub fn merge(&mut self, page: usize, incoming: Vec<Tile>) -> MergeOutcome {
        let prev = self.visible_tiles.remove(&page).unwrap_or_default();
        let mut outcome = MergeOutcome::default();

        let prev_epoch = prev.iter().find(|t| !t.is_fallback).map(Tile::epoch);
        let next_epoch = incoming.first().map(Tile::epoch);

        let mut merged = match (prev_epoch, next_epoch) {
            (Some(prev_epoch), Some(next_epoch)) if prev_epoch != next_epoch => {
                debug!("Page {page}: epoch {prev_epoch:?} -> {next_epoch:?}");
                epoch_transition(prev, incoming, &mut outcome)
            }
            _ => same_epoch(prev, incoming, &mut outcome),
        };

        outcome.retired += retire_fallbacks(&mut merged);
        if outcome.retired > 0 {
            outcome.changed = true;
        }
        if !merged.is_empty() {
            self.visible_tiles.insert(page, merged);
        }
        outcome
    }

    /// `pending -> rendering`
    pub fn mark_rendering(&mut self, page: usize, id: &TileId) -> Result<(), TileError> {
        let tile = self.current_tile_mut(page, id)?;
        match tile.status {
            TileStatus::Pending => {
                tile.status = TileStatus::Rendering;
                Ok(())
            }
            from => Err(TileError::InvalidTransition {
                tile: id.clone(),
                from,
                to: TileStatus::Rendering,
            }),
        }
    }

    /// `rendering -> ready`. Unknown tiles are stale completions, not errors;
    /// so is a `pending` tile, which was dropped and re-created under the same
    /// id while the render was out.
    pub fn mark_ready(&mut self, page: usize, id: &TileId) -> Result<StatusChange, TileError> {
        let tile = match self.current_tile_mut(page, id) {
            Ok(tile) => tile,
            Err(TileError::UnknownTile { .. } | TileError::FallbackTile(_)) => {
                return Ok(StatusChange::Stale);
            }
            Err(e) => return Err(e),
        };

        match tile.status {
            TileStatus::Rendering => {
                tile.status = TileStatus::Ready;
            }
            TileStatus::Ready => return Ok(StatusChange::Stale),
            TileStatus::Pending => {
                debug!("Completion of {id} arrived for a re-created tile");
                return Ok(StatusChange::Stale);
            }
        }

        let retired = self
            .visible_tiles
            .get_mut(&page)
            .map_or(0, retire_fallbacks);
        Ok(StatusChange::Applied { retired })
    }

    /// A render failed. The tile stays `rendering` until something replaces it.
    #[must_use]
    pub fn mark_failed(&self, page: usize, id: &TileId) -> StatusChange {
        let rendering = self
            .tiles(page)
            .iter()
            .any(|t| !t.is_fallback && t.id == *id && t.status == TileStatus::Rendering);
        if rendering {
            StatusChange::Applied { retired: 0 }
        } else {
            StatusChange::Stale
        }
    }

    /// Look up the authoritative (non-fallback) tile with `id`
    #[must_use]
    pub fn tile(&self, page: usize, id: &TileId) -> Option<&Tile> {
        self.tiles(page)
            .iter()
            .find(|t| !t.is_fallback && t.id == *id)
    }

    pub fn clear(&mut self) {
        self.visible_tiles.clear();
    }

    #[must_use]
    pub fn stats(&self) -> TileStats {
        let mut stats = TileStats {
            pages: self.visible_tiles.len(),
            ..TileStats::default()
        };
        for tile in self.visible_tiles.values().flatten() {
            if tile.is_fallback {
                stats.fallback += 1;
                continue;
            }
            match tile.status {
                TileStatus::Pending => stats.pending += 1,
                TileStatus::Rendering => stats.rendering += 1,
                TileStatus::Ready => stats.ready += 1,
            }
        }
        stats
    }

    fn current_tile_mut(&mut self, page: usize, id: &TileId) -> Result<&mut Tile, TileError> {
        let tiles = self
            .visible_tiles
            .get_mut(&page)
            .ok_or_else(|| TileError::UnknownTile {
                page,
                tile: id.clone(),
            })?;

        let mut saw_fallback = false;
        for tile in tiles.iter_mut() {
            if tile.id != *id {
                continue;
            }
            if tile.is_fallback {
                saw_fallback = true;
            } else {
                return Ok(tile);
            }
        }

        if saw_fallback {
            Err(TileError::FallbackTile(id.clone()))
        } else {
            Err(TileError::UnknownTile {
                page,
                tile: id.clone(),
            })
        }
    }
}

/// Scale or rotation changed: keep ready pixels of the old epoch as fallback.
fn epoch_transition(prev: Vec<Tile>, incoming: Vec<Tile>, outcome: &mut MergeOutcome) -> Vec<Tile> {
    let (fallbacks, current): (Vec<Tile>, Vec<Tile>) =
        prev.into_iter().partition(|t| t.is_fallback);

    let mut promoted = Vec::with_capacity(current.len());
    for mut tile in current {
        if tile.is_ready() {
            tile.is_fallback = true;
            promoted.push(tile);
        } else {
            // never produced pixels, nothing to bridge with
            outcome.dropped.push(tile.id);
        }
    }

    // one fallback epoch at a time, unless the old epoch had nothing ready
    let mut merged = if promoted.is_empty() {
        fallbacks
    } else {
        outcome.retired += fallbacks.len();
        Vec::with_capacity(promoted.len() + incoming.len())
    };
    outcome.promoted = promoted.len();
    merged.extend(promoted);

    let mut seen = HashSet::with_capacity(incoming.len());
    for tile in incoming {
        if seen.insert(tile.id.clone()) {
            merged.push(fresh(tile));
            outcome.added += 1;
        }
    }

    outcome.changed = true;
    merged
}

/// Same epoch: reuse tiles still wanted, drop the rest, append the new ones.
fn same_epoch(prev: Vec<Tile>, incoming: Vec<Tile>, outcome: &mut MergeOutcome) -> Vec<Tile> {
    let wanted: HashSet<&TileId> = incoming.iter().map(|t| &t.id).collect();
    let mut kept_ids: HashSet<TileId> = HashSet::with_capacity(incoming.len());
    let mut merged = Vec::with_capacity(prev.len().max(incoming.len()));

    for tile in prev {
        if tile.is_fallback {
            merged.push(tile);
        } else if wanted.contains(&tile.id) && !kept_ids.contains(&tile.id) {
            kept_ids.insert(tile.id.clone());
            merged.push(tile);
        } else {
            outcome.dropped.push(tile.id);
        }
    }
    drop(wanted);

    for tile in incoming {
        if !kept_ids.contains(&tile.id) {
            kept_ids.insert(tile.id.clone());
            merged.push(fresh(tile));
            outcome.added += 1;
        }
    }

    outcome.changed = outcome.added > 0 || !outcome.dropped.is_empty();
    merged
}

/// Drop fallback tiles once every non-fallback tile of the page is ready.
fn retire_fallbacks(tiles: &mut Vec<Tile>) -> usize {
    let fallback_count = tiles.iter().filter(|t| t.is_fallback).count();
    if fallback_count == 0 {
        return 0;
    }
    let epoch_ready = tiles.iter().filter(|t| !t.is_fallback).all(Tile::is_ready);
    if !epoch_ready {
        return 0;
    }
    tiles.retain(|t| !t.is_fallback);
    fallback_count
}

fn fresh(mut tile: Tile) -> Tile {
    tile.is_fallback = false;
    tile.status = TileStatus::Pending;
    tile
}
