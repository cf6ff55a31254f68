//! LRU cache of rendered tile bitmaps for the presentation layer
//!
//! The tile store only tracks lifecycle state; whoever issues renders owns
//! the pixels. This cache is the usual place to keep them.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::types::{Bitmap, TileId, TileSet};

/// Default number of bitmaps kept
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Cache key for rendered tiles
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub page: usize,
    pub tile: TileId,
}

impl CacheKey {
    #[must_use]
    pub fn new(page: usize, tile: TileId) -> Self {
        Self { page, tile }
    }
}

/// LRU cache for rendered tile bitmaps
pub struct BitmapCache {
    cache: LruCache<CacheKey, Arc<Bitmap>>,
}

impl BitmapCache {
    /// Create a new cache with the given capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Get a cached bitmap, promoting it in the LRU order
    #[must_use]
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<Bitmap>> {
        self.cache.get(key).cloned()
    }

    /// Check if a key is in the cache without promoting it
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains(key)
    }

    pub fn insert(&mut self, key: CacheKey, bitmap: Arc<Bitmap>) {
        self.cache.put(key, bitmap);
    }

    /// Evict bitmaps of tiles no longer present in `tiles`
    pub fn retain_tile_set(&mut self, tiles: &TileSet) -> usize {
        self.evict_where(|key| {
            !tiles
                .get(&key.page)
                .is_some_and(|list| list.iter().any(|t| t.id == key.tile))
        })
    }

    /// Invalidate all cached tiles of a specific page
    pub fn invalidate_page(&mut self, page: usize) -> usize {
        self.evict_where(|key| key.page == page)
    }

    pub fn invalidate_all(&mut self) {
        self.cache.clear();
    }

    /// Total pixel bytes held
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.cache.iter().map(|(_, b)| b.byte_len()).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    fn evict_where(&mut self, pred: impl Fn(&CacheKey) -> bool) -> usize {
        let keys_to_remove: Vec<_> = self
            .cache
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys_to_remove {
            self.cache.pop(key);
        }
        keys_to_remove.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::types::{Epoch, PixelRect, Rect, Rotation, ScaleBucket, Tile, TileStatus};

    fn id(page: usize, column: u32) -> TileId {
        let epoch = Epoch {
            scale: ScaleBucket::from_scale(1.0),
            rotation: Rotation::Deg0,
        };
        TileId::new(page, column, 0, epoch, None)
    }

    fn bitmap() -> Arc<Bitmap> {
        Arc::new(Bitmap::filled(2, 2, [1, 2, 3, 4]))
    }

    #[test]
    fn cache_insert_and_get() {
        let mut cache = BitmapCache::new(10);
        let key = CacheKey::new(0, id(0, 0));
        cache.insert(key.clone(), bitmap());

        assert!(cache.contains(&key));
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.byte_size(), 16);
    }

    #[test]
    fn cache_lru_eviction() {
        let mut cache = BitmapCache::new(2);
        for column in 0..3 {
            cache.insert(CacheKey::new(0, id(0, column)), bitmap());
        }

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&CacheKey::new(0, id(0, 0))));
        assert!(cache.contains(&CacheKey::new(0, id(0, 2))));
    }

    #[test]
    fn zero_capacity_keeps_one() {
        assert_eq!(BitmapCache::new(0).capacity(), 1);
    }

    #[test]
    fn cache_invalidate_page() {
        let mut cache = BitmapCache::new(10);
        cache.insert(CacheKey::new(0, id(0, 0)), bitmap());
        cache.insert(CacheKey::new(0, id(0, 1)), bitmap());
        cache.insert(CacheKey::new(1, id(1, 0)), bitmap());

        assert_eq!(cache.invalidate_page(0), 2);
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn retain_tile_set_drops_retired_tiles() {
        let mut cache = BitmapCache::new(10);
        let kept = id(0, 0);
        cache.insert(CacheKey::new(0, kept.clone()), bitmap());
        cache.insert(CacheKey::new(0, id(0, 1)), bitmap());
        cache.insert(CacheKey::new(3, id(3, 0)), bitmap());

        let mut tiles = TileSet::new();
        tiles.insert(
            0,
            vec![Tile {
                id: kept.clone(),
                page_index: 0,
                column: 0,
                row: 0,
                page_rect: Rect::new(0.0, 0.0, 1.0, 1.0),
                pixel_rect: PixelRect::new(0, 0, 1, 1),
                src_scale: 1.0,
                rotation: Rotation::Deg0,
                is_fallback: true,
                status: TileStatus::Ready,
            }],
        );

        assert_eq!(cache.retain_tile_set(&tiles), 2);
        assert!(cache.contains(&CacheKey::new(0, kept)));
    }
}
