//! Uniform bucket grid used to answer "what intersects this rect" queries.
//!
//! Every item is stored in each bucket its rect overlaps, plus a reverse map
//! from item to rect so removal only touches the buckets it occupies.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use smallvec::SmallVec;

use crate::config::SpatialConfig;
use crate::geom::Rect;

type Bucket<T> = SmallVec<[(T, Rect); 4]>;

/// Packs two grid coordinates into a single bucket key.
#[inline]
pub fn bucket_id(x: i32, y: i32) -> u64 {
    (u64::from(x as u32) << 32) | u64::from(y as u32)
}

#[inline]
fn cell_coord(value: f64, bucket_size: f64) -> i32 {
    (value / bucket_size)
        .floor()
        .clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CellRange {
    min_x: i32,
    max_x: i32,
    min_y: i32,
    max_y: i32,
}

impl CellRange {
    fn of(rect: &Rect, bucket_size: f64) -> Self {
        Self {
            min_x: cell_coord(rect.left(), bucket_size),
            max_x: cell_coord(rect.right(), bucket_size),
            min_y: cell_coord(rect.top(), bucket_size),
            max_y: cell_coord(rect.bottom(), bucket_size),
        }
    }

    fn ids(self) -> impl Iterator<Item = (i32, i32)> {
        (self.min_x..=self.max_x).flat_map(move |x| (self.min_y..=self.max_y).map(move |y| (x, y)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketLimits {
    pub min: f64,
    pub max: f64,
    pub rebuild_threshold: f64,
}

impl Default for BucketLimits {
    fn default() -> Self {
        Self::from(&SpatialConfig::default())
    }
}

impl From<&SpatialConfig> for BucketLimits {
    fn from(config: &SpatialConfig) -> Self {
        Self {
            min: config.min_bucket_size,
            max: config.max_bucket_size,
            rebuild_threshold: config.rebuild_threshold,
        }
    }
}

impl BucketLimits {
    fn clamp(&self, size: f64) -> f64 {
        size.clamp(self.min, self.max)
    }
}

#[derive(Clone, Debug)]
pub struct SpatialIndex<T> {
    bucket_size: f64,
    limits: BucketLimits,
    buckets: HashMap<u64, Bucket<T>>,
    items: HashMap<T, Rect>,
    bounds: Option<Rect>,
}

impl<T> Default for SpatialIndex<T>
where
    T: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::with_config(&SpatialConfig::default())
    }
}

impl<T> SpatialIndex<T>
where
    T: Copy + Eq + Hash,
{
    pub fn new(bucket_size: f64, limits: BucketLimits) -> Self {
        Self {
            bucket_size: limits.clamp(bucket_size),
            limits,
            buckets: HashMap::new(),
            items: HashMap::new(),
            bounds: None,
        }
    }

    pub fn with_config(config: &SpatialConfig) -> Self {
        Self::new(config.bucket_size, BucketLimits::from(config))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn bucket_size(&self) -> f64 {
        self.bucket_size
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Union of every rect inserted since the last rebuild.
    pub fn bounds(&self) -> Option<Rect> {
        self.bounds
    }

    pub fn rect_of(&self, item: &T) -> Option<Rect> {
        self.items.get(item).copied()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains_key(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = (T, Rect)> + '_ {
        self.items.iter().map(|(item, rect)| (*item, *rect))
    }

    /// Adds `item`, replacing any previous entry. Degenerate rects are ignored.
    pub fn insert(&mut self, item: T, rect: Rect) {
        if rect.is_degenerate() {
            return;
        }
        self.remove(&item);
        for (x, y) in CellRange::of(&rect, self.bucket_size).ids() {
            self.buckets
                .entry(bucket_id(x, y))
                .or_default()
                .push((item, rect));
        }
        self.items.insert(item, rect);
        self.bounds = Some(match self.bounds {
            Some(bounds) => bounds.union(&rect),
            None => rect,
        });
    }

    pub fn remove(&mut self, item: &T) -> bool {
        let Some(rect) = self.items.remove(item) else {
            return false;
        };
        for (x, y) in CellRange::of(&rect, self.bucket_size).ids() {
            let id = bucket_id(x, y);
            if let Some(bucket) = self.buckets.get_mut(&id) {
                bucket.retain(|(entry, _)| entry != item);
                if bucket.is_empty() {
                    self.buckets.remove(&id);
                }
            }
        }
        true
    }

    /// Moves `item` to `rect`. A degenerate `rect` leaves the item removed.
    pub fn update(&mut self, item: T, rect: Rect) {
        self.remove(&item);
        self.insert(item, rect);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.items.clear();
        self.bounds = None;
    }

    pub fn query(&self, rect: &Rect) -> HashSet<T> {
        let mut out = Vec::new();
        self.query_into(rect, &mut out);
        out.into_iter().collect()
    }

    /// Writes every item whose rect intersects `rect` into `out`, each exactly once.
    ///
    /// Output order follows bucket order (column-major), so it is stable for a
    /// given index state.
    pub fn query_into(&self, rect: &Rect, out: &mut Vec<T>) {
        out.clear();
        if rect.is_degenerate() || self.items.is_empty() {
            return;
        }
        let Some(clipped) = self.bounds.and_then(|bounds| bounds.intersection(rect)) else {
            return;
        };
        let range = CellRange::of(&clipped, self.bucket_size);
        for (x, y) in range.ids() {
            let Some(bucket) = self.buckets.get(&bucket_id(x, y)) else {
                continue;
            };
            for (item, item_rect) in bucket {
                if !item_rect.intersects(rect) {
                    continue;
                }
                // Report only from the first shared bucket of the item and the query.
                let own = CellRange::of(item_rect, self.bucket_size);
                if x == own.min_x.max(range.min_x) && y == own.min_y.max(range.min_y) {
                    out.push(*item);
                }
            }
        }
    }

    /// Re-tunes the bucket size toward a few items per bucket.
    ///
    /// Returns `true` when the grid was rebuilt.
    pub fn optimize(&mut self) -> bool {
        let Some(bounds) = self.tight_bounds() else {
            return false;
        };
        self.bounds = Some(bounds);
        let ideal = (bounds.area() / self.items.len() as f64).sqrt() * 2.0;
        if !ideal.is_finite() {
            return false;
        }
        let ideal = self.limits.clamp(ideal);
        if (ideal - self.bucket_size).abs() <= self.limits.rebuild_threshold {
            return false;
        }
        tracing::debug!(
            from = self.bucket_size,
            to = ideal,
            items = self.items.len(),
            "rebuilding spatial index"
        );
        self.rebuild_with(ideal);
        true
    }

    /// Rebuilds the grid with a new bucket size, keeping every item.
    pub fn set_bucket_size(&mut self, bucket_size: f64) {
        let size = self.limits.clamp(bucket_size);
        if size != self.bucket_size {
            self.rebuild_with(size);
        }
    }

    fn tight_bounds(&self) -> Option<Rect> {
        self.items
            .values()
            .copied()
            .reduce(|acc, rect| acc.union(&rect))
    }

    fn rebuild_with(&mut self, bucket_size: f64) {
        let items: Vec<(T, Rect)> = self.items.drain().collect();
        self.buckets.clear();
        self.bounds = None;
        self.bucket_size = bucket_size;
        for (item, rect) in items {
            self.insert(item, rect);
        }
    }

    #[cfg(test)]
    fn occurrences(&self, item: &T) -> usize {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter())
            .filter(|(entry, _)| entry == item)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> SpatialIndex<u64> {
        SpatialIndex::new(100.0, BucketLimits::default())
    }

    #[test]
    fn bucket_id_packs_signed_coordinates() {
        assert_eq!(bucket_id(1, 2), (1u64 << 32) | 2);
        assert_ne!(bucket_id(-1, 0), bucket_id(0, -1));
        assert_eq!(bucket_id(-1, -1), u64::MAX);
    }

    #[test]
    fn spanning_item_is_stored_in_each_bucket_once() {
        let mut index = index();
        let rect = Rect::new(50.0, 50.0, 160.0, 20.0);
        index.insert(1, rect);
        assert_eq!(index.occurrences(&1), 3);
        index.insert(1, rect);
        assert_eq!(index.occurrences(&1), 3);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn query_deduplicates_and_filters_exactly() {
        let mut index = index();
        index.insert(1, Rect::new(50.0, 50.0, 160.0, 20.0));
        index.insert(2, Rect::new(120.0, 80.0, 10.0, 10.0));
        let mut out = Vec::new();
        index.query_into(&Rect::new(0.0, 0.0, 300.0, 300.0), &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![1, 2]);

        // Same buckets as item 2 but no overlap with its rect.
        index.query_into(&Rect::new(100.0, 60.0, 5.0, 5.0), &mut out);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn degenerate_input_is_ignored() {
        let mut index = index();
        index.insert(1, Rect::new(0.0, 0.0, 0.0, 10.0));
        index.insert(2, Rect::new(0.0, 0.0, f64::NAN, 10.0));
        assert!(index.is_empty());
        index.insert(3, Rect::new(0.0, 0.0, 10.0, 10.0));
        assert!(index.query(&Rect::new(0.0, 0.0, -5.0, 5.0)).is_empty());
        assert!(!index.remove(&42));
    }

    #[test]
    fn remove_clears_every_bucket() {
        let mut index = index();
        index.insert(7, Rect::new(-150.0, -150.0, 400.0, 400.0));
        assert!(index.bucket_count() > 1);
        assert!(index.remove(&7));
        assert_eq!(index.occurrences(&7), 0);
        assert_eq!(index.bucket_count(), 0);
    }

    #[test]
    fn optimize_converges() {
        let mut index = index();
        for i in 0..400u64 {
            let x = (i % 20) as f64 * 30.0;
            let y = (i / 20) as f64 * 30.0;
            index.insert(i, Rect::new(x, y, 20.0, 10.0));
        }
        let rebuilt = index.optimize();
        assert!(rebuilt);
        assert!(!index.optimize());
        assert_eq!(index.len(), 400);
        assert_eq!(index.query(&Rect::new(0.0, 0.0, 1000.0, 1000.0)).len(), 400);
    }

    #[test]
    fn optimize_on_empty_index_is_noop() {
        let mut index = index();
        assert!(!index.optimize());
    }
}
