//! Level-of-detail tiers and the density grid used by the lowest one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::LodConfig;
use crate::geom::Rect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LodStrategy {
    Full,
    Medium,
    Low,
    DensityMap,
}

impl LodStrategy {
    /// Higher is more detailed.
    pub fn fidelity(self) -> u8 {
        match self {
            LodStrategy::Full => 3,
            LodStrategy::Medium => 2,
            LodStrategy::Low => 1,
            LodStrategy::DensityMap => 0,
        }
    }

    /// Next less detailed tier. `DensityMap` is its own lower tier.
    pub fn lower(self) -> Self {
        match self {
            LodStrategy::Full => LodStrategy::Medium,
            LodStrategy::Medium => LodStrategy::Low,
            LodStrategy::Low | LodStrategy::DensityMap => LodStrategy::DensityMap,
        }
    }

    pub fn higher(self) -> Self {
        match self {
            LodStrategy::DensityMap => LodStrategy::Low,
            LodStrategy::Low => LodStrategy::Medium,
            LodStrategy::Medium | LodStrategy::Full => LodStrategy::Full,
        }
    }

    /// The less detailed of `self` and `limit`.
    pub fn capped_at(self, limit: LodStrategy) -> Self {
        if limit.fidelity() < self.fidelity() {
            limit
        } else {
            self
        }
    }
}

/// Picks the tier for `note_count` visible notes at `zoom`.
pub fn select_strategy(config: &LodConfig, note_count: usize, zoom: f64) -> LodStrategy {
    if note_count > config.density_note_threshold && zoom < config.density_zoom_threshold {
        LodStrategy::DensityMap
    } else if note_count > config.low_note_threshold && zoom < config.low_zoom_threshold {
        LodStrategy::Low
    } else if note_count > config.medium_note_threshold {
        LodStrategy::Medium
    } else {
        LodStrategy::Full
    }
}

/// [`select_strategy`] plus a degradation limit set by error recovery.
#[derive(Clone, Debug)]
pub struct LodSelector {
    config: LodConfig,
    floor: Option<LodStrategy>,
}

impl LodSelector {
    pub fn new(config: LodConfig) -> Self {
        Self {
            config,
            floor: None,
        }
    }

    pub fn config(&self) -> &LodConfig {
        &self.config
    }

    pub fn select(&self, note_count: usize, zoom: f64) -> LodStrategy {
        let strategy = select_strategy(&self.config, note_count, zoom);
        match self.floor {
            Some(floor) => strategy.capped_at(floor),
            None => strategy,
        }
    }

    /// Most detailed tier the selector may currently return.
    pub fn floor(&self) -> Option<LodStrategy> {
        self.floor
    }

    pub fn set_floor(&mut self, floor: Option<LodStrategy>) {
        if self.floor != floor {
            tracing::debug!(?floor, "lod floor changed");
        }
        self.floor = floor;
    }

    /// Lowers the floor one tier below `current`.
    pub fn degrade_from(&mut self, current: LodStrategy) {
        let base = self.floor.map_or(current, |floor| floor.capped_at(current));
        self.set_floor(Some(base.lower()));
    }

    /// Raises the floor one tier, removing it once it reaches `Full`.
    pub fn relax(&mut self) {
        let next = match self.floor {
            None | Some(LodStrategy::Medium) | Some(LodStrategy::Full) => None,
            Some(floor) => Some(floor.higher()),
        };
        self.set_floor(next);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityCell {
    pub rect: Rect,
    pub count: u32,
    /// `count / max_count` over the map.
    pub opacity: f32,
}

/// Occupancy grid of note rects, one entry per non-empty cell.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DensityMap {
    cell_size: f64,
    cells: Vec<DensityCell>,
    max_count: u32,
}

impl DensityMap {
    /// Buckets rects by their top-left corner into `cell_size` cells.
    pub fn build(rects: impl IntoIterator<Item = Rect>, cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            8.0
        };
        let mut counts: HashMap<(i64, i64), u32> = HashMap::new();
        for rect in rects {
            if rect.is_degenerate() {
                continue;
            }
            let col = (rect.x / cell_size).floor() as i64;
            let row = (rect.y / cell_size).floor() as i64;
            *counts.entry((row, col)).or_insert(0) += 1;
        }

        let max_count = counts.values().copied().max().unwrap_or(0);
        let mut occupied: Vec<((i64, i64), u32)> = counts.into_iter().collect();
        occupied.sort_unstable_by_key(|(cell, _)| *cell);
        let cells = occupied
            .into_iter()
            .map(|((row, col), count)| DensityCell {
                rect: Rect::new(
                    col as f64 * cell_size,
                    row as f64 * cell_size,
                    cell_size,
                    cell_size,
                ),
                count,
                opacity: count as f32 / max_count as f32,
            })
            .collect();

        Self {
            cell_size,
            cells,
            max_count,
        }
    }

    pub fn cells(&self) -> &[DensityCell] {
        &self.cells
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
