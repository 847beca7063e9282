//! Groups visible notes into material-homogeneous, size-capped batches.

use std::collections::HashMap;
use std::sync::Arc;

use crate::geom::Rect;
use crate::geometry::{Geometry, GeometryCache};
use crate::lod::{DensityMap, LodStrategy};
use crate::material::{Material, MaterialKey, NoteTheme, Stroke};
use crate::note::{NoteDrawRecord, NoteId, SelectionState};

/// One instance inside a batch. `rect` is in screen space.
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub note: Option<NoteId>,
    pub rect: Rect,
    pub geometry: Arc<Geometry>,
    /// Per-instance opacity multiplier on top of the material opacity.
    pub alpha: f32,
}

#[derive(Clone, Debug)]
pub struct RenderBatch {
    material: Material,
    items: Vec<BatchItem>,
}

impl RenderBatch {
    pub fn new(material: Material) -> Self {
        Self {
            material,
            items: Vec::new(),
        }
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Accumulates items per material in first-seen order.
pub(crate) struct BatchGrouper {
    max_items: usize,
    lookup: HashMap<MaterialKey, usize>,
    groups: Vec<Vec<RenderBatch>>,
}

impl BatchGrouper {
    pub(crate) fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            lookup: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, material: Material, item: BatchItem) {
        let slot = *self.lookup.entry(material.key()).or_insert_with(|| {
            self.groups.push(Vec::new());
            self.groups.len() - 1
        });
        let batches = &mut self.groups[slot];
        let full = batches
            .last()
            .map_or(true, |batch| batch.items.len() >= self.max_items);
        if full {
            batches.push(RenderBatch::new(material));
        }
        if let Some(batch) = batches.last_mut() {
            batch.items.push(item);
        }
    }

    pub(crate) fn finish(self) -> Vec<RenderBatch> {
        self.groups.into_iter().flatten().collect()
    }
}

#[derive(Clone, Debug)]
pub struct BatchBuilder {
    theme: NoteTheme,
    max_items_per_batch: usize,
}

impl BatchBuilder {
    pub fn new(theme: NoteTheme, max_items_per_batch: usize) -> Self {
        Self {
            theme,
            max_items_per_batch: max_items_per_batch.max(1),
        }
    }

    pub fn theme(&self) -> &NoteTheme {
        &self.theme
    }

    pub fn max_items_per_batch(&self) -> usize {
        self.max_items_per_batch
    }

    fn velocity_opacity(&self, note: &NoteDrawRecord, manipulated: bool) -> f32 {
        let opacity = (f32::from(note.velocity) / 127.0).max(self.theme.min_velocity_opacity);
        if manipulated {
            (opacity * self.theme.manipulated_boost).min(1.0)
        } else {
            opacity.min(1.0)
        }
    }

    /// Material of one note for the given tier.
    pub fn classify(
        &self,
        note: &NoteDrawRecord,
        selection: &SelectionState,
        strategy: LodStrategy,
    ) -> Material {
        let theme = &self.theme;
        let manipulated = selection.is_manipulated(note.id);
        let selected = manipulated || selection.is_selected(note.id);
        match strategy {
            LodStrategy::Full => {
                let opacity = self.velocity_opacity(note, manipulated);
                if selected {
                    Material::bordered(
                        theme.note_selected_fill,
                        opacity,
                        theme.note_selected_border,
                    )
                } else {
                    Material::bordered(theme.fill_for_pitch(note.pitch), opacity, theme.note_border)
                }
            }
            LodStrategy::Medium => {
                if selected {
                    Material::bordered(
                        theme.note_selected_fill,
                        theme.medium_opacity,
                        Stroke::new(theme.medium_border.width, theme.note_selected_border.color),
                    )
                } else {
                    Material::fill(theme.fill_for_pitch(note.pitch), theme.medium_opacity)
                }
            }
            LodStrategy::Low | LodStrategy::DensityMap => {
                Material::fill(theme.low_fill, theme.low_opacity)
            }
        }
    }

    /// Full-detail batches.
    pub fn build_batches<'a>(
        &self,
        candidates: impl IntoIterator<Item = (&'a NoteDrawRecord, Rect)>,
        selection: &SelectionState,
        geometry: &mut GeometryCache,
    ) -> Vec<RenderBatch> {
        self.build_for_strategy(candidates, selection, geometry, LodStrategy::Full)
    }

    /// Batches for a note tier. Degenerate rects are skipped.
    pub fn build_for_strategy<'a>(
        &self,
        candidates: impl IntoIterator<Item = (&'a NoteDrawRecord, Rect)>,
        selection: &SelectionState,
        geometry: &mut GeometryCache,
        strategy: LodStrategy,
    ) -> Vec<RenderBatch> {
        let mut grouper = BatchGrouper::new(self.max_items_per_batch);
        let rounded = matches!(strategy, LodStrategy::Full | LodStrategy::Medium);
        for (note, rect) in candidates {
            if rect.is_degenerate() {
                continue;
            }
            let material = self.classify(note, selection, strategy);
            let radius = if rounded {
                f64::from(note.corner_radius)
            } else {
                0.0
            };
            let mesh = geometry.get_or_create(rect.width, rect.height, radius);
            grouper.push(
                material,
                BatchItem {
                    note: Some(note.id),
                    rect,
                    geometry: mesh,
                    alpha: 1.0,
                },
            );
        }
        grouper.finish()
    }

    /// One square per occupied density cell, opacity carried per instance.
    pub fn build_density_batches(
        &self,
        map: &DensityMap,
        geometry: &mut GeometryCache,
    ) -> Vec<RenderBatch> {
        let mut grouper = BatchGrouper::new(self.max_items_per_batch);
        if map.is_empty() {
            return Vec::new();
        }
        let mesh = geometry.get_or_create(map.cell_size(), map.cell_size(), 0.0);
        let material = Material::fill(self.theme.density_fill, 1.0);
        for cell in map.cells() {
            grouper.push(
                material,
                BatchItem {
                    note: None,
                    rect: cell.rect,
                    geometry: Arc::clone(&mesh),
                    alpha: cell.opacity,
                },
            );
        }
        grouper.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: NoteId, velocity: u8) -> NoteDrawRecord {
        NoteDrawRecord::new(id, id as f64, 1.0, 60, velocity)
    }

    fn rect() -> Rect {
        Rect::new(0.0, 0.0, 20.0, 10.0)
    }

    #[test]
    fn opacity_follows_velocity_with_floor() {
        let builder = BatchBuilder::new(NoteTheme::standard(), 100);
        let selection = SelectionState::default();
        let quiet = builder.classify(&note(1, 10), &selection, LodStrategy::Full);
        let loud = builder.classify(&note(2, 127), &selection, LodStrategy::Full);
        assert_eq!(quiet.opacity, 0.7);
        assert_eq!(loud.opacity, 1.0);
    }

    #[test]
    fn dragged_notes_are_boosted_and_selected() {
        let builder = BatchBuilder::new(NoteTheme::standard(), 100);
        let mut selection = SelectionState::default();
        selection.dragging.insert(1);
        let material = builder.classify(&note(1, 100), &selection, LodStrategy::Full);
        assert_eq!(material.fill_color, NoteTheme::standard().note_selected_fill);
        let expected = (100.0f32 / 127.0 * 1.1).min(1.0);
        assert!((material.opacity - expected).abs() < 1e-6);
    }

    #[test]
    fn groups_in_first_seen_order_and_caps() {
        let builder = BatchBuilder::new(NoteTheme::standard(), 2);
        let mut selection = SelectionState::default();
        selection.selected.insert(1);
        let notes: Vec<NoteDrawRecord> = (0..6).map(|id| note(id, 127)).collect();
        let mut cache = GeometryCache::new(8);
        let batches = builder.build_batches(
            notes.iter().map(|note| (note, rect())),
            &selection,
            &mut cache,
        );
        // Normal group: 0,2,3,4,5 -> 2+2+1; selected group: 1.
        let sizes: Vec<usize> = batches.iter().map(RenderBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1, 1]);
        assert_eq!(batches[3].items()[0].note, Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn low_tier_shares_one_material() {
        let builder = BatchBuilder::new(NoteTheme::standard(), 100);
        let mut selection = SelectionState::default();
        selection.selected.insert(0);
        let notes: Vec<NoteDrawRecord> = (0..4).map(|id| note(id, id as u8 * 30)).collect();
        let mut cache = GeometryCache::new(8);
        let batches = builder.build_for_strategy(
            notes.iter().map(|note| (note, rect())),
            &selection,
            &mut cache,
            LodStrategy::Low,
        );
        assert_eq!(batches.len(), 1);
        assert!(!batches[0].material().has_border);
    }

    #[test]
    fn degenerate_and_empty_inputs() {
        let builder = BatchBuilder::new(NoteTheme::standard(), 100);
        let mut cache = GeometryCache::new(8);
        let selection = SelectionState::default();
        assert!(builder
            .build_batches(std::iter::empty(), &selection, &mut cache)
            .is_empty());
        let n = note(1, 100);
        let batches = builder.build_batches(
            [(&n, Rect::new(0.0, 0.0, 0.0, 10.0))],
            &selection,
            &mut cache,
        );
        assert!(batches.is_empty());
        assert!(cache.is_empty());
    }
}
