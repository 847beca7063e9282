//! Velocity lane bars drawn underneath the piano roll.

use std::sync::Arc;

use crate::batch::{BatchGrouper, BatchItem, RenderBatch};
use crate::geom::Rect;
use crate::geometry::GeometryCache;
use crate::material::{Material, NoteTheme};
use crate::note::{NoteDrawRecord, NoteId, SelectionState};

const BAR_MARGIN: f64 = 1.0;
const MIN_BAR_WIDTH: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VelocityBar {
    pub note: NoteId,
    /// Lane-local rect, bottom aligned.
    pub rect: Rect,
    pub opacity: f32,
    pub selected: bool,
}

/// One bar per note. `note_rect` is the note's screen rect; only its x-extent is used.
pub fn velocity_bars<'a>(
    notes: impl IntoIterator<Item = (&'a NoteDrawRecord, Rect)>,
    lane_height: f64,
    selection: &SelectionState,
    theme: &NoteTheme,
) -> Vec<VelocityBar> {
    if lane_height <= 0.0 {
        return Vec::new();
    }
    notes
        .into_iter()
        .filter(|(note, _)| note.velocity > 0)
        .map(|(note, note_rect)| {
            let level = f64::from(note.velocity) / 127.0;
            let height = level * lane_height;
            let width = (note_rect.width - 2.0 * BAR_MARGIN).max(MIN_BAR_WIDTH);
            VelocityBar {
                note: note.id,
                rect: Rect::new(note_rect.x + BAR_MARGIN, lane_height - height, width, height),
                opacity: (level as f32).max(theme.min_velocity_bar_opacity),
                selected: selection.is_selected(note.id),
            }
        })
        .collect()
}

/// Two flat materials, selected and unselected; opacity is per instance.
pub fn velocity_batches(
    bars: &[VelocityBar],
    theme: &NoteTheme,
    geometry: &mut GeometryCache,
    max_items_per_batch: usize,
) -> Vec<RenderBatch> {
    let mut grouper = BatchGrouper::new(max_items_per_batch);
    for bar in bars {
        if bar.rect.is_degenerate() {
            continue;
        }
        let color = if bar.selected {
            theme.velocity_bar_selected
        } else {
            theme.velocity_bar
        };
        let mesh = geometry.get_or_create(bar.rect.width, bar.rect.height, 0.0);
        grouper.push(
            Material::fill(color, 1.0),
            BatchItem {
                note: Some(bar.note),
                rect: bar.rect,
                geometry: Arc::clone(&mesh),
                alpha: bar.opacity,
            },
        );
    }
    grouper.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_height_tracks_velocity() {
        let theme = NoteTheme::standard();
        let loud = NoteDrawRecord::new(1, 0.0, 1.0, 60, 127);
        let quiet = NoteDrawRecord::new(2, 1.0, 1.0, 60, 10);
        let bars = velocity_bars(
            [
                (&loud, Rect::new(10.0, 50.0, 100.0, 12.0)),
                (&quiet, Rect::new(110.0, 50.0, 3.0, 12.0)),
            ],
            80.0,
            &SelectionState::default(),
            &theme,
        );
        assert_eq!(bars[0].rect, Rect::new(11.0, 0.0, 98.0, 80.0));
        assert_eq!(bars[0].opacity, 1.0);
        assert_eq!(bars[1].rect.width, MIN_BAR_WIDTH);
        assert_eq!(bars[1].opacity, theme.min_velocity_bar_opacity);
        assert_eq!(bars[1].rect.bottom(), 80.0);
    }

    #[test]
    fn selected_bars_use_their_own_material() {
        let theme = NoteTheme::standard();
        let notes: Vec<NoteDrawRecord> = (0..4)
            .map(|id| NoteDrawRecord::new(id, id as f64, 1.0, 60, 100))
            .collect();
        let mut selection = SelectionState::default();
        selection.selected.insert(1);
        let bars = velocity_bars(
            notes.iter().map(|n| (n, Rect::new(n.time * 20.0, 0.0, 20.0, 10.0))),
            40.0,
            &selection,
            &theme,
        );
        let mut cache = GeometryCache::new(4);
        let batches = velocity_batches(&bars, &theme, &mut cache, 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].material().fill_color, theme.velocity_bar_selected);
        assert_eq!(cache.len(), 1);
    }
}
