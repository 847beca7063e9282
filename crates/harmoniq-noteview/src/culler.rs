//! Viewport culling on top of the world-space [`SpatialIndex`].

use crate::config::{CullingConfig, SpatialConfig};
use crate::geom::Rect;
use crate::note::{NoteChange, NoteDrawRecord, NoteId, NoteSource, Projection, ViewportState};
use crate::spatial::SpatialIndex;

/// A note that survived culling, with its rect in screen space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisibleNote {
    pub id: NoteId,
    pub rect: Rect,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CullStats {
    pub total: usize,
    pub visible: usize,
    pub culled: usize,
    /// Fraction of indexed notes that were culled, `0.0..=1.0`.
    pub efficiency: f64,
    /// Whether the last cull reused the previous index query.
    pub reused_query: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct QueryKey {
    generation: u64,
    viewport: ViewportState,
    query_rect: Rect,
}

#[derive(Clone, Debug)]
pub struct ViewportCuller {
    index: SpatialIndex<NoteId>,
    spatial: SpatialConfig,
    culling: CullingConfig,
    projection: Option<Projection>,
    generation: u64,
    last_query: Option<QueryKey>,
    candidates: Vec<NoteId>,
    visible: Vec<VisibleNote>,
    stats: CullStats,
}

impl ViewportCuller {
    pub fn new(spatial: &SpatialConfig, culling: &CullingConfig) -> Self {
        Self {
            index: SpatialIndex::with_config(spatial),
            spatial: spatial.clone(),
            culling: culling.clone(),
            projection: None,
            generation: 0,
            last_query: None,
            candidates: Vec::new(),
            visible: Vec::new(),
            stats: CullStats::default(),
        }
    }

    /// Builds a fully indexed culler, typically on a worker thread, to be
    /// swapped in by the render thread.
    pub fn rebuilt<'a>(
        spatial: &SpatialConfig,
        culling: &CullingConfig,
        notes: impl IntoIterator<Item = &'a NoteDrawRecord>,
        projection: Projection,
        generation: u64,
    ) -> Self {
        let mut culler = Self::new(spatial, culling);
        culler.rebuild(notes, projection, generation);
        culler
    }

    pub fn index(&self) -> &SpatialIndex<NoteId> {
        &self.index
    }

    pub fn projection(&self) -> Option<Projection> {
        self.projection
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> CullStats {
        self.stats
    }

    pub fn world_rect_of(&self, id: NoteId) -> Option<Rect> {
        self.index.rect_of(&id)
    }

    /// Discards the cached query so the next cull hits the index.
    pub fn invalidate(&mut self) {
        self.last_query = None;
    }

    /// Re-indexes every note for `projection`.
    pub fn rebuild<'a>(
        &mut self,
        notes: impl IntoIterator<Item = &'a NoteDrawRecord>,
        projection: Projection,
        generation: u64,
    ) {
        self.index = SpatialIndex::with_config(&self.spatial);
        for note in notes {
            self.index.insert(note.id, projection.world_rect(note));
        }
        if self.spatial.auto_optimize {
            self.index.optimize();
        }
        self.projection = Some(projection);
        self.generation = generation;
        self.invalidate();
        tracing::debug!(
            notes = self.index.len(),
            bucket_size = self.index.bucket_size(),
            "viewport culler rebuilt"
        );
    }

    /// Rebuilds only when the scale differs from the indexed one.
    ///
    /// Returns `true` when a rebuild happened.
    pub fn set_projection<S>(&mut self, projection: Projection, source: &S) -> bool
    where
        S: NoteSource + ?Sized,
    {
        if self.projection == Some(projection) {
            return false;
        }
        self.rebuild(source.notes(), projection, source.generation());
        true
    }

    /// Patches the index for one change notification.
    pub fn apply_change<S>(&mut self, change: &NoteChange, source: &S)
    where
        S: NoteSource + ?Sized,
    {
        let Some(projection) = self.projection else {
            return;
        };
        match change {
            NoteChange::Added(ids) | NoteChange::Updated(ids) => {
                for id in ids {
                    match source.get(*id) {
                        Some(note) => self.index.update(*id, projection.world_rect(note)),
                        None => {
                            self.index.remove(id);
                        }
                    }
                }
            }
            NoteChange::Removed(ids) => {
                for id in ids {
                    self.index.remove(id);
                }
            }
            NoteChange::Reset => {
                self.rebuild(source.notes(), projection, source.generation());
                return;
            }
        }
        self.generation = source.generation();
        self.invalidate();
    }

    /// Notes whose screen rect intersects the viewport, in index order.
    pub fn cull(&mut self, viewport: &ViewportState) -> &[VisibleNote] {
        let world = viewport.world_rect();
        let reuse = self.last_query.as_ref().is_some_and(|last| {
            last.generation == self.generation
                && last.viewport.same_extent(viewport)
                && last.viewport.scroll_distance(viewport) <= self.culling.viewport_change_threshold
                && last.query_rect.contains_rect(&world)
        });

        if !reuse {
            let query_rect = world.inflate(self.culling.overscan);
            self.index.query_into(&query_rect, &mut self.candidates);
            self.last_query = Some(QueryKey {
                generation: self.generation,
                viewport: *viewport,
                query_rect,
            });
        }

        self.visible.clear();
        let screen = viewport.screen_rect();
        for id in &self.candidates {
            let Some(world_rect) = self.index.rect_of(id) else {
                continue;
            };
            let rect = world_rect.translate(-viewport.scroll_x, -viewport.scroll_y);
            if rect.intersects(&screen) {
                self.visible.push(VisibleNote { id: *id, rect });
            }
        }

        let total = self.index.len();
        let visible = self.visible.len();
        self.stats = CullStats {
            total,
            visible,
            culled: total - visible,
            efficiency: if total == 0 {
                0.0
            } else {
                (total - visible) as f64 / total as f64
            },
            reused_query: reuse,
        };
        &self.visible
    }

    /// Takes a visible set culled elsewhere against `prepared_for` and
    /// re-filters it for `viewport`. Notes the index no longer holds are dropped.
    pub fn adopt_visible(
        &mut self,
        prepared_for: &ViewportState,
        notes: &[VisibleNote],
        viewport: &ViewportState,
    ) -> &[VisibleNote] {
        let dx = prepared_for.scroll_x - viewport.scroll_x;
        let dy = prepared_for.scroll_y - viewport.scroll_y;
        let screen = viewport.screen_rect();
        self.visible.clear();
        for note in notes {
            if self.index.rect_of(&note.id).is_none() {
                continue;
            }
            let rect = note.rect.translate(dx, dy);
            if rect.intersects(&screen) {
                self.visible.push(VisibleNote { id: note.id, rect });
            }
        }

        let total = self.index.len();
        let visible = self.visible.len();
        self.stats = CullStats {
            total,
            visible,
            culled: total.saturating_sub(visible),
            efficiency: if total == 0 {
                0.0
            } else {
                total.saturating_sub(visible) as f64 / total as f64
            },
            reused_query: false,
        };
        &self.visible
    }

    /// Last result of [`ViewportCuller::cull`] or [`ViewportCuller::adopt_visible`].
    pub fn visible(&self) -> &[VisibleNote] {
        &self.visible
    }

    /// Ids of every note intersecting a world-space rect.
    pub fn query_world(&self, rect: &Rect, out: &mut Vec<NoteId>) {
        self.index.query_into(rect, out);
    }

    pub fn optimize(&mut self) -> bool {
        let rebuilt = self.index.optimize();
        if rebuilt {
            self.invalidate();
        }
        rebuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayoutConfig, RenderConfig};
    use crate::note::VecNoteSource;

    fn setup(notes: Vec<NoteDrawRecord>) -> (ViewportCuller, VecNoteSource, Projection) {
        let config = RenderConfig::default();
        let source = VecNoteSource::from_notes(notes);
        let projection = Projection::new(&LayoutConfig::default(), &ViewportState::default());
        let culler = ViewportCuller::rebuilt(
            &config.spatial,
            &config.culling,
            source.notes(),
            projection,
            source.generation(),
        );
        (culler, source, projection)
    }

    #[test]
    fn culls_notes_outside_viewport() {
        let notes = vec![
            NoteDrawRecord::new(1, 0.0, 1.0, 127, 100),
            NoteDrawRecord::new(2, 100.0, 1.0, 127, 100),
        ];
        let (mut culler, _, _) = setup(notes);
        let viewport = ViewportState::new(800.0, 600.0);
        let visible = culler.cull(&viewport);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, 1);
        let stats = culler.stats();
        assert_eq!((stats.total, stats.visible, stats.culled), (2, 1, 1));
        assert!((stats.efficiency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn small_scroll_reuses_query_and_translates() {
        let (mut culler, _, _) = setup(vec![NoteDrawRecord::new(1, 1.0, 1.0, 127, 100)]);
        let viewport = ViewportState::new(800.0, 600.0);
        culler.cull(&viewport);
        let moved = viewport.with_scroll(3.0, 0.0);
        let visible = culler.cull(&moved).to_vec();
        assert!(culler.stats().reused_query);
        assert_eq!(visible[0].rect.x, 100.0 - 3.0);

        culler.cull(&viewport.with_scroll(400.0, 0.0));
        assert!(!culler.stats().reused_query);
    }

    #[test]
    fn changes_patch_the_index() {
        let (mut culler, mut source, _) = setup(vec![NoteDrawRecord::new(1, 0.0, 1.0, 127, 100)]);
        source.insert(NoteDrawRecord::new(2, 2.0, 1.0, 127, 100));
        source.remove(1);
        for change in source.drain_changes() {
            culler.apply_change(&change, &source);
        }
        let ids: Vec<NoteId> = culler
            .cull(&ViewportState::new(800.0, 600.0))
            .iter()
            .map(|note| note.id)
            .collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(culler.generation(), source.generation());
    }

    #[test]
    fn same_projection_does_not_rebuild() {
        let (mut culler, source, projection) =
            setup(vec![NoteDrawRecord::new(1, 0.0, 1.0, 60, 100)]);
        assert!(!culler.set_projection(projection, &source));
        let zoomed = Projection::new(
            &LayoutConfig::default(),
            &ViewportState::default().with_zoom(2.0, 1.0),
        );
        assert!(culler.set_projection(zoomed, &source));
        assert_eq!(culler.world_rect_of(1).map(|rect| rect.width), Some(200.0));
    }

    #[test]
    fn adopted_notes_follow_the_new_scroll() {
        let (mut culler, source, projection) = setup(vec![
            NoteDrawRecord::new(1, 0.0, 1.0, 127, 100),
            NoteDrawRecord::new(2, 7.0, 1.0, 127, 100),
        ]);
        let prepared_for = ViewportState::new(800.0, 600.0);
        let mut prepared: Vec<VisibleNote> = source
            .notes()
            .iter()
            .map(|note| VisibleNote {
                id: note.id,
                rect: projection.screen_rect(note, &prepared_for),
            })
            .collect();
        prepared.push(VisibleNote {
            id: 99,
            rect: Rect::new(0.0, 0.0, 10.0, 10.0),
        });

        let ids: Vec<NoteId> = culler
            .adopt_visible(&prepared_for, &prepared, &prepared_for)
            .iter()
            .map(|note| note.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let scrolled = prepared_for.with_scroll(projection.time_to_x(6.0), 0.0);
        let adopted = culler.adopt_visible(&prepared_for, &prepared, &scrolled);
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].id, 2);
        assert_eq!(adopted[0].rect, projection.screen_rect(&source.notes()[1], &scrolled));
        assert!(!culler.stats().reused_query);
    }
}
