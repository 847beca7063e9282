//! Per-frame orchestration of the note render pipeline.

use crate::backend::{BeatDraw, RenderBackend};
use crate::batch::{BatchBuilder, RenderBatch};
use crate::beat::BeatTextureCache;
use crate::config::RenderConfig;
use crate::culler::ViewportCuller;
use crate::error::{BackendError, ConfigError};
use crate::geom::Rect;
use crate::geometry::GeometryCache;
use crate::lod::{DensityMap, LodSelector, LodStrategy};
use crate::material::NoteTheme;
use crate::monitor::{
    optimization_suggestions, stage, OptimizationSuggestion, PerformanceMonitor, PerformanceReport,
};
use crate::note::{NoteChange, NoteId, NoteSource, Projection, SelectionState, ViewportState};
use crate::prepare::{PrepareEvent, VisibleSnapshot};
use crate::profiling::StageTimer;
use crate::submit::{BatchSubmitter, SubmitStats};
use crate::tasks::Versioned;
use crate::velocity::{velocity_batches, velocity_bars};

/// What a caller changed outside the render core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidateReason {
    /// Notes changed without going through [`NoteSource::drain_changes`].
    Notes,
    /// Zoom, key height or pixels-per-beat changed.
    Scale,
    Theme,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSummary {
    pub strategy: LodStrategy,
    pub visible_notes: usize,
    pub beat_textures: usize,
    /// The visible set came from a background snapshot instead of the index.
    pub prepared: bool,
    pub submit: SubmitStats,
    pub frame_time_ms: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Submitted(FrameSummary),
    /// The backend rejected the frame; the previously submitted frame stays current.
    Skipped(BackendError),
}

impl FrameOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, FrameOutcome::Submitted(_))
    }
}

/// Owns every derived render artifact for one piano-roll surface.
pub struct RenderContext {
    config: RenderConfig,
    culler: ViewportCuller,
    geometry: GeometryCache,
    builder: BatchBuilder,
    lod: LodSelector,
    beats: BeatTextureCache,
    submitter: BatchSubmitter,
    monitor: PerformanceMonitor,
    needs_rebuild: bool,
    consecutive_failures: u32,
    last_strategy: Option<LodStrategy>,
    last_snapshot: Option<u64>,
    pending_source_ms: Option<f64>,
    beat_ids: Vec<NoteId>,
}

impl RenderContext {
    pub fn new(config: RenderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            culler: ViewportCuller::new(&config.spatial, &config.culling),
            geometry: GeometryCache::new(config.geometry.corner_segments),
            builder: BatchBuilder::new(config.theme.clone(), config.batching.max_items_per_batch),
            lod: LodSelector::new(config.lod.clone()),
            beats: BeatTextureCache::new(&config.beat_cache),
            submitter: BatchSubmitter::new(),
            monitor: PerformanceMonitor::new(config.monitor.history_capacity),
            needs_rebuild: true,
            consecutive_failures: 0,
            last_strategy: None,
            last_snapshot: None,
            pending_source_ms: None,
            beat_ids: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn culler(&self) -> &ViewportCuller {
        &self.culler
    }

    pub fn geometry(&self) -> &GeometryCache {
        &self.geometry
    }

    pub fn lod(&self) -> &LodSelector {
        &self.lod
    }

    pub fn beats(&self) -> &BeatTextureCache {
        &self.beats
    }

    pub fn submitter(&self) -> &BatchSubmitter {
        &self.submitter
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut PerformanceMonitor {
        &mut self.monitor
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_strategy(&self) -> Option<LodStrategy> {
        self.last_strategy
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.monitor.report()
    }

    pub fn optimization_suggestions(&self) -> Vec<OptimizationSuggestion> {
        optimization_suggestions(&self.monitor.report(), &self.config.advisor)
    }

    pub fn set_theme(&mut self, theme: NoteTheme) {
        self.config.theme = theme;
        self.invalidate(InvalidateReason::Theme);
    }

    pub fn invalidate(&mut self, reason: InvalidateReason) {
        tracing::debug!(?reason, "render context invalidated");
        match reason {
            InvalidateReason::Notes => {
                self.needs_rebuild = true;
                self.beats.clear();
            }
            InvalidateReason::Scale => {
                self.needs_rebuild = true;
                self.geometry.clear();
            }
            InvalidateReason::Theme => {
                self.builder = BatchBuilder::new(
                    self.config.theme.clone(),
                    self.config.batching.max_items_per_batch,
                );
            }
            InvalidateReason::All => {
                self.needs_rebuild = true;
                self.geometry.clear();
                self.beats.clear();
                self.builder = BatchBuilder::new(
                    self.config.theme.clone(),
                    self.config.batching.max_items_per_batch,
                );
                self.lod.set_floor(None);
                self.consecutive_failures = 0;
            }
        }
    }

    /// Applies pending note changes to the index and beat cache.
    ///
    /// The time spent is charged to the next rendered frame.
    pub fn sync_source<S>(&mut self, source: &mut S) -> usize
    where
        S: NoteSource + ?Sized,
    {
        let timer = StageTimer::start(stage::SOURCE);
        let changes = source.drain_changes();
        for change in &changes {
            self.mark_beats_dirty(change, &*source);
            self.culler.apply_change(change, &*source);
        }
        let elapsed = timer.finish_ms();
        if !changes.is_empty() {
            *self.pending_source_ms.get_or_insert(0.0) += elapsed;
        }
        changes.len()
    }

    fn mark_beats_dirty<S>(&mut self, change: &NoteChange, source: &S)
    where
        S: NoteSource + ?Sized,
    {
        let ids = match change {
            NoteChange::Reset => {
                self.beats.clear();
                return;
            }
            NoteChange::Added(ids) | NoteChange::Removed(ids) | NoteChange::Updated(ids) => ids,
        };
        if self.beats.is_empty() {
            return;
        }
        let projection = self.culler.projection();
        for id in ids {
            // Old placement, as still indexed.
            if let (Some(rect), Some(projection)) = (self.culler.world_rect_of(*id), projection) {
                self.beats.mark_time_range_dirty(
                    projection.x_to_time(rect.left()),
                    projection.x_to_time(rect.right()),
                );
            }
            if let Some(note) = source.get(*id) {
                self.beats.mark_time_range_dirty(note.time, note.end_time());
            }
        }
    }

    /// Drops beat textures rendered from notes the index no longer matches.
    fn discard_unsynced_beats(&mut self, from: u64, to: u64) {
        if from != to && !self.beats.is_empty() {
            tracing::debug!(from, to, "notes changed without sync, beat textures discarded");
            self.beats.clear();
        }
    }

    /// Swaps in a culler built off-thread. Older generations are ignored.
    pub fn install_culler(&mut self, culler: ViewportCuller) -> bool {
        if culler.projection().is_none() || culler.generation() < self.culler.generation() {
            tracing::debug!(
                generation = culler.generation(),
                current = self.culler.generation(),
                "stale culler discarded"
            );
            return false;
        }
        let current = self.culler.projection();
        if current.is_some() && culler.projection() != current {
            self.geometry.clear();
        }
        self.discard_unsynced_beats(self.culler.generation(), culler.generation());
        self.culler = culler;
        self.needs_rebuild = false;
        true
    }

    /// Consumes a background result that affects render state.
    ///
    /// Visible snapshots are read from [`crate::Preparer::latest_visible`]
    /// and passed to [`RenderContext::render_prepared`] instead.
    pub fn apply_prepared(&mut self, event: PrepareEvent) -> bool {
        match event {
            PrepareEvent::IndexRebuilt { culler, .. } => self.install_culler(*culler),
            PrepareEvent::GeometryKeys {
                projection, keys, ..
            } => {
                if self.culler.projection() != Some(projection) {
                    return false;
                }
                let created = self.geometry.warm(keys);
                tracing::debug!(created, "geometry cache warmed");
                true
            }
            PrepareEvent::VisibleReady { .. }
            | PrepareEvent::DirtyRegions { .. }
            | PrepareEvent::Cancelled { .. } => false,
        }
    }

    /// Culls, batches and submits one frame.
    pub fn render_frame<S>(
        &mut self,
        source: &S,
        viewport: &ViewportState,
        selection: &SelectionState,
        backend: &mut dyn RenderBackend,
    ) -> FrameOutcome
    where
        S: NoteSource + ?Sized,
    {
        self.render(source, viewport, selection, None, backend)
    }

    /// Renders one frame from a visible set computed off-thread.
    ///
    /// The snapshot is used only when no newer one was rendered before and it
    /// still covers `viewport` at the current scale and note generation.
    /// Otherwise the frame is culled on this thread.
    pub fn render_prepared<S>(
        &mut self,
        source: &S,
        viewport: &ViewportState,
        selection: &SelectionState,
        snapshot: &Versioned<VisibleSnapshot>,
        backend: &mut dyn RenderBackend,
    ) -> FrameOutcome
    where
        S: NoteSource + ?Sized,
    {
        self.render(source, viewport, selection, Some(snapshot), backend)
    }

    fn accepts_snapshot<S>(
        &mut self,
        snapshot: &Versioned<VisibleSnapshot>,
        source: &S,
        viewport: &ViewportState,
        projection: &Projection,
    ) -> bool
    where
        S: NoteSource + ?Sized,
    {
        if let Some(last) = self.last_snapshot {
            if snapshot.generation < last {
                tracing::debug!(
                    generation = snapshot.generation,
                    last,
                    "stale visible snapshot ignored"
                );
                return false;
            }
        }
        let prepared = &snapshot.value;
        let current = prepared.source_generation == source.generation()
            && prepared.projection == *projection
            && prepared.viewport.same_extent(viewport)
            && prepared.query.contains_rect(&viewport.world_rect());
        if !current {
            tracing::trace!(
                generation = snapshot.generation,
                "visible snapshot out of date, culling on the render thread"
            );
            return false;
        }
        self.last_snapshot = Some(snapshot.generation);
        true
    }

    fn render<S>(
        &mut self,
        source: &S,
        viewport: &ViewportState,
        selection: &SelectionState,
        snapshot: Option<&Versioned<VisibleSnapshot>>,
        backend: &mut dyn RenderBackend,
    ) -> FrameOutcome
    where
        S: NoteSource + ?Sized,
    {
        self.monitor.begin_frame();
        if let Some(ms) = self.pending_source_ms.take() {
            self.monitor.record_stage_time(stage::SOURCE, ms);
        }

        let timer = StageTimer::start(stage::SYNC);
        let projection = Projection::new(&self.config.layout, viewport);
        let indexed = self.culler.projection();
        if indexed.is_some() && indexed != Some(projection) {
            self.geometry.clear();
        }
        let indexed_generation = self.culler.generation();
        if self.needs_rebuild
            || indexed != Some(projection)
            || indexed_generation != source.generation()
        {
            self.discard_unsynced_beats(indexed_generation, source.generation());
            self.culler.rebuild(source.notes(), projection, source.generation());
            self.needs_rebuild = false;
        }
        let elapsed = timer.finish_ms();
        self.monitor.record_stage_time(stage::SYNC, elapsed);

        let timer = StageTimer::start(stage::CULL);
        let prepared = snapshot
            .filter(|snapshot| self.accepts_snapshot(snapshot, source, viewport, &projection));
        let visible_notes = match prepared {
            Some(snapshot) => {
                let prepared = &snapshot.value;
                self.culler
                    .adopt_visible(&prepared.viewport, &prepared.notes, viewport)
                    .len()
            }
            None => self.culler.cull(viewport).len(),
        };
        let elapsed = timer.finish_ms();
        self.monitor.record_stage_time(stage::CULL, elapsed);

        let timer = StageTimer::start(stage::LOD);
        let strategy = self.lod.select(visible_notes, viewport.zoom);
        if self.last_strategy != Some(strategy) {
            tracing::debug!(?strategy, visible_notes, zoom = viewport.zoom, "lod strategy changed");
            self.last_strategy = Some(strategy);
        }
        let elapsed = timer.finish_ms();
        self.monitor.record_stage_time(stage::LOD, elapsed);

        let use_beats = self.config.beat_cache.enabled && strategy == LodStrategy::DensityMap;
        let beat_range = if use_beats {
            self.refresh_beats(source, &projection, viewport)
        } else {
            None
        };

        let timer = StageTimer::start(stage::BATCH);
        let batches = if beat_range.is_some() {
            Vec::new()
        } else {
            self.build_batches(source, selection, strategy)
        };
        let elapsed = timer.finish_ms();
        self.monitor.record_stage_time(stage::BATCH, elapsed);

        let timer = StageTimer::start(stage::SUBMIT);
        let content_height = projection.content_height();
        let draws: Vec<BeatDraw<'_>> = beat_range
            .into_iter()
            .flatten()
            .filter_map(|beat| self.beats.peek(beat))
            .map(|texture| BeatDraw {
                texture,
                rect: Rect::new(
                    projection.time_to_x(texture.beat() as f64) - viewport.scroll_x,
                    -viewport.scroll_y,
                    projection.pixels_per_beat,
                    content_height,
                ),
            })
            .collect();
        let beat_textures = draws.len();
        *self.submitter.begin_frame() = batches;
        let result = self.submitter.submit_frame(&draws, backend);
        drop(draws);
        let elapsed = timer.finish_ms();
        self.monitor.record_stage_time(stage::SUBMIT, elapsed);

        match result {
            Ok(stats) => {
                self.consecutive_failures = 0;
                if self.lod.floor().is_some() {
                    self.lod.relax();
                }
                self.monitor.record_batch_count(stats.batches);
                self.monitor.record_note_count(visible_notes);
                let memory = backend.memory_usage();
                self.monitor.record_gpu_memory_usage(memory.used, memory.allocated);
                let cpu_bytes = self.geometry.memory_bytes() + self.beats.memory_bytes();
                self.monitor.record_cpu_memory_usage(cpu_bytes as u64);
                let frame_time_ms = self.monitor.end_frame().unwrap_or_default();
                FrameOutcome::Submitted(FrameSummary {
                    strategy,
                    visible_notes,
                    beat_textures,
                    prepared: prepared.is_some(),
                    submit: stats,
                    frame_time_ms,
                })
            }
            Err(err) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    ?err,
                    failures = self.consecutive_failures,
                    "frame submission failed, skipping frame"
                );
                if matches!(err, BackendError::OutOfMemory { .. }) {
                    self.lod.degrade_from(strategy);
                }
                if self.consecutive_failures >= self.config.recovery.max_consecutive_failures {
                    self.lod.set_floor(Some(LodStrategy::DensityMap));
                }
                self.monitor.record_note_count(visible_notes);
                self.monitor.end_frame();
                FrameOutcome::Skipped(err)
            }
        }
    }

    fn build_batches<S>(
        &mut self,
        source: &S,
        selection: &SelectionState,
        strategy: LodStrategy,
    ) -> Vec<RenderBatch>
    where
        S: NoteSource + ?Sized,
    {
        let visible = self.culler.visible();
        match strategy {
            LodStrategy::DensityMap => {
                let map = DensityMap::build(
                    visible.iter().map(|note| note.rect),
                    self.config.lod.density_cell_size,
                );
                self.builder.build_density_batches(&map, &mut self.geometry)
            }
            tier => self.builder.build_for_strategy(
                visible
                    .iter()
                    .filter_map(|visible| source.get(visible.id).map(|note| (note, visible.rect))),
                selection,
                &mut self.geometry,
                tier,
            ),
        }
    }

    /// Re-renders dirty or missing textures for the visible beats.
    ///
    /// Returns `None` when too many beats are visible to keep them all cached.
    fn refresh_beats<S>(
        &mut self,
        source: &S,
        projection: &Projection,
        viewport: &ViewportState,
    ) -> Option<std::ops::RangeInclusive<i64>>
    where
        S: NoteSource + ?Sized,
    {
        let timer = StageTimer::start(stage::BEAT_CACHE);
        let world = viewport.world_rect();
        let first = projection.x_to_time(world.left()).floor() as i64;
        let last = (projection.x_to_time(world.right()).ceil() as i64 - 1).max(first);
        let span = usize::try_from(last - first + 1).unwrap_or(usize::MAX);
        if span > (self.config.beat_cache.max_entries / 2).max(1) {
            tracing::trace!(span, "too many visible beats for the texture cache");
            let elapsed = timer.finish_ms();
            self.monitor.record_stage_time(stage::BEAT_CACHE, elapsed);
            return None;
        }

        let mut rendered = 0usize;
        for beat in first..=last {
            if !self.beats.needs_update(beat) {
                self.beats.get(beat);
                continue;
            }
            let column = Rect::new(
                projection.time_to_x(beat as f64),
                0.0,
                projection.pixels_per_beat,
                projection.content_height(),
            );
            self.culler.query_world(&column, &mut self.beat_ids);
            self.beat_ids.sort_unstable();
            let notes = self.beat_ids.iter().filter_map(|id| source.get(*id));
            self.beats.update_beat_texture(beat, notes);
            rendered += 1;
        }
        if rendered > 0 {
            tracing::trace!(first, last, rendered, "beat textures refreshed");
        }
        let elapsed = timer.finish_ms();
        self.monitor.record_stage_time(stage::BEAT_CACHE, elapsed);
        Some(first..=last)
    }

    /// Velocity bars for the notes visible in the last rendered frame.
    pub fn velocity_lane_batches<S>(
        &mut self,
        source: &S,
        selection: &SelectionState,
        lane_height: f64,
    ) -> Vec<RenderBatch>
    where
        S: NoteSource + ?Sized,
    {
        let bars = velocity_bars(
            self.culler
                .visible()
                .iter()
                .filter_map(|visible| source.get(visible.id).map(|note| (note, visible.rect))),
            lane_height,
            selection,
            &self.config.theme,
        );
        velocity_batches(
            &bars,
            &self.config.theme,
            &mut self.geometry,
            self.config.batching.max_items_per_batch,
        )
    }
}
