//! Off-thread preparation of render inputs.
//!
//! Jobs run on a bounded rayon pool, poll their cancellation token every
//! iteration and hand results back to the render thread over a channel.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::{CullingConfig, SpatialConfig, TaskConfig};
use crate::culler::{ViewportCuller, VisibleNote};
use crate::error::PrepareError;
use crate::geom::Rect;
use crate::geometry::GeometryKey;
use crate::note::{NoteDrawRecord, Projection, ViewportState};
use crate::tasks::{
    CancellationToken, ComputeThrottle, SnapshotSlot, TaskHandle, TaskRegistry, Versioned,
};

pub mod task_key {
    pub const VISIBLE: &str = "visible_notes";
    pub const GEOMETRY: &str = "geometry_keys";
    pub const DIRTY_REGIONS: &str = "dirty_regions";
    pub const INDEX: &str = "spatial_index";
}

/// Notes near a viewport, computed without the spatial index.
#[derive(Clone, Debug, PartialEq)]
pub struct VisibleSnapshot {
    pub source_generation: u64,
    pub projection: Projection,
    pub viewport: ViewportState,
    /// World-space area the snapshot covers: the viewport grown by the margin.
    pub query: Rect,
    /// Screen rects relative to `viewport`.
    pub notes: Vec<VisibleNote>,
}

/// Screen-space rects of notes intersecting the viewport grown by `margin`.
pub fn compute_visible_notes(
    notes: &[NoteDrawRecord],
    projection: &Projection,
    viewport: &ViewportState,
    margin: f64,
    token: &CancellationToken,
) -> Option<Vec<VisibleNote>> {
    let query = viewport.world_rect().inflate(margin);
    let mut visible = Vec::new();
    for note in notes {
        if token.is_cancelled() {
            return None;
        }
        let world = projection.world_rect(note);
        if !world.is_degenerate() && world.intersects(&query) {
            visible.push(VisibleNote {
                id: note.id,
                rect: world.translate(-viewport.scroll_x, -viewport.scroll_y),
            });
        }
    }
    Some(visible)
}

/// Distinct mesh keys for `notes`, in first-seen order.
pub fn precompute_geometry_keys(
    notes: &[NoteDrawRecord],
    projection: &Projection,
    token: &CancellationToken,
) -> Option<Vec<GeometryKey>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for note in notes {
        if token.is_cancelled() {
            return None;
        }
        let rect = projection.world_rect(note);
        if rect.is_degenerate() {
            continue;
        }
        let key = GeometryKey::new(rect.width, rect.height, f64::from(note.corner_radius));
        if seen.insert(key) {
            keys.push(key);
        }
    }
    Some(keys)
}

/// Screen regions needing repaint after `changed` notes moved or changed.
pub fn compute_dirty_regions(
    changed: &[NoteDrawRecord],
    projection: &Projection,
    viewport: &ViewportState,
    margin: f64,
    token: &CancellationToken,
) -> Option<Vec<Rect>> {
    let screen = viewport.screen_rect();
    let mut regions = Vec::new();
    for note in changed {
        if token.is_cancelled() {
            return None;
        }
        let rect = projection.screen_rect(note, viewport);
        if rect.is_degenerate() {
            continue;
        }
        if let Some(region) = rect.inflate(margin).intersection(&screen) {
            regions.push(region);
        }
    }
    Some(regions)
}

/// Results delivered to the render thread.
#[derive(Debug)]
pub enum PrepareEvent {
    /// A new visible snapshot was published to [`Preparer::latest_visible`].
    VisibleReady { generation: u64, count: usize },
    GeometryKeys {
        generation: u64,
        projection: Projection,
        keys: Vec<GeometryKey>,
    },
    DirtyRegions { generation: u64, regions: Vec<Rect> },
    IndexRebuilt {
        generation: u64,
        culler: Box<ViewportCuller>,
    },
    Cancelled { key: &'static str, generation: u64 },
}

pub struct Preparer {
    pool: rayon::ThreadPool,
    registry: Arc<TaskRegistry>,
    throttle: ComputeThrottle,
    visible: Arc<SnapshotSlot<VisibleSnapshot>>,
    tx: Sender<PrepareEvent>,
    rx: Receiver<PrepareEvent>,
    visible_margin: f64,
    dirty_region_margin: f64,
}

impl Preparer {
    pub fn new(config: &TaskConfig) -> Result<Self, PrepareError> {
        config.validate()?;
        let threads = config.resolved_worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("noteview-prepare-{index}"))
            .build()?;
        let (tx, rx) = unbounded();
        tracing::debug!(threads, "preparation pool started");
        Ok(Self {
            pool,
            registry: Arc::new(TaskRegistry::new()),
            throttle: ComputeThrottle::new(config.resolved_max_concurrent_jobs()),
            visible: Arc::new(SnapshotSlot::new()),
            tx,
            rx,
            visible_margin: config.visible_margin,
            dirty_region_margin: config.dirty_region_margin,
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn throttle(&self) -> &ComputeThrottle {
        &self.throttle
    }

    fn spawn<F>(&self, key: &'static str, job: F) -> TaskHandle
    where
        F: FnOnce(&TaskHandle) -> Option<PrepareEvent> + Send + 'static,
    {
        let handle = self.registry.start(key);
        let task = handle.clone();
        let registry = Arc::clone(&self.registry);
        let throttle = self.throttle.clone();
        let tx = self.tx.clone();
        self.pool.spawn(move || {
            let event = match throttle.acquire_cancellable(task.token()) {
                Some(_permit) => job(&task),
                None => None,
            };
            let event = event.unwrap_or_else(|| {
                tracing::debug!(key, generation = task.generation(), "preparation cancelled");
                PrepareEvent::Cancelled {
                    key,
                    generation: task.generation(),
                }
            });
            registry.finish(&task);
            if tx.send(event).is_err() {
                tracing::debug!(key, "preparation result dropped: receiver gone");
            }
        });
        handle
    }

    /// Recomputes the visible set for `viewport`, replacing any pending run.
    pub fn spawn_visible(
        &self,
        notes: Arc<[NoteDrawRecord]>,
        projection: Projection,
        viewport: ViewportState,
        source_generation: u64,
    ) -> TaskHandle {
        let slot = Arc::clone(&self.visible);
        let margin = self.visible_margin;
        self.spawn(task_key::VISIBLE, move |task| {
            let visible =
                compute_visible_notes(&notes, &projection, &viewport, margin, task.token())?;
            if task.is_cancelled() {
                return None;
            }
            let count = visible.len();
            let snapshot = VisibleSnapshot {
                source_generation,
                projection,
                viewport,
                query: viewport.world_rect().inflate(margin),
                notes: visible,
            };
            slot.publish(task.generation(), snapshot)
                .then_some(PrepareEvent::VisibleReady {
                    generation: task.generation(),
                    count,
                })
        })
    }

    pub fn spawn_geometry(
        &self,
        notes: Arc<[NoteDrawRecord]>,
        projection: Projection,
    ) -> TaskHandle {
        self.spawn(task_key::GEOMETRY, move |task| {
            let keys = precompute_geometry_keys(&notes, &projection, task.token())?;
            (!task.is_cancelled()).then(|| PrepareEvent::GeometryKeys {
                generation: task.generation(),
                projection,
                keys,
            })
        })
    }

    pub fn spawn_dirty_regions(
        &self,
        changed: Vec<NoteDrawRecord>,
        projection: Projection,
        viewport: ViewportState,
    ) -> TaskHandle {
        let margin = self.dirty_region_margin;
        self.spawn(task_key::DIRTY_REGIONS, move |task| {
            let regions =
                compute_dirty_regions(&changed, &projection, &viewport, margin, task.token())?;
            (!task.is_cancelled()).then(|| PrepareEvent::DirtyRegions {
                generation: task.generation(),
                regions,
            })
        })
    }

    /// Builds a complete culler off-thread for the render thread to swap in.
    pub fn spawn_index_rebuild(
        &self,
        notes: Arc<[NoteDrawRecord]>,
        projection: Projection,
        spatial: SpatialConfig,
        culling: CullingConfig,
        source_generation: u64,
    ) -> TaskHandle {
        self.spawn(task_key::INDEX, move |task| {
            let culler = ViewportCuller::rebuilt(
                &spatial,
                &culling,
                notes.iter().take_while(|_| !task.is_cancelled()),
                projection,
                source_generation,
            );
            // A cancelled run stops early and leaves a partial index.
            (!task.is_cancelled()).then(|| PrepareEvent::IndexRebuilt {
                generation: task.generation(),
                culler: Box::new(culler),
            })
        })
    }

    /// Next finished result, if any. Never blocks.
    pub fn try_recv(&self) -> Option<PrepareEvent> {
        self.rx.try_recv().ok()
    }

    pub fn latest_visible(&self) -> Option<Arc<Versioned<VisibleSnapshot>>> {
        self.visible.latest()
    }

    pub fn cancel(&self, key: &str) -> bool {
        self.registry.cancel(key)
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }
}

impl Drop for Preparer {
    fn drop(&mut self) {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "preparation jobs cancelled on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use std::time::{Duration, Instant};

    fn notes() -> Vec<NoteDrawRecord> {
        (0..100)
            .map(|id| NoteDrawRecord::new(id, id as f64, 0.5, 127, 100))
            .collect()
    }

    fn projection() -> Projection {
        Projection::new(&LayoutConfig::default(), &ViewportState::default())
    }

    fn wait_for(preparer: &Preparer) -> PrepareEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = preparer.try_recv() {
                return event;
            }
            assert!(Instant::now() < deadline, "timed out waiting for preparation");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn cancelled_token_yields_no_result() {
        let token = CancellationToken::new();
        token.cancel();
        let viewport = ViewportState::new(800.0, 600.0);
        assert!(compute_visible_notes(&notes(), &projection(), &viewport, 0.0, &token).is_none());
        assert!(precompute_geometry_keys(&notes(), &projection(), &token).is_none());
    }

    #[test]
    fn visible_notes_respect_margin() {
        let token = CancellationToken::new();
        let viewport = ViewportState::new(800.0, 600.0);
        let tight = compute_visible_notes(&notes(), &projection(), &viewport, 0.0, &token)
            .expect("not cancelled");
        let loose = compute_visible_notes(&notes(), &projection(), &viewport, 100.0, &token)
            .expect("not cancelled");
        assert_eq!(tight.len(), 8);
        assert_eq!(loose.len(), 9);
    }

    #[test]
    fn geometry_keys_are_distinct() {
        let keys = precompute_geometry_keys(&notes(), &projection(), &CancellationToken::new())
            .expect("not cancelled");
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn dirty_regions_are_clipped_to_the_viewport() {
        let viewport = ViewportState::new(800.0, 600.0);
        let changed = [NoteDrawRecord::new(1, 0.0, 0.5, 127, 100)];
        let token = CancellationToken::new();
        let regions = compute_dirty_regions(&changed, &projection(), &viewport, 5.0, &token)
            .expect("not cancelled");
        assert_eq!(regions, vec![Rect::new(0.0, 0.0, 55.0, 17.0)]);
    }

    #[test]
    fn preparer_publishes_visible_snapshot() {
        let config = TaskConfig {
            worker_threads: 2,
            max_concurrent_jobs: 2,
            ..TaskConfig::default()
        };
        let preparer = Preparer::new(&config).expect("pool builds");
        let shared: Arc<[NoteDrawRecord]> = notes().into();
        let viewport = ViewportState::new(800.0, 600.0);
        let handle = preparer.spawn_visible(shared, projection(), viewport, 7);
        match wait_for(&preparer) {
            PrepareEvent::VisibleReady { generation, .. } => {
                assert_eq!(generation, handle.generation())
            }
            other => panic!("unexpected event {other:?}"),
        }
        let latest = preparer.latest_visible().expect("snapshot published");
        assert_eq!(latest.value.source_generation, 7);
        assert_eq!(latest.value.query, viewport.world_rect().inflate(config.visible_margin));
        assert!(!preparer.registry().is_running(task_key::VISIBLE));
    }

    #[test]
    fn negative_margins_are_rejected() {
        let config = TaskConfig {
            visible_margin: -1.0,
            ..TaskConfig::default()
        };
        assert!(matches!(Preparer::new(&config), Err(PrepareError::Config(_))));
    }
}
