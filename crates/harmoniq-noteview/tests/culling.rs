use std::collections::HashSet;

use harmoniq_noteview::config::{CullingConfig, LayoutConfig, SpatialConfig};
use harmoniq_noteview::{
    HeadlessBackend, NoteDrawRecord, NoteId, NoteSource, Projection, Rect, RenderConfig,
    RenderContext, SelectionState, SpatialIndex, VecNoteSource, ViewportCuller, ViewportState,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn note_strategy() -> impl Strategy<Value = (f64, f64, u8)> {
    (0.0f64..64.0, prop_oneof![Just(0.0f64), 0.001f64..6.0], 0u8..128)
}

fn viewport_strategy() -> impl Strategy<Value = ViewportState> {
    (
        200.0f64..1600.0,
        100.0f64..900.0,
        0.0f64..4000.0,
        0.0f64..1200.0,
        0.1f64..3.0,
        0.5f64..2.0,
    )
        .prop_map(|(width, height, scroll_x, scroll_y, zoom, vertical_zoom)| {
            ViewportState::new(width, height)
                .with_scroll(scroll_x, scroll_y)
                .with_zoom(zoom, vertical_zoom)
        })
}

fn brute_force(
    notes: &[NoteDrawRecord],
    projection: &Projection,
    viewport: &ViewportState,
) -> HashSet<NoteId> {
    let screen = viewport.screen_rect();
    notes
        .iter()
        .filter(|note| {
            let rect = projection.screen_rect(note, viewport);
            !rect.is_degenerate() && rect.intersects(&screen)
        })
        .map(|note| note.id)
        .collect()
}

fn random_rect(rng: &mut StdRng) -> Rect {
    Rect::new(
        rng.gen_range(-500.0..5000.0),
        rng.gen_range(-500.0..3000.0),
        rng.gen_range(1.0..400.0),
        rng.gen_range(1.0..60.0),
    )
}

proptest! {
    #[test]
    fn culled_set_matches_brute_force(
        layouts in prop::collection::vec(note_strategy(), 0..300),
        viewports in prop::collection::vec(viewport_strategy(), 1..6),
    ) {
        let notes: Vec<NoteDrawRecord> = layouts
            .iter()
            .enumerate()
            .map(|(id, &(time, width, pitch))| {
                NoteDrawRecord::new(id as NoteId, time, width, pitch, 100)
            })
            .collect();
        let layout = LayoutConfig::default();
        let mut culler = ViewportCuller::new(&SpatialConfig::default(), &CullingConfig::default());

        for viewport in viewports {
            let projection = Projection::new(&layout, &viewport);
            culler.set_projection(projection, &VecNoteSource::from_notes(notes.iter().copied()));
            let culled: HashSet<NoteId> = culler.cull(&viewport).iter().map(|v| v.id).collect();
            prop_assert_eq!(culled, brute_force(&notes, &projection, &viewport));

            // Small pans inside the reuse threshold stay exact.
            let nudged = viewport.with_scroll(viewport.scroll_x + 3.0, viewport.scroll_y + 2.0);
            let culled: HashSet<NoteId> = culler.cull(&nudged).iter().map(|v| v.id).collect();
            prop_assert!(culler.stats().reused_query);
            prop_assert_eq!(culled, brute_force(&notes, &projection, &nudged));
        }
    }

    #[test]
    fn query_never_reports_duplicates(seed in any::<u64>(), count in 1usize..200) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut index = SpatialIndex::new(64.0, Default::default());
        for id in 0..count as u32 {
            index.insert(id, random_rect(&mut rng));
        }
        let query = random_rect(&mut rng).inflate(300.0);
        let mut out = Vec::new();
        index.query_into(&query, &mut out);
        let unique: HashSet<u32> = out.iter().copied().collect();
        prop_assert_eq!(unique.len(), out.len());
        let expected: HashSet<u32> = index
            .iter()
            .filter(|(_, rect)| rect.intersects(&query))
            .map(|(id, _)| id)
            .collect();
        prop_assert_eq!(unique, expected);
    }
}

#[test]
fn insert_then_remove_leaves_no_trace() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut index: SpatialIndex<u32> = SpatialIndex::with_config(&SpatialConfig::default());
    let rects: Vec<Rect> = (0..500).map(|_| random_rect(&mut rng)).collect();
    for (id, rect) in rects.iter().enumerate() {
        index.insert(id as u32, *rect);
    }
    for id in (0..500u32).step_by(2) {
        assert!(index.remove(&id));
    }
    assert!(!index.remove(&0));

    for (id, rect) in rects.iter().enumerate() {
        let hits = index.query(rect);
        assert_eq!(hits.contains(&(id as u32)), id % 2 == 1, "note {id}");
    }
    assert_eq!(index.len(), 250);
    for id in (1..500u32).step_by(2) {
        index.remove(&id);
    }
    assert!(index.is_empty());
    assert_eq!(index.bucket_count(), 0);
}

#[test]
fn optimize_settles_within_two_calls() {
    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut index: SpatialIndex<u32> = SpatialIndex::with_config(&SpatialConfig::default());
        for id in 0..rng.gen_range(10..2000) {
            index.insert(id, random_rect(&mut rng));
        }
        index.optimize();
        assert!(!index.optimize(), "seed {seed} kept rebuilding");
    }
}

#[test]
fn uniform_notes_settle_within_two_optimize_calls() {
    let mut rng = StdRng::seed_from_u64(10_000);
    let projection = Projection::new(&LayoutConfig::default(), &ViewportState::default());
    let mut index: SpatialIndex<NoteId> = SpatialIndex::with_config(&SpatialConfig::default());
    for id in 0..10_000u64 {
        let note = NoteDrawRecord::new(
            id,
            rng.gen_range(0.0..2_000.0),
            rng.gen_range(0.25..2.0),
            rng.gen_range(0..128),
            100,
        );
        index.insert(id, projection.world_rect(&note));
    }

    let rebuilds = (0..3).take_while(|_| index.optimize()).count();
    assert!(rebuilds <= 2, "{rebuilds} rebuilds");
    assert!(!index.optimize());
    assert_eq!(index.len(), 10_000);
    let everything = Rect::new(-1.0, -1.0, 1.0e6, 1.0e5);
    assert_eq!(index.query(&everything).len(), 10_000);
}

#[test]
fn empty_scene_renders_nothing() {
    let mut context = RenderContext::new(RenderConfig::default()).unwrap();
    let notes = VecNoteSource::new();
    let mut backend = HeadlessBackend::new();
    let viewport = ViewportState::default();
    let outcome =
        context.render_frame(&notes, &viewport, &SelectionState::default(), &mut backend);
    assert!(outcome.is_submitted());
    assert!(context.culler().visible().is_empty());
    assert_eq!(context.culler().stats().total, 0);
    assert_eq!(backend.frames_begun, 0);
    assert!(backend.draws.is_empty());
}

#[test]
fn panning_a_single_note_reuses_one_mesh() {
    let mut context = RenderContext::new(RenderConfig::default()).unwrap();
    let notes = VecNoteSource::from_notes([NoteDrawRecord::new(1, 4.0, 1.0, 100, 90)]);
    let mut backend = HeadlessBackend::new();
    let selection = SelectionState::default();
    for step in 0..60 {
        let viewport = ViewportState::new(800.0, 600.0).with_scroll(f64::from(step) * 7.0, 200.0);
        context.render_frame(&notes, &viewport, &selection, &mut backend);
        assert_eq!(context.geometry().len(), 1);
    }
    assert_eq!(context.geometry().stats().misses, 1);
    assert_eq!(context.culler().generation(), notes.generation());
}
