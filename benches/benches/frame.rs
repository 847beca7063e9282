use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use harmoniq_noteview::config::LayoutConfig;
use harmoniq_noteview::{
    BatchBuilder, GeometryCache, HeadlessBackend, NoteDrawRecord, NoteSource, NoteTheme,
    Projection, RenderConfig, RenderContext, SelectionState, VecNoteSource, ViewportCuller,
    ViewportState,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn arrangement(count: u64) -> VecNoteSource {
    let mut rng = StdRng::seed_from_u64(42);
    VecNoteSource::from_notes((0..count).map(|id| {
        NoteDrawRecord::new(
            id,
            rng.gen_range(0.0..4_096.0),
            [0.25, 0.5, 1.0, 2.0][rng.gen_range(0..4)],
            rng.gen_range(24..108),
            rng.gen_range(1..128),
        )
    }))
}

fn cull_pan(c: &mut Criterion) {
    let mut group = c.benchmark_group("cull");
    group.measurement_time(Duration::from_secs(10));

    for count in [10_000u64, 1_000_000] {
        let notes = arrangement(count);
        let config = RenderConfig::default();
        let viewport = ViewportState::new(1920.0, 1080.0);
        let projection = Projection::new(&config.layout, &viewport);
        let mut culler = ViewportCuller::rebuilt(
            &config.spatial,
            &config.culling,
            notes.notes(),
            projection,
            notes.generation(),
        );

        group.bench_function(format!("pan_{count}"), |b| {
            let mut scroll = 0.0;
            b.iter(|| {
                scroll = (scroll + 37.0) % 300_000.0;
                let visible = culler.cull(&viewport.with_scroll(scroll, 300.0)).len();
                black_box(visible)
            });
        });
    }

    group.finish();
}

fn build_batches(c: &mut Criterion) {
    let notes = arrangement(20_000);
    let projection = Projection::new(&LayoutConfig::default(), &ViewportState::default());
    let candidates: Vec<_> = notes
        .notes()
        .iter()
        .map(|note| (note, projection.world_rect(note)))
        .collect();
    let builder = BatchBuilder::new(NoteTheme::standard().with_pitch_colors(), 10_000);
    let selection = SelectionState::default();

    c.bench_function("batch/build_20k", |b| {
        b.iter_batched(
            || GeometryCache::new(8),
            |mut cache| {
                let batches =
                    builder.build_batches(candidates.iter().copied(), &selection, &mut cache);
                black_box(batches.len())
            },
            BatchSize::SmallInput,
        );
    });
}

fn full_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");
    group.sample_size(30);

    for (label, zoom) in [("zoomed_in", 1.0), ("zoomed_out", 0.05)] {
        let notes = arrangement(200_000);
        let mut context = RenderContext::new(RenderConfig::default()).expect("render context");
        let mut backend = HeadlessBackend::new();
        let selection = SelectionState::default();
        let viewport = ViewportState::new(1920.0, 1080.0)
            .with_zoom(zoom, 1.0)
            .with_scroll(0.0, 200.0);

        group.bench_function(label, |b| {
            b.iter(|| {
                backend.clear_records();
                let outcome = context.render_frame(&notes, &viewport, &selection, &mut backend);
                black_box(outcome.is_submitted())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, cull_pan, build_batches, full_frame);
criterion_main!(benches);
