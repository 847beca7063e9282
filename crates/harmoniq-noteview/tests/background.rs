use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use harmoniq_noteview::config::TaskConfig;
use harmoniq_noteview::prepare::task_key;
use harmoniq_noteview::{
    FrameOutcome, HeadlessBackend, NoteDrawRecord, NoteSource, PrepareEvent, Preparer, Projection,
    RenderConfig, RenderContext, SelectionState, SnapshotSlot, TaskRegistry, VecNoteSource,
    ViewportState,
};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn preparer() -> Preparer {
    Preparer::new(&TaskConfig {
        worker_threads: 2,
        max_concurrent_jobs: 1,
        ..TaskConfig::default()
    })
    .expect("preparation pool")
}

fn next_event(preparer: &Preparer) -> PrepareEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(event) = preparer.try_recv() {
            return event;
        }
        assert!(Instant::now() < deadline, "no preparation result");
        thread::sleep(Duration::from_millis(1));
    }
}

fn notes(count: u64) -> Vec<NoteDrawRecord> {
    (0..count)
        .map(|id| NoteDrawRecord::new(id, id as f64 * 0.25, 0.25, (id % 128) as u8, 90))
        .collect()
}

#[test]
fn late_stale_results_never_win() {
    let slot = Arc::new(SnapshotSlot::new());
    let mut generations: Vec<u64> = (1..=64).collect();
    generations.shuffle(&mut StdRng::seed_from_u64(99));

    let workers: Vec<_> = generations
        .chunks(8)
        .map(|chunk| {
            let slot = Arc::clone(&slot);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for generation in chunk {
                    slot.publish(generation, format!("result {generation}"));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let latest = slot.latest().unwrap();
    assert_eq!(latest.generation, 64);
    assert_eq!(latest.value, "result 64");
    assert!(!slot.publish(10, "late".to_owned()));
}

#[test]
fn restarting_a_key_cancels_the_previous_run() {
    let registry = TaskRegistry::new();
    let first = registry.start(task_key::VISIBLE);
    let second = registry.start(task_key::VISIBLE);
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(registry.running(), 1);
    assert!(!registry.finish(&first));
    assert!(registry.finish(&second));
    assert_eq!(registry.running(), 0);
}

#[test]
fn replaced_job_reports_cancellation() {
    let preparer = preparer();
    let shared: Arc<[NoteDrawRecord]> = notes(2_000).into();
    let viewport = ViewportState::new(1280.0, 720.0);
    let projection = Projection::new(&RenderConfig::default().layout, &viewport);

    // Hold the only permit so both runs queue behind it.
    let permit = preparer.throttle().try_acquire().expect("free permit");
    let first = preparer.spawn_visible(Arc::clone(&shared), projection, viewport, 1);
    let second = preparer.spawn_visible(shared, projection, viewport, 2);
    assert!(first.is_cancelled());

    match next_event(&preparer) {
        PrepareEvent::Cancelled { key, generation } => {
            assert_eq!(key, task_key::VISIBLE);
            assert_eq!(generation, first.generation());
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    drop(permit);
    match next_event(&preparer) {
        PrepareEvent::VisibleReady { generation, .. } => {
            assert_eq!(generation, second.generation())
        }
        other => panic!("expected visible set, got {other:?}"),
    }
    let snapshot = preparer.latest_visible().unwrap();
    assert_eq!(snapshot.value.source_generation, 2);
    assert!(!snapshot.value.notes.is_empty());
}

#[test]
fn culler_built_off_thread_is_installed() {
    let config = RenderConfig::default();
    let source = VecNoteSource::from_notes(notes(5_000));
    let viewport = ViewportState::new(1280.0, 720.0).with_scroll(0.0, 400.0);
    let projection = Projection::new(&config.layout, &viewport);

    let preparer = preparer();
    preparer.spawn_index_rebuild(
        source.notes().to_vec().into(),
        projection,
        config.spatial.clone(),
        config.culling.clone(),
        source.generation(),
    );
    let mut context = RenderContext::new(config).unwrap();
    let event = next_event(&preparer);
    assert!(matches!(event, PrepareEvent::IndexRebuilt { .. }));
    assert!(context.apply_prepared(event));
    assert_eq!(context.culler().index().len(), 5_000);

    let mut backend = HeadlessBackend::new();
    let selection = SelectionState::default();
    let outcome = context.render_frame(&source, &viewport, &selection, &mut backend);
    assert!(outcome.is_submitted());
    assert!(!context.culler().visible().is_empty());
}

#[test]
fn precomputed_geometry_warms_the_cache() {
    let config = RenderConfig::default();
    let source = VecNoteSource::from_notes(notes(300));
    let viewport = ViewportState::new(1280.0, 720.0);
    let projection = Projection::new(&config.layout, &viewport);
    let mut context = RenderContext::new(config).unwrap();
    let mut backend = HeadlessBackend::new();
    context.render_frame(&source, &viewport, &SelectionState::default(), &mut backend);

    let preparer = preparer();
    preparer.spawn_geometry(source.notes().to_vec().into(), projection);
    let event = next_event(&preparer);
    assert!(context.apply_prepared(event));
    assert_eq!(context.geometry().len(), 1);
}

#[test]
fn render_thread_draws_the_latest_visible_set() {
    let config = RenderConfig::default();
    let source = VecNoteSource::from_notes(notes(5_000));
    let viewport = ViewportState::new(1280.0, 720.0).with_scroll(200.0, 400.0);
    let projection = Projection::new(&config.layout, &viewport);
    let selection = SelectionState::default();

    let mut culled = RenderContext::new(config.clone()).unwrap();
    let mut backend = HeadlessBackend::new();
    let FrameOutcome::Submitted(expected) =
        culled.render_frame(&source, &viewport, &selection, &mut backend)
    else {
        panic!("reference frame was skipped");
    };

    let preparer = preparer();
    let shared: Arc<[NoteDrawRecord]> = source.notes().to_vec().into();
    let generation = source.generation();
    let stale = preparer.spawn_visible(Arc::clone(&shared), projection, viewport, generation);
    assert!(matches!(next_event(&preparer), PrepareEvent::VisibleReady { .. }));
    let first = preparer.latest_visible().unwrap();
    assert_eq!(first.generation, stale.generation());
    let fresh = preparer.spawn_visible(shared, projection, viewport, generation);
    assert!(matches!(next_event(&preparer), PrepareEvent::VisibleReady { .. }));
    let latest = preparer.latest_visible().unwrap();
    assert_eq!(latest.generation, fresh.generation());

    let mut context = RenderContext::new(config).unwrap();
    let FrameOutcome::Submitted(summary) =
        context.render_prepared(&source, &viewport, &selection, &latest, &mut backend)
    else {
        panic!("prepared frame was skipped");
    };
    assert!(summary.prepared);
    assert_eq!(summary.visible_notes, expected.visible_notes);
    assert_eq!(summary.submit.instances, expected.submit.instances);

    // The earlier snapshot arrives late: the frame is culled here instead.
    let FrameOutcome::Submitted(summary) =
        context.render_prepared(&source, &viewport, &selection, &first, &mut backend)
    else {
        panic!("fallback frame was skipped");
    };
    assert!(!summary.prepared);
    assert_eq!(summary.visible_notes, expected.visible_notes);
}
