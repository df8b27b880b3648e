//! End-to-end behavior of the two-thread feature engine: step counting,
//! closed-loop ordering between the signal and data walks, abort paths,
//! and cancellation liveness.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scope_core::config::AcquisitionSettings;
use scope_core::feature::common::{focus_search, stack_sweep};
use scope_core::feature::node::{DataFuncs, DataOutcome, SignalFuncs};
use scope_core::feature::{FeatureContainer, FeatureSpec};
use scope_core::hardware::mock::MockStage;
use scope_core::hardware::StageMotion;
use scope_core::ScopeError;

fn settings() -> AcquisitionSettings {
    AcquisitionSettings::default()
}

#[test]
fn stack_sweep_produces_exactly_one_frame_per_plane() {
    let stage = Arc::new(Mutex::new(MockStage::new().with_speed(1000.0)));
    let planes = vec![0.0, 1.0, 2.0, 3.0, 4.0];
    let spec = stack_sweep(stage.clone(), planes.clone());

    let snaps = Arc::new(AtomicU32::new(0));
    let counter = snaps.clone();
    let container = FeatureContainer::new(vec![vec![spec]], 1, settings());
    let summary = container
        .run(move |pass| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![pass])
        })
        .expect("sweep");

    assert_eq!(summary.frames_produced, planes.len() as u64);
    assert_eq!(snaps.load(Ordering::SeqCst), planes.len() as u32);
}

#[test]
fn closed_loop_interleaves_move_snap_score_strictly() {
    // Every candidate must follow move -> snap -> score before the next
    // move happens. The shared log proves the interleaving.
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let stage = Arc::new(Mutex::new(MockStage::new().with_speed(1000.0)));
    let candidates = vec![-1.0, 0.0, 1.0];
    let passes = candidates.len() as u32;

    let metric_log = log.clone();
    let metric_stage = stage.clone();
    let (spec, _report) = focus_search(stage, candidates, move |_| {
        let position = metric_stage.lock().position()?;
        metric_log.lock().push(format!("score@{position}"));
        Ok(-position.abs())
    });

    let snap_log = log.clone();
    let container = FeatureContainer::new(vec![vec![spec]], passes, settings());
    container
        .run(move |pass| {
            snap_log.lock().push(format!("snap#{pass}"));
            Ok(vec![pass])
        })
        .expect("search");

    let entries = log.lock();
    // For each candidate the snap precedes its score, and scores arrive in
    // candidate order because the signal thread blocks on each response.
    let scores: Vec<&String> = entries.iter().filter(|e| e.starts_with("score")).collect();
    assert_eq!(scores.len(), 3);
    for pass in 0..3u64 {
        let snap_idx = entries
            .iter()
            .position(|e| e == &format!("snap#{pass}"))
            .expect("snap logged");
        let score_idx = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with("score"))
            .map(|(i, _)| i)
            .nth(pass as usize)
            .expect("score logged");
        assert!(
            snap_idx < score_idx,
            "score for pass {pass} arrived before its snap"
        );
    }
}

#[test]
fn signal_init_failure_aborts_without_running_main() {
    let mains = Arc::new(AtomicU32::new(0));
    let count = mains.clone();
    let mut spec = FeatureSpec::new("bad-init");
    spec.signal = SignalFuncs {
        init: Some(Box::new(|| anyhow::bail!("laser interlock open"))),
        main: Some(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })),
        ..Default::default()
    };

    let container = FeatureContainer::new(vec![vec![spec]], 2, settings());
    let err = container.run(|_| Ok(vec![])).expect_err("init must abort");
    assert!(err.to_string().contains("laser interlock open"));
    assert_eq!(mains.load(Ordering::SeqCst), 0);
}

#[test]
fn cleanup_hooks_run_after_abort() {
    let cleaned = Arc::new(AtomicU32::new(0));
    let signal_cleanup = cleaned.clone();
    let data_cleanup = cleaned.clone();

    let mut spec = FeatureSpec::new("cleans-up");
    spec.signal = SignalFuncs {
        main: Some(Box::new(|_| anyhow::bail!("shutter jammed"))),
        cleanup: Some(Box::new(move || {
            signal_cleanup.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    spec.data = DataFuncs {
        main: Some(Box::new(|_| Ok(DataOutcome::ok()))),
        cleanup: Some(Box::new(move || {
            data_cleanup.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let container = FeatureContainer::new(vec![vec![spec]], 1, settings());
    assert!(container.run(|_| Ok(vec![])).is_err());
    assert_eq!(cleaned.load(Ordering::SeqCst), 2);
}

#[test]
fn stop_requested_mid_run_returns_within_bounded_time() {
    let stage = Arc::new(Mutex::new(MockStage::new().with_speed(0.1)));
    // A long sweep the test will interrupt.
    let positions: Vec<f64> = (0..1000).map(f64::from).collect();
    let spec = stack_sweep(stage, positions);

    let container = FeatureContainer::new(vec![vec![spec]], 1, settings());
    let handle = container.stop_handle();
    let runner = thread::spawn(move || container.run(|pass| Ok(vec![pass])));

    thread::sleep(Duration::from_millis(50));
    handle.stop();
    let stopping = Instant::now();
    let result = runner.join().expect("runner");
    assert!(
        stopping.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        stopping.elapsed()
    );
    assert!(matches!(result, Err(ScopeError::Aborted(_))));
    assert!(handle.is_stopped());
}
