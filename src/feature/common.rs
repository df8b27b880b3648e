//! Stock acquisition features.
//!
//! Ready-made [`FeatureSpec`] builders covering the recurring acquisition
//! patterns: a stage-driven stack sweep, a closed-loop focus search, and a
//! data-side frame recorder. They double as worked examples of the three
//! node shapes (multi-step device-bound, need-response, plain one-step).
//!
//! Frame ids produced by the engine's frame source are assumed to double as
//! pool slot ids; [`frame_recorder`] relies on that convention to resolve
//! frame content.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::node::{DataFuncs, DataOutcome, FeatureSpec, NodeConfig, NodeKind, SignalFuncs};
use crate::buffer::SharedBufferPool;
use crate::hardware::{FrameSink, StageMotion};

/// Best candidate found by [`focus_search`], written when the search ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusResult {
    pub position: f64,
    pub score: f64,
}

/// Multi-step stack sweep: step the stage through `positions`, one frame
/// per plane.
///
/// The signal node is device-related, so the engine waits for each move
/// and exposure before advancing. The data node counts planes and
/// completes with the sweep.
pub fn stack_sweep<S>(stage: Arc<Mutex<S>>, positions: Vec<f64>) -> FeatureSpec
where
    S: StageMotion + 'static,
{
    let total = positions.len();
    let index = Arc::new(Mutex::new(0usize));
    let signal_index = index.clone();
    let init_index = index.clone();
    let end_index = index;
    let planes_seen = Arc::new(Mutex::new(0usize));
    let data_planes = planes_seen.clone();
    let data_init = planes_seen.clone();

    let mut spec = FeatureSpec::new("stack-sweep");
    spec.config = NodeConfig {
        kind: NodeKind::MultiStep,
        device_related: true,
        need_response: false,
    };
    spec.signal = SignalFuncs {
        init: Some(Box::new(move || {
            *init_index.lock() = 0;
            Ok(())
        })),
        main: Some(Box::new(move |_| {
            let mut idx = signal_index.lock();
            let position = positions[*idx];
            stage.lock().move_absolute(position)?;
            debug!(plane = *idx, position, "stack plane positioned");
            *idx += 1;
            Ok(true)
        })),
        end: Some(Box::new(move || *end_index.lock() >= total)),
        ..Default::default()
    };
    spec.data = DataFuncs {
        init: Some(Box::new(move || {
            *data_init.lock() = 0;
            Ok(())
        })),
        main: Some(Box::new(move |frames| {
            *data_planes.lock() += frames.len();
            Ok(DataOutcome::ok())
        })),
        end: Some(Box::new(move || *planes_seen.lock() >= total)),
        ..Default::default()
    };
    spec
}

/// Closed-loop focus search over `candidates` stage positions.
///
/// Each engine pass moves the stage to one candidate, acquires a frame,
/// and waits for the data side to score it with `metric`. After the last
/// candidate the stage returns to the best-scoring position and the result
/// lands in the returned handle.
///
/// Run with `number_of_executions` equal to `candidates.len()`.
pub fn focus_search<S, M>(
    stage: Arc<Mutex<S>>,
    candidates: Vec<f64>,
    mut metric: M,
) -> (FeatureSpec, Arc<Mutex<Option<FocusResult>>>)
where
    S: StageMotion + 'static,
    M: FnMut(&[u64]) -> anyhow::Result<f64> + Send + 'static,
{
    let result: Arc<Mutex<Option<FocusResult>>> = Arc::new(Mutex::new(None));
    let report = result.clone();
    let total = candidates.len();
    let index = Arc::new(Mutex::new(0usize));
    let main_index = index.clone();
    let main_stage = stage.clone();
    let main_candidates = candidates.clone();

    let mut spec = FeatureSpec::new("focus-search");
    spec.config = NodeConfig {
        device_related: true,
        need_response: true,
        ..Default::default()
    };
    spec.signal = SignalFuncs {
        main: Some(Box::new(move |_| {
            let idx = *main_index.lock();
            if idx < total {
                main_stage.lock().move_absolute(main_candidates[idx])?;
            }
            Ok(true)
        })),
        main_response: Some(Box::new(move |score| {
            let mut idx = index.lock();
            // Extra passes past the last candidate score nothing.
            if *idx >= total {
                return Ok(true);
            }
            let position = candidates[*idx];
            let mut best = result.lock();
            if best.map_or(true, |b| score > b.score) {
                *best = Some(FocusResult { position, score });
            }
            *idx += 1;
            if *idx == total {
                if let Some(found) = *best {
                    stage.lock().move_absolute(found.position)?;
                    info!(
                        position = found.position,
                        score = found.score,
                        "focus search settled"
                    );
                }
            }
            Ok(true)
        })),
        ..Default::default()
    };
    spec.data = DataFuncs {
        main: Some(Box::new(move |frames| {
            let score = metric(frames)?;
            Ok(DataOutcome::with_response(score))
        })),
        ..Default::default()
    };
    (spec, report)
}

/// Data-side recorder: resolve each frame id against the pool and hand the
/// bytes to `sink`.
///
/// Plain one-step node, so a sink failure is soft and never stops the
/// acquisition. With `release_slots` the recorder acts as the terminal
/// consumer and returns each slot to the free list after writing.
pub fn frame_recorder<S>(
    sink: Arc<Mutex<S>>,
    pool: SharedBufferPool,
    release_slots: bool,
) -> FeatureSpec
where
    S: FrameSink + 'static,
{
    let mut spec = FeatureSpec::new("frame-recorder");
    spec.data = DataFuncs {
        main: Some(Box::new(move |frames| {
            for &frame_id in frames {
                let slot = frame_id as usize;
                let handle = pool.attach(&pool.descriptor(slot))?;
                sink.lock().consume(&handle.read(), frame_id)?;
                if release_slots {
                    pool.release_slot(slot);
                }
            }
            Ok(DataOutcome::ok())
        })),
        ..Default::default()
    };
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameDtype;
    use crate::config::AcquisitionSettings;
    use crate::feature::container::FeatureContainer;
    use crate::hardware::mock::{MockDisplay, MockStage};
    use std::time::Duration;

    #[test]
    fn test_stack_sweep_visits_every_plane() {
        let stage = Arc::new(Mutex::new(MockStage::new().with_speed(1000.0)));
        let planes = vec![0.0, 5.0, 10.0, 15.0];
        let spec = stack_sweep(stage.clone(), planes.clone());

        let container =
            FeatureContainer::new(vec![vec![spec]], 1, AcquisitionSettings::default());
        let summary = container.run(|pass| Ok(vec![pass])).expect("sweep");

        assert_eq!(summary.frames_produced, planes.len() as u64);
        let final_position = stage.lock().position().expect("position");
        assert!((final_position - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_focus_search_settles_on_best_candidate() {
        let stage = Arc::new(Mutex::new(MockStage::new().with_speed(1000.0)));
        let candidates = vec![-4.0, -2.0, 0.0, 2.0, 4.0];
        let passes = candidates.len() as u32;
        // Sharpness peaks when the stage sits at +2.
        let metric_stage = stage.clone();
        let (spec, report) = focus_search(stage.clone(), candidates, move |_| {
            let position = metric_stage.lock().position()?;
            Ok(-(position - 2.0).abs())
        });

        let container =
            FeatureContainer::new(vec![vec![spec]], passes, AcquisitionSettings::default());
        container.run(|pass| Ok(vec![pass])).expect("search");

        let found = (*report.lock()).expect("search must record a result");
        assert!((found.position - 2.0).abs() < f64::EPSILON);
        let settled = stage.lock().position().expect("position");
        assert!((settled - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_focus_search_tolerates_extra_passes() {
        let stage = Arc::new(Mutex::new(MockStage::new().with_speed(1000.0)));
        let metric_stage = stage.clone();
        let (spec, report) = focus_search(stage.clone(), vec![-1.0, 1.0], move |_| {
            let position = metric_stage.lock().position()?;
            Ok(-(position - 1.0).abs())
        });

        // More passes than candidates; the surplus must be inert.
        let container =
            FeatureContainer::new(vec![vec![spec]], 4, AcquisitionSettings::default());
        container.run(|pass| Ok(vec![pass])).expect("search");

        let found = (*report.lock()).expect("search must record a result");
        assert!((found.position - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frame_recorder_consumes_pool_slots() {
        let pool = SharedBufferPool::allocate(&[16], FrameDtype::U8, 4).expect("pool");
        let display = Arc::new(Mutex::new(MockDisplay::new(Duration::ZERO)));
        let spec = frame_recorder(display.clone(), pool.clone(), true);

        let frame_pool = pool.clone();
        let container =
            FeatureContainer::new(vec![vec![spec]], 3, AcquisitionSettings::default());
        container
            .run(move |_| {
                let slot = frame_pool
                    .acquire_slot()
                    .ok_or_else(|| crate::error::ScopeError::Allocation("pool drained".into()))?;
                let handle = frame_pool.attach(&frame_pool.descriptor(slot))?;
                handle.write().fill(slot as u8);
                Ok(vec![slot as u64])
            })
            .expect("run");

        assert_eq!(display.lock().frames_consumed(), 3);
        // Terminal consumer returned every slot.
        assert_eq!(pool.available(), 4);
    }
}
