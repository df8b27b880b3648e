//! The per-frame acquisition pipeline.
//!
//! Each frame travels camera → processor → display → storage on its own
//! [`CustodyThread`], holding exactly one stage at a time. The stages are
//! worker-owned objects behind [`ProxyObject`] handles; the frame content
//! stays in one pool slot for the whole trip, and only the slot descriptor
//! moves between workers.
//!
//! Because custody tokens are queued in spawn order, frame N+1 can occupy
//! the camera while frame N is still in the processor: the pipeline is full
//! depth-wise while every stage stays single-frame. Backpressure comes from
//! the pool: a burst never has more frames in flight than there are slots.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::buffer::SharedBufferPool;
use crate::config::AcquisitionSettings;
use crate::custody::{CustodyThread, Resource};
use crate::error::{CoreResult, ScopeError};
use crate::hardware::{CameraDevice, FrameProcessor, FrameSink};
use crate::proxy::{ProxyObject, WorkerObject};

/// Per-stage wait queues, one per pipeline position.
pub struct PipelineStages {
    pub camera: Arc<Resource>,
    pub processor: Arc<Resource>,
    pub display: Arc<Resource>,
    pub storage: Arc<Resource>,
}

impl PipelineStages {
    pub fn new() -> Self {
        Self {
            camera: Resource::new("camera"),
            processor: Resource::new("processor"),
            display: Resource::new("display"),
            storage: Resource::new("storage"),
        }
    }
}

impl Default for PipelineStages {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported by the stages after a burst.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineReport {
    pub frames_requested: u64,
    pub frames_recorded: u64,
    pub frames_displayed: u64,
    pub frames_stored: u64,
}

/// A four-stage frame pipeline over worker-owned devices.
pub struct AcquisitionPipeline<C, P, D, W>
where
    C: CameraDevice + WorkerObject,
    P: FrameProcessor + WorkerObject,
    D: FrameSink + WorkerObject,
    W: FrameSink + WorkerObject,
{
    pool: SharedBufferPool,
    camera: Arc<ProxyObject<C>>,
    processor: Arc<ProxyObject<P>>,
    display: Arc<ProxyObject<D>>,
    storage: Arc<ProxyObject<W>>,
    stages: PipelineStages,
    settings: AcquisitionSettings,
}

impl<C, P, D, W> AcquisitionPipeline<C, P, D, W>
where
    C: CameraDevice + WorkerObject,
    P: FrameProcessor + WorkerObject,
    D: FrameSink + WorkerObject,
    W: FrameSink + WorkerObject,
{
    pub fn new(
        pool: SharedBufferPool,
        camera: ProxyObject<C>,
        processor: ProxyObject<P>,
        display: ProxyObject<D>,
        storage: ProxyObject<W>,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            pool,
            camera: Arc::new(camera),
            processor: Arc::new(processor),
            display: Arc::new(display),
            storage: Arc::new(storage),
            stages: PipelineStages::new(),
            settings,
        }
    }

    /// The stage queues, exposed so callers can observe occupancy.
    pub fn stages(&self) -> &PipelineStages {
        &self.stages
    }

    /// Acquire and process `count` frames.
    ///
    /// Frames are launched in id order and the custody discipline keeps
    /// that order at every stage. Blocks until every frame has finished or
    /// failed; the first failure is returned after all threads are reaped.
    ///
    /// # Errors
    ///
    /// `ScopeError::Allocation` when no pool slot frees up within the
    /// device-ack timeout, or whatever a stage raised inside its worker.
    pub fn run_burst(&self, count: u64) -> CoreResult<PipelineReport> {
        info!(count, "starting burst");
        let mut threads = Vec::with_capacity(count as usize);
        for frame_id in 0..count {
            let slot = self.wait_for_slot()?;
            threads.push(self.launch_frame(frame_id, slot)?);
        }

        let mut first_error: Option<ScopeError> = None;
        for th in threads {
            if let Err(e) = th.result() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let report = self.report(count)?;
        info!(
            recorded = report.frames_recorded,
            stored = report.frames_stored,
            "burst complete"
        );
        Ok(report)
    }

    fn wait_for_slot(&self) -> CoreResult<usize> {
        let deadline = Instant::now() + self.settings.device_ack_timeout;
        loop {
            if let Some(slot) = self.pool.acquire_slot() {
                return Ok(slot);
            }
            if Instant::now() >= deadline {
                return Err(ScopeError::Allocation(format!(
                    "no free frame slot within {:?}",
                    self.settings.device_ack_timeout
                )));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn launch_frame(&self, frame_id: u64, slot: usize) -> CoreResult<CustodyThread<u64>> {
        let pool = self.pool.clone();
        let desc = pool.descriptor(slot);
        let camera = Arc::clone(&self.camera);
        let processor = Arc::clone(&self.processor);
        let display = Arc::clone(&self.display);
        let storage = Arc::clone(&self.storage);
        let cam_stage = Arc::clone(&self.stages.camera);
        let proc_stage = Arc::clone(&self.stages.processor);
        let disp_stage = Arc::clone(&self.stages.display);
        let store_stage = Arc::clone(&self.stages.storage);
        let first_stage = Arc::clone(&cam_stage);

        CustodyThread::spawn(
            &format!("frame-{frame_id}"),
            Some(&first_stage),
            move |custody| {
                let release_pool = pool.clone();

                let outcome = (|| -> CoreResult<()> {
                    // Camera: fill the slot.
                    custody.wait_in_line();
                    {
                        let pool = pool.clone();
                        let desc = desc.clone();
                        camera.call(move |cam| {
                            let handle = pool.attach(&desc)?;
                            let mut frame = handle.write();
                            cam.record(&mut frame, frame_id)
                        })?;
                    }
                    debug!(frame_id, slot, "frame recorded");

                    // Processor: transform in place.
                    custody.switch_from(Some(&cam_stage), Some(&proc_stage));
                    {
                        let pool = pool.clone();
                        let desc = desc.clone();
                        processor.call(move |proc| {
                            let handle = pool.attach(&desc)?;
                            let mut frame = handle.write();
                            proc.process(&mut frame)
                        })?;
                    }

                    // Display: read-only.
                    custody.switch_from(Some(&proc_stage), Some(&disp_stage));
                    {
                        let pool = pool.clone();
                        let desc = desc.clone();
                        display.call(move |disp| {
                            let handle = pool.attach(&desc)?;
                            let frame = handle.read();
                            disp.consume(&frame, frame_id)
                        })?;
                    }

                    // Storage: last ordered stage, then terminal handoff.
                    custody.switch_from(Some(&disp_stage), Some(&store_stage));
                    {
                        let pool = pool.clone();
                        let desc = desc.clone();
                        storage.call(move |store| {
                            let handle = pool.attach(&desc)?;
                            let frame = handle.read();
                            store.consume(&frame, frame_id)
                        })?;
                    }
                    custody.switch_from(Some(&store_stage), None);
                    Ok(())
                })();

                // The slot goes back to the free list on every exit path;
                // custody release is handled by the thread wrapper.
                release_pool.release_slot(slot);
                outcome.map(|()| frame_id)
            },
        )
    }

    fn report(&self, frames_requested: u64) -> CoreResult<PipelineReport> {
        let frames_recorded = self.camera.call(|cam| Ok(cam.frames_recorded()))?;
        let frames_displayed = self.display.call(|disp| Ok(disp.frames_consumed()))?;
        let frames_stored = self.storage.call(|store| Ok(store.frames_consumed()))?;
        Ok(PipelineReport {
            frames_requested,
            frames_recorded,
            frames_displayed,
            frames_stored,
        })
    }
}
