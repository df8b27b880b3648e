//! Mock hardware implementations.
//!
//! Simulated devices for running and testing the pipeline without physical
//! hardware. Timing is realistic but compressed so the test suite stays
//! fast:
//!
//! - `MockCamera` - configurable readout time, random sensor noise
//! - `MockStage` - finite motion speed plus settling time
//! - `MockProcessor` - deterministic in-place transform
//! - `MockDisplay` / `MockWriter` - recording sinks (screen / disk)

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::{CameraDevice, FrameProcessor, FrameSink, StageMotion};
use crate::proxy::WorkerObject;

/// Simulated camera.
///
/// Fills frames with seeded sensor noise and stamps the frame id into the
/// first eight bytes, so tests can assert which frame ended up where. Can be
/// told to fail on a specific frame to exercise abort paths.
pub struct MockCamera {
    readout: Duration,
    rng: StdRng,
    frames: u64,
    fail_on_frame: Option<u64>,
}

impl MockCamera {
    pub fn new(readout: Duration) -> Self {
        Self {
            readout,
            rng: StdRng::seed_from_u64(0x5EED),
            frames: 0,
            fail_on_frame: None,
        }
    }

    /// Fail `record` when asked for this frame id.
    pub fn fail_on_frame(mut self, frame_id: u64) -> Self {
        self.fail_on_frame = Some(frame_id);
        self
    }
}

impl CameraDevice for MockCamera {
    fn record(&mut self, frame: &mut [u8], frame_id: u64) -> Result<()> {
        if self.fail_on_frame == Some(frame_id) {
            bail!("sensor readout failed on frame {frame_id}");
        }
        thread::sleep(self.readout);
        self.rng.fill(frame);
        if frame.len() >= 8 {
            frame[..8].copy_from_slice(&frame_id.to_le_bytes());
        }
        self.frames += 1;
        debug!(frame_id, "mock camera recorded frame");
        Ok(())
    }

    fn frames_recorded(&self) -> u64 {
        self.frames
    }
}

impl WorkerObject for MockCamera {
    fn close(&mut self) {
        debug!(frames = self.frames, "mock camera closed");
    }
}

/// Simulated motion stage with finite speed and settling time.
pub struct MockStage {
    position: f64,
    speed_per_ms: f64,
    settle: Duration,
}

impl MockStage {
    pub fn new() -> Self {
        Self {
            position: 0.0,
            speed_per_ms: 10.0,
            settle: Duration::from_millis(2),
        }
    }

    pub fn with_speed(mut self, units_per_ms: f64) -> Self {
        self.speed_per_ms = units_per_ms;
        self
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

impl StageMotion for MockStage {
    fn move_absolute(&mut self, position: f64) -> Result<()> {
        let distance = (position - self.position).abs();
        let travel = Duration::from_millis((distance / self.speed_per_ms) as u64);
        thread::sleep(travel + self.settle);
        self.position = position;
        debug!(position, "mock stage settled");
        Ok(())
    }

    fn position(&self) -> Result<f64> {
        Ok(self.position)
    }
}

impl WorkerObject for MockStage {
    fn close(&mut self) {
        debug!(position = self.position, "mock stage closed");
    }
}

/// Deterministic in-place transform (a stand-in for deconvolution).
///
/// Adds a constant offset to every byte, wrapping. Deterministic so tests
/// can compare a proxied run against a local run bit for bit.
pub struct MockProcessor {
    offset: u8,
    work: Duration,
}

impl MockProcessor {
    pub fn new(offset: u8, work: Duration) -> Self {
        Self { offset, work }
    }
}

impl FrameProcessor for MockProcessor {
    fn process(&mut self, frame: &mut [u8]) -> Result<()> {
        thread::sleep(self.work);
        for b in frame.iter_mut() {
            *b = b.wrapping_add(self.offset);
        }
        Ok(())
    }
}

impl WorkerObject for MockProcessor {}

/// Recording display sink. Remembers which frame ids it showed.
pub struct MockDisplay {
    shown: Vec<u64>,
    latency: Duration,
}

impl MockDisplay {
    pub fn new(latency: Duration) -> Self {
        Self {
            shown: Vec::new(),
            latency,
        }
    }

    /// Frame ids shown, in order.
    pub fn shown(&self) -> &[u64] {
        &self.shown
    }
}

impl FrameSink for MockDisplay {
    fn consume(&mut self, _frame: &[u8], frame_id: u64) -> Result<()> {
        thread::sleep(self.latency);
        self.shown.push(frame_id);
        Ok(())
    }

    fn frames_consumed(&self) -> u64 {
        self.shown.len() as u64
    }
}

impl WorkerObject for MockDisplay {}

/// Disk writer sink. Appends raw frames to a single file.
pub struct MockWriter {
    out: BufWriter<File>,
    written: u64,
}

impl MockWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            written: 0,
        })
    }
}

impl FrameSink for MockWriter {
    fn consume(&mut self, frame: &[u8], frame_id: u64) -> Result<()> {
        self.out.write_all(&frame_id.to_le_bytes())?;
        self.out.write_all(frame)?;
        self.written += 1;
        Ok(())
    }

    fn frames_consumed(&self) -> u64 {
        self.written
    }
}

impl WorkerObject for MockWriter {
    fn close(&mut self) {
        let _ = self.out.flush();
        debug!(frames = self.written, "mock writer flushed and closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_stamps_frame_id() {
        let mut camera = MockCamera::new(Duration::ZERO);
        let mut frame = vec![0u8; 64];
        camera.record(&mut frame, 42).expect("record");
        assert_eq!(u64::from_le_bytes(frame[..8].try_into().expect("8 bytes")), 42);
        assert_eq!(camera.frames_recorded(), 1);
    }

    #[test]
    fn test_camera_injected_failure() {
        let mut camera = MockCamera::new(Duration::ZERO).fail_on_frame(3);
        let mut frame = vec![0u8; 16];
        camera.record(&mut frame, 2).expect("record");
        assert!(camera.record(&mut frame, 3).is_err());
    }

    #[test]
    fn test_processor_is_deterministic() {
        let mut a = MockProcessor::new(7, Duration::ZERO);
        let mut b = MockProcessor::new(7, Duration::ZERO);
        let mut one = vec![1u8, 250, 3];
        let mut two = one.clone();
        a.process(&mut one).expect("process");
        b.process(&mut two).expect("process");
        assert_eq!(one, two);
        assert_eq!(one, vec![8, 1, 10]);
    }

    #[test]
    fn test_stage_moves_and_settles() {
        let mut stage = MockStage::new().with_speed(1000.0);
        stage.move_absolute(50.0).expect("move");
        assert!((stage.position().expect("position") - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_writer_appends_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stack.raw");
        {
            let mut writer = MockWriter::create(&path).expect("create");
            writer.consume(&[1, 2, 3, 4], 0).expect("write");
            writer.consume(&[5, 6, 7, 8], 1).expect("write");
            assert_eq!(writer.frames_consumed(), 2);
            writer.close();
        }
        let bytes = std::fs::read(&path).expect("read back");
        assert_eq!(bytes.len(), 2 * (8 + 4));
    }
}
