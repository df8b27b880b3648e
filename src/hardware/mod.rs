//! Hardware capability traits.
//!
//! The core consumes hardware through narrow, synchronous capability traits
//! and never sees protocol details. A device implements the capabilities it
//! actually has:
//!
//! - a camera implements [`CameraDevice`]
//! - a stage implements [`StageMotion`]
//! - an image processor implements [`FrameProcessor`]
//! - a display or disk writer implements [`FrameSink`]
//!
//! All methods take `&mut self`: a device instance is owned by exactly one
//! worker (see [`crate::proxy`]), so interior locking is unnecessary by
//! construction. Errors cross the seam as `anyhow::Result`; the proxy layer
//! converts them into structured remote errors at the worker boundary.
//!
//! Frames are passed as raw byte slices of the pool's fixed slot geometry;
//! interpretation (shape, dtype) is carried by the slot descriptor, not the
//! device.

pub mod mock;

use anyhow::Result;

/// Capability: frame acquisition.
///
/// # Contract
/// - `record` fills `frame` completely and blocks until readout finishes
/// - `frame_id` is assigned by the caller and is strictly increasing
pub trait CameraDevice: Send {
    /// Expose and read out one frame into `frame`.
    fn record(&mut self, frame: &mut [u8], frame_id: u64) -> Result<()>;

    /// Number of frames recorded so far.
    fn frames_recorded(&self) -> u64;
}

/// Capability: motion control.
///
/// Positions are in device-native units (micrometres for the mocks).
pub trait StageMotion: Send {
    /// Move to an absolute position, blocking until motion completes.
    fn move_absolute(&mut self, position: f64) -> Result<()>;

    /// Current position (exact once settled).
    fn position(&self) -> Result<f64>;
}

/// Capability: in-place frame processing.
pub trait FrameProcessor: Send {
    /// Transform `frame` in place.
    fn process(&mut self, frame: &mut [u8]) -> Result<()>;
}

/// Capability: frame consumption (display, disk, network).
///
/// A sink never mutates the frame; it is the terminal read-only stage.
pub trait FrameSink: Send {
    /// Consume one frame.
    fn consume(&mut self, frame: &[u8], frame_id: u64) -> Result<()>;

    /// Number of frames consumed so far.
    fn frames_consumed(&self) -> u64;
}
