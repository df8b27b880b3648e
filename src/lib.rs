//! Concurrency core for multi-scale microscope acquisition.
//!
//! The crate provides the synchronization and pipeline machinery an
//! instrument-control application is built on, with hardware kept behind
//! narrow capability traits so everything runs identically against mocks:
//!
//! - [`buffer`]: pre-allocated shared frame-slot pool; descriptors travel,
//!   frames do not
//! - [`proxy`]: worker-owned hardware objects behind transparent call
//!   handles, with full error and panic fidelity across the seam
//! - [`custody`]: FIFO custody passing so every pipeline stage is touched
//!   by one frame at a time, in order, without a global lock
//! - [`pipeline`]: the per-frame camera → processor → display → storage
//!   walk built from the above
//! - [`feature`]: the two-thread signal/data acquisition engine and its
//!   stock features
//! - [`hardware`]: capability traits and mock devices
//! - [`config`] / [`telemetry`] / [`error`]: settings, tracing setup, and
//!   the error taxonomy
//!
//! # Quick start
//!
//! ```no_run
//! use scope_core::buffer::FrameDtype;
//! use scope_core::config::Settings;
//! use scope_core::proxy::ProxyManager;
//!
//! let settings = Settings::default();
//! let mut manager = ProxyManager::new(settings.worker.clone());
//! let pool = manager
//!     .allocate(&settings.pool.frame_shape, settings.pool.dtype, settings.pool.slot_count)
//!     .expect("pool allocation");
//! assert_eq!(pool.available(), settings.pool.slot_count);
//! ```

pub mod buffer;
pub mod config;
pub mod custody;
pub mod error;
pub mod feature;
pub mod hardware;
pub mod pipeline;
pub mod proxy;
pub mod telemetry;

pub use buffer::{BufferHandle, FrameDtype, SharedBufferPool, SlotDescriptor};
pub use config::Settings;
pub use custody::{Custody, CustodyThread, Resource};
pub use error::{CoreResult, RemoteError, ScopeError};
pub use feature::{FeatureContainer, FeatureSpec, StopHandle};
pub use pipeline::{AcquisitionPipeline, PipelineReport};
pub use proxy::{ProxyManager, ProxyObject, WorkerObject};
