//! Feature-walk acquisition engine.
//!
//! An acquisition is described as an ordered list of features. Each feature
//! contributes a signal-side node (drives hardware) and a data-side node
//! (consumes the frames), and the engine runs the two walks on dedicated
//! threads with frames flowing between them through a bounded FIFO queue.
//!
//! - [`node`]: the per-feature behavior bundles and walk nodes
//! - [`container`]: the walk containers and the two-thread engine
//! - [`common`]: stock features (stack sweep, focus search, recorder)

pub mod common;
pub mod container;
pub mod node;

pub use container::{
    load_features, AcquisitionSummary, DataContainer, FeatureContainer, SignalContainer,
    SignalPause, StopHandle,
};
pub use node::{
    DataFuncs, DataOutcome, FeatureSpec, NodeConfig, NodeKind, SignalFuncs,
};
