//! Signal- and data-side nodes of an acquisition feature walk.
//!
//! A feature contributes one node to each of the two walks the engine runs:
//! the signal walk (drives hardware) and the data walk (consumes the frames
//! the hardware produced). Each node bundles the feature's behavior as
//! closures (init / main / end, plus the optional response and cleanup
//! hooks) and the flags that shape how the engine advances past it.
//!
//! Nodes are linked child/sibling inside an arena owned by the containers:
//! siblings run in sequence within a feature group, and the `child` link
//! continues to the next group when a node's `main` reported success.

use anyhow::Result;

/// Behavior closure types. All run on the engine's threads, so `Send`.
pub type InitFn = Box<dyn FnMut() -> Result<()> + Send>;
pub type EndFn = Box<dyn FnMut() -> bool + Send>;
pub type CleanupFn = Box<dyn FnMut() + Send>;
/// Signal `main`; receives the data-side response when the previous
/// closed-loop pass produced one. Returns whether the step succeeded.
pub type SignalMainFn = Box<dyn FnMut(Option<f64>) -> Result<bool> + Send>;
/// Signal `main-response`; receives the data-side response value.
pub type ResponseFn = Box<dyn FnMut(f64) -> Result<bool> + Send>;
/// Data-side frame filter; false means "not the frame this node wants".
pub type PreMainFn = Box<dyn FnMut(&[u64]) -> bool + Send>;
/// Data `main`; consumes frame ids, optionally produces a response value
/// for the signal side's closed loop.
pub type DataMainFn = Box<dyn FnMut(&[u64]) -> Result<DataOutcome> + Send>;

/// What a data-side `main` produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataOutcome {
    /// Step success, used for child-branch traversal.
    pub result: bool,
    /// Response value for a closed-loop (wait-response) feature.
    pub response: Option<f64>,
}

impl DataOutcome {
    pub fn ok() -> Self {
        Self {
            result: true,
            response: None,
        }
    }

    pub fn with_response(value: f64) -> Self {
        Self {
            result: true,
            response: Some(value),
        }
    }
}

/// How many `main` passes a node takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeKind {
    /// `main` runs once per activation.
    #[default]
    OneStep,
    /// `main` repeats until `end()` reports true (e.g. a stack sweep).
    MultiStep,
}

/// Per-node flags, normally derived from the feature definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeConfig {
    pub kind: NodeKind,
    /// Progression past `main` waits for a hardware-completion signal.
    pub device_related: bool,
    /// The signal walk blocks until the data walk responds for this node.
    pub need_response: bool,
}

/// Signal-side behavior bundle.
#[derive(Default)]
pub struct SignalFuncs {
    pub init: Option<InitFn>,
    pub main: Option<SignalMainFn>,
    pub main_response: Option<ResponseFn>,
    pub end: Option<EndFn>,
    pub cleanup: Option<CleanupFn>,
}

/// Data-side behavior bundle.
#[derive(Default)]
pub struct DataFuncs {
    pub init: Option<InitFn>,
    pub pre_main: Option<PreMainFn>,
    pub main: Option<DataMainFn>,
    pub end: Option<EndFn>,
    pub cleanup: Option<CleanupFn>,
}

/// Everything a feature contributes to the walk.
pub struct FeatureSpec {
    pub name: String,
    pub config: NodeConfig,
    pub signal: SignalFuncs,
    pub data: DataFuncs,
}

impl FeatureSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: NodeConfig::default(),
            signal: SignalFuncs::default(),
            data: DataFuncs::default(),
        }
    }

    /// Normalize flags the way the engine requires: a response hook implies
    /// `need_response`, and multi-step nodes are always device-related.
    pub(crate) fn normalized_config(&self) -> NodeConfig {
        let mut config = self.config;
        if self.signal.main_response.is_some() {
            config.need_response = true;
        }
        if config.kind == NodeKind::MultiStep {
            config.device_related = true;
        }
        config
    }
}

/// One node of the signal walk.
pub struct SignalNode {
    pub(crate) name: String,
    pub(crate) config: NodeConfig,
    funcs: SignalFuncs,
    initialized: bool,
    /// Set after `main` on a need-response node; cleared by the response
    /// pass.
    pub(crate) wait_response: bool,
    pub(crate) child: Option<usize>,
    pub(crate) sibling: Option<usize>,
    pub(crate) has_cleanup: bool,
}

impl SignalNode {
    pub(crate) fn new(name: String, config: NodeConfig, funcs: SignalFuncs) -> Self {
        let has_cleanup = funcs.cleanup.is_some();
        Self {
            name,
            config,
            funcs,
            initialized: false,
            wait_response: false,
            child: None,
            sibling: None,
            has_cleanup,
        }
    }

    /// Advance this node by one engine step.
    ///
    /// Returns `(result, is_end)`: `result` feeds child-branch traversal,
    /// `is_end` tells the container to move on. `wait_response` selects the
    /// response pass of a closed-loop node.
    pub(crate) fn run(
        &mut self,
        response: Option<f64>,
        wait_response: bool,
    ) -> Result<(bool, bool)> {
        if !self.initialized {
            if let Some(init) = self.funcs.init.as_mut() {
                init()?;
            }
            self.initialized = true;
        }

        let result;
        if !wait_response {
            result = match self.funcs.main.as_mut() {
                Some(main) => main(response)?,
                None => true,
            };
            if self.config.need_response {
                self.wait_response = true;
                return Ok((result, false));
            }
        } else if self.wait_response {
            let value = response.unwrap_or_default();
            result = match self.funcs.main_response.as_mut() {
                Some(hook) => hook(value)?,
                None => true,
            };
            self.wait_response = false;
        } else if self.config.device_related || self.config.need_response {
            return Ok((false, false));
        } else {
            result = match self.funcs.main.as_mut() {
                Some(main) => main(response)?,
                None => true,
            };
        }

        let ended = match self.funcs.end.as_mut() {
            Some(end) => end(),
            None => true,
        };
        if self.wait_response || (self.config.kind == NodeKind::MultiStep && !ended) {
            return Ok((result, false));
        }

        // Node completed; re-arm init for the next activation.
        self.initialized = false;
        Ok((result, true))
    }

    pub(crate) fn cleanup(&mut self) {
        if let Some(cleanup) = self.funcs.cleanup.as_mut() {
            cleanup();
        }
    }
}

/// One node of the data walk.
pub struct DataNode {
    pub(crate) name: String,
    pub(crate) config: NodeConfig,
    funcs: DataFuncs,
    initialized: bool,
    /// A soft-failed node is marked and skipped for the rest of the run.
    pub(crate) marked: bool,
    pub(crate) child: Option<usize>,
    pub(crate) sibling: Option<usize>,
    pub(crate) has_cleanup: bool,
}

impl DataNode {
    pub(crate) fn new(name: String, config: NodeConfig, funcs: DataFuncs) -> Self {
        let has_cleanup = funcs.cleanup.is_some();
        Self {
            name,
            config,
            funcs,
            initialized: false,
            marked: false,
            child: None,
            sibling: None,
            has_cleanup,
        }
    }

    /// Feed frames to this node.
    ///
    /// Returns `(outcome, is_end)`. A marked node reports completion
    /// without running anything.
    pub(crate) fn run(&mut self, frames: &[u64]) -> Result<(DataOutcome, bool)> {
        if self.marked {
            return Ok((DataOutcome::default(), true));
        }

        if !self.initialized {
            if let Some(init) = self.funcs.init.as_mut() {
                init()?;
            }
            self.initialized = true;
        }

        // Not the frame this node is waiting for.
        let wanted = match self.funcs.pre_main.as_mut() {
            Some(pre) => pre(frames),
            None => true,
        };
        if !wanted {
            return Ok((DataOutcome::default(), false));
        }

        let outcome = match self.funcs.main.as_mut() {
            Some(main) => main(frames)?,
            None => DataOutcome::ok(),
        };

        let ended = match self.funcs.end.as_mut() {
            Some(end) => end(),
            None => true,
        };
        if self.config.kind == NodeKind::MultiStep && !ended {
            return Ok((outcome, false));
        }

        self.initialized = false;
        Ok((outcome, true))
    }

    pub(crate) fn cleanup(&mut self) {
        if let Some(cleanup) = self.funcs.cleanup.as_mut() {
            cleanup();
        }
    }
}
