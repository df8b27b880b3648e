//! Signal/data walk containers and the two-thread execution engine.
//!
//! [`load_features`] turns an ordered (possibly grouped) feature list into
//! two node arenas: one for the signal walk, one for the data walk.
//! [`SignalContainer`] and [`DataContainer`] advance through their arenas
//! one engine step at a time, pausing at device boundaries and closed-loop
//! rendezvous points. [`FeatureContainer`] runs the two walks on two
//! threads, connected by a bounded frame-id handoff queue (strict FIFO) and
//! a response channel for closed-loop features.
//!
//! Failure policy (single surfaced error):
//! - a signal-side failure aborts the run and is returned to the caller;
//! - a data-side failure on a one-step, non-response node fails soft: the
//!   node is cleaned up, marked, and skipped for the rest of the run;
//! - any other data-side failure aborts the run;
//! - cancellation via [`StopHandle::stop`] interrupts both threads within
//!   a bounded time and surfaces as `ScopeError::Aborted`.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::node::{DataNode, FeatureSpec, SignalNode};
use crate::config::AcquisitionSettings;
use crate::error::{CoreResult, ScopeError};

/// Poll interval for stop-flag checks while blocked on a channel.
const STOP_POLL: Duration = Duration::from_millis(10);

/// Build the signal and data walks from a grouped feature list.
///
/// Within a group, nodes are siblings and run in sequence; the first node
/// of the next group is the `child` of the previous group's last node and
/// is entered only when that node's `main` reported success.
pub fn load_features(
    groups: Vec<Vec<FeatureSpec>>,
    number_of_executions: u32,
) -> (SignalContainer, DataContainer) {
    let mut signal_nodes: Vec<SignalNode> = Vec::new();
    let mut data_nodes: Vec<DataNode> = Vec::new();

    let mut prev: Option<usize> = None;
    for group in groups {
        for (i, spec) in group.into_iter().enumerate() {
            let config = spec.normalized_config();
            let idx = signal_nodes.len();
            signal_nodes.push(SignalNode::new(spec.name.clone(), config, spec.signal));
            data_nodes.push(DataNode::new(spec.name, config, spec.data));

            if let Some(p) = prev {
                if i == 0 {
                    signal_nodes[p].child = Some(idx);
                    data_nodes[p].child = Some(idx);
                } else {
                    signal_nodes[p].sibling = Some(idx);
                    data_nodes[p].sibling = Some(idx);
                }
            }
            prev = Some(idx);
        }
    }

    let root = if signal_nodes.is_empty() { None } else { Some(0) };
    (
        SignalContainer::new(signal_nodes, root, number_of_executions),
        DataContainer::new(data_nodes, root),
    )
}

/// Why the signal walk handed control back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPause {
    /// Reached the end of a pass (or the whole sequence).
    PassComplete,
    /// Stopped before a device-related node; hardware must complete first.
    DeviceBoundary,
    /// A closed-loop node ran `main` and awaits the data-side response.
    NeedResponse,
}

/// The signal-side walk over the feature arena.
pub struct SignalContainer {
    nodes: Vec<SignalNode>,
    root: Option<usize>,
    curr: Option<usize>,
    pub(crate) end_flag: bool,
    remaining_executions: u32,
}

impl SignalContainer {
    fn new(nodes: Vec<SignalNode>, root: Option<usize>, number_of_executions: u32) -> Self {
        Self {
            nodes,
            root,
            curr: None,
            end_flag: root.is_none(),
            remaining_executions: number_of_executions,
        }
    }

    /// Run cleanup hooks of every node that declared one.
    pub fn cleanup(&mut self) {
        for node in self.nodes.iter_mut().filter(|n| n.has_cleanup) {
            node.cleanup();
        }
    }

    /// Advance the walk by one engine step.
    ///
    /// `response` carries the data-side value for a closed-loop node;
    /// `wait_response` selects the response pass. On error the container
    /// runs its cleanup hooks, raises its end flag, and propagates.
    pub fn run(
        &mut self,
        response: Option<f64>,
        wait_response: bool,
    ) -> CoreResult<SignalPause> {
        if self.end_flag || self.root.is_none() {
            self.end_flag = true;
            return Ok(SignalPause::PassComplete);
        }
        if self.curr.is_none() {
            self.curr = self.root;
        }
        let mut response = response;

        while let Some(idx) = self.curr {
            debug!(node = %self.nodes[idx].name, "running signal node");
            let (result, is_end) = match self.nodes[idx].run(response.take(), wait_response) {
                Ok(step) => step,
                Err(e) => {
                    warn!(node = %self.nodes[idx].name, error = %e, "signal node failed");
                    self.end_flag = true;
                    self.cleanup();
                    return Err(ScopeError::Remote(crate::error::RemoteError::capture(
                        format!("signal node '{}'", self.nodes[idx].name),
                        format!("{e:#}"),
                    )));
                }
            };
            if !is_end {
                if self.nodes[idx].wait_response {
                    return Ok(SignalPause::NeedResponse);
                }
                return Ok(SignalPause::DeviceBoundary);
            }

            if let Some(sibling) = self.nodes[idx].sibling {
                self.curr = Some(sibling);
            } else if result && self.nodes[idx].child.is_some() {
                self.curr = self.nodes[idx].child;
            } else {
                self.curr = None;
                if self.remaining_executions > 0 {
                    self.remaining_executions -= 1;
                    self.end_flag = self.remaining_executions == 0;
                }
                return Ok(SignalPause::PassComplete);
            }

            if let Some(next) = self.curr {
                if self.nodes[next].config.device_related {
                    return Ok(SignalPause::DeviceBoundary);
                }
            }
        }
        Ok(SignalPause::PassComplete)
    }
}

/// The data-side walk over the feature arena.
pub struct DataContainer {
    nodes: Vec<DataNode>,
    root: Option<usize>,
    curr: Option<usize>,
    pub(crate) end_flag: bool,
}

impl DataContainer {
    fn new(nodes: Vec<DataNode>, root: Option<usize>) -> Self {
        Self {
            nodes,
            root,
            curr: None,
            end_flag: false,
        }
    }

    /// Run cleanup hooks of every node that declared one.
    pub fn cleanup(&mut self) {
        for node in self.nodes.iter_mut().filter(|n| n.has_cleanup) {
            node.cleanup();
        }
    }

    /// Feed one batch of frame ids to the walk.
    ///
    /// Returns the response value when a closed-loop node produced one.
    /// One-step, non-response nodes fail soft (cleaned up, marked,
    /// skipped); any other failure raises the end flag and propagates.
    pub fn run(&mut self, frames: &[u64]) -> CoreResult<Option<f64>> {
        if self.end_flag || self.root.is_none() {
            return Ok(None);
        }
        if self.curr.is_none() {
            self.curr = self.root;
        }
        let mut returned_response: Option<f64> = None;

        while let Some(idx) = self.curr {
            let (outcome, is_end) = match self.nodes[idx].run(frames) {
                Ok(step) => step,
                Err(e) => {
                    let node = &mut self.nodes[idx];
                    if !node.config.need_response
                        && node.config.kind == super::node::NodeKind::OneStep
                    {
                        // Fail soft: skip this node for the rest of the run.
                        warn!(node = %node.name, error = %e, "data node failed; skipping");
                        node.cleanup();
                        node.marked = true;
                        (Default::default(), true)
                    } else {
                        // A stuck closed loop would hang the signal thread;
                        // terminating the container drops the response
                        // channel, which unblocks it.
                        warn!(node = %node.name, error = %e, "data node failed; aborting");
                        self.end_flag = true;
                        self.cleanup();
                        return Err(ScopeError::Remote(crate::error::RemoteError::capture(
                            format!("data node '{}'", self.nodes[idx].name),
                            format!("{e:#}"),
                        )));
                    }
                }
            };
            if !is_end {
                return Ok(returned_response);
            }
            if self.nodes[idx].config.need_response {
                returned_response = outcome.response.or(Some(f64::default()));
            }

            if let Some(sibling) = self.nodes[idx].sibling {
                self.curr = Some(sibling);
            } else if outcome.result && self.nodes[idx].child.is_some() {
                self.curr = self.nodes[idx].child;
            } else {
                self.curr = None;
                return Ok(returned_response);
            }

            if let Some(next) = self.curr {
                let next = &self.nodes[next];
                if next.config.device_related
                    || (next.config.need_response && returned_response.is_some())
                {
                    return Ok(returned_response);
                }
            }
        }
        Ok(returned_response)
    }
}

enum HandoffMsg {
    Frames(Vec<u64>),
    Stop,
}

/// Cooperative cancellation handle for a running [`FeatureContainer`].
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request both walk threads to unwind. Observed within a bounded time.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed acquisition run.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionSummary {
    /// Signal passes completed.
    pub passes: u64,
    /// Frame ids produced and handed to the data walk.
    pub frames_produced: u64,
    /// Closed-loop responses delivered back to the signal walk.
    pub responses: u64,
}

/// The two-thread acquisition engine.
///
/// Owns the signal and data walks and the channels between them. `run`
/// consumes the container; obtain a [`StopHandle`] first if cancellation
/// is needed.
pub struct FeatureContainer {
    signal: SignalContainer,
    data: DataContainer,
    settings: AcquisitionSettings,
    stop: Arc<AtomicBool>,
}

impl FeatureContainer {
    /// Build the engine from a grouped feature list.
    pub fn new(
        groups: Vec<Vec<FeatureSpec>>,
        number_of_executions: u32,
        settings: AcquisitionSettings,
    ) -> Self {
        let (signal, data) = load_features(groups, number_of_executions);
        Self {
            signal,
            data,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for cancelling the run from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run the acquisition to completion.
    ///
    /// `frame_source` is invoked once per signal pass with the pass index
    /// and must produce the frame ids that pass generated (the camera
    /// snap). It runs on a dedicated thread so a device that never
    /// acknowledges cannot wedge the signal walk; frame ids reach the data
    /// walk in production order through a bounded FIFO queue.
    ///
    /// # Errors
    ///
    /// The first failure from either walk, `ScopeError::Aborted` on
    /// cancellation, or `ScopeError::HardwareTimeout` when a device-related
    /// boundary is not acknowledged within the device-ack timeout.
    pub fn run<F>(mut self, frame_source: F) -> CoreResult<AcquisitionSummary>
    where
        F: FnMut(u64) -> CoreResult<Vec<u64>> + Send + 'static,
    {
        let (handoff_tx, handoff_rx) = bounded::<HandoffMsg>(self.settings.handoff_depth);
        let (response_tx, response_rx) = bounded::<f64>(1);
        let stop = Arc::clone(&self.stop);

        let mut data = std::mem::replace(
            &mut self.data,
            DataContainer::new(Vec::new(), None),
        );
        let data_stop = Arc::clone(&stop);
        let data_thread = thread::Builder::new()
            .name("data".to_string())
            .spawn(move || data_walk(&mut data, handoff_rx, response_tx, data_stop))
            .map_err(|e| ScopeError::Allocation(format!("failed to spawn data thread: {e}")))?;

        // The snap thread owns the frame source. One request is in flight
        // at a time, so replies arrive in pass order. It drains on its own
        // once the request channel disconnects; a source stuck in hardware
        // is abandoned rather than joined.
        let (snap_req_tx, snap_req_rx) = bounded::<u64>(1);
        let (snap_rep_tx, snap_rep_rx) = bounded::<CoreResult<Vec<u64>>>(1);
        thread::Builder::new()
            .name("snap".to_string())
            .spawn(move || {
                let mut frame_source = frame_source;
                while let Ok(pass) = snap_req_rx.recv() {
                    if snap_rep_tx.send(frame_source(pass)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| ScopeError::Allocation(format!("failed to spawn snap thread: {e}")))?;

        let signal_result = self.signal_walk(&snap_req_tx, &snap_rep_rx, &handoff_tx, &response_rx);
        if signal_result.is_err() {
            stop.store(true, Ordering::SeqCst);
        }
        drop(snap_req_tx);

        // Always wake the data thread, whatever happened on the signal side.
        // A blocking send is safe: the data thread either drains the queue
        // or exits, which disconnects the channel.
        let _ = handoff_tx.send(HandoffMsg::Stop);
        drop(handoff_tx);
        let data_result = match data_thread.join() {
            Ok(result) => result,
            Err(_) => Err(ScopeError::Aborted("data thread panicked".into())),
        };

        match (signal_result, data_result) {
            (Ok(mut summary), Ok(consumed)) => {
                summary.frames_produced = summary.frames_produced.max(consumed);
                info!(
                    passes = summary.passes,
                    frames = summary.frames_produced,
                    "acquisition complete"
                );
                Ok(summary)
            }
            // When both walks fail, one of them is usually the secondary
            // abort raised by the stop flag; surface the side that failed
            // first.
            (Err(signal_err), Err(data_err)) => {
                if matches!(signal_err, ScopeError::Aborted(_))
                    && !matches!(data_err, ScopeError::Aborted(_))
                {
                    Err(data_err)
                } else {
                    Err(signal_err)
                }
            }
            (Err(signal_err), Ok(_)) => Err(signal_err),
            (Ok(_), Err(data_err)) => Err(data_err),
        }
    }

    fn signal_walk(
        &mut self,
        snap_req_tx: &Sender<u64>,
        snap_rep_rx: &Receiver<CoreResult<Vec<u64>>>,
        handoff_tx: &Sender<HandoffMsg>,
        response_rx: &Receiver<f64>,
    ) -> CoreResult<AcquisitionSummary> {
        let mut summary = AcquisitionSummary::default();

        while !self.signal.end_flag {
            self.check_stop()?;

            let pause = match self.signal.run(None, false) {
                Ok(pause) => pause,
                Err(e) => {
                    self.stop.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            };

            // Hardware produces the frames for this step; production is
            // also the completion acknowledgement for a device boundary.
            let ids = self.request_frames(snap_req_tx, snap_rep_rx, summary.passes, pause)?;
            if !ids.is_empty() {
                summary.frames_produced += ids.len() as u64;
                self.send_frames(handoff_tx, ids)?;
            }

            if pause == SignalPause::NeedResponse {
                let value = self.wait_for_response(response_rx)?;
                summary.responses += 1;
                match self.signal.run(Some(value), true) {
                    Ok(SignalPause::PassComplete) => summary.passes += 1,
                    Ok(_) => {}
                    Err(e) => {
                        self.stop.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
            if pause == SignalPause::PassComplete {
                summary.passes += 1;
            }
        }
        self.signal.cleanup();
        Ok(summary)
    }

    /// Ask the snap thread for this step's frames.
    ///
    /// Device boundaries are bounded by the device-ack timeout; every wait
    /// stays responsive to [`StopHandle::stop`].
    fn request_frames(
        &self,
        tx: &Sender<u64>,
        rx: &Receiver<CoreResult<Vec<u64>>>,
        pass: u64,
        pause: SignalPause,
    ) -> CoreResult<Vec<u64>> {
        if tx.send(pass).is_err() {
            return Err(ScopeError::Aborted("frame source terminated".into()));
        }
        let deadline = (pause == SignalPause::DeviceBoundary)
            .then(|| Instant::now() + self.settings.device_ack_timeout);
        loop {
            self.check_stop()?;
            match rx.recv_timeout(STOP_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        self.stop.store(true, Ordering::SeqCst);
                        return Err(ScopeError::HardwareTimeout {
                            device: "frame source".into(),
                            waited: self.settings.device_ack_timeout,
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ScopeError::Aborted("frame source terminated".into()));
                }
            }
        }
    }

    fn send_frames(&self, tx: &Sender<HandoffMsg>, ids: Vec<u64>) -> CoreResult<()> {
        let mut msg = HandoffMsg::Frames(ids);
        loop {
            self.check_stop()?;
            match tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    msg = back;
                    thread::sleep(STOP_POLL);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(ScopeError::Aborted("data thread terminated".into()));
                }
            }
        }
    }

    fn wait_for_response(&self, rx: &Receiver<f64>) -> CoreResult<f64> {
        let deadline = Instant::now() + self.settings.response_timeout;
        loop {
            self.check_stop()?;
            match rx.recv_timeout(STOP_POLL) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Err(ScopeError::Aborted(format!(
                            "no data-side response within {:?}",
                            self.settings.response_timeout
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ScopeError::Aborted("data thread terminated".into()));
                }
            }
        }
    }

    fn check_stop(&self) -> CoreResult<()> {
        if self.stop.load(Ordering::SeqCst) {
            Err(ScopeError::Aborted("stop requested".into()))
        } else {
            Ok(())
        }
    }
}

fn data_walk(
    data: &mut DataContainer,
    handoff_rx: Receiver<HandoffMsg>,
    response_tx: Sender<f64>,
    stop: Arc<AtomicBool>,
) -> CoreResult<u64> {
    let mut consumed: u64 = 0;
    let result: CoreResult<u64> = loop {
        if stop.load(Ordering::SeqCst) {
            break Err(ScopeError::Aborted("stop requested".into()));
        }
        match handoff_rx.recv_timeout(STOP_POLL) {
            Ok(HandoffMsg::Frames(ids)) => {
                consumed += ids.len() as u64;
                match data.run(&ids) {
                    Ok(Some(value)) => {
                        // Closed-loop answer for the signal thread. The
                        // rendezvous slot holds one value; if the signal
                        // side already gave up, that is its error to report.
                        let _ = response_tx.try_send(value);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stop.store(true, Ordering::SeqCst);
                        break Err(e);
                    }
                }
                if data.end_flag {
                    break Ok(consumed);
                }
            }
            Ok(HandoffMsg::Stop) => break Ok(consumed),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break Ok(consumed),
        }
    };
    data.cleanup();
    result
}
