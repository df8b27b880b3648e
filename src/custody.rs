//! Custody-passing synchronization for one-thread-at-a-time pipeline stages.
//!
//! A multi-scale acquisition pipeline (camera → processor → display →
//! storage) wants every stage busy at once, but any single stage touched by
//! exactly one frame at a time. This module provides that contract:
//!
//! - [`Resource`]: a named FIFO wait queue, one per pipeline stage. At any
//!   instant a resource has at most one holder, and waiters are granted the
//!   resource strictly in arrival order, with no bypassing and no starvation.
//! - [`Custody`]: the token a thread carries through the pipeline.
//!   [`Custody::switch_from`] atomically leaves the current stage (waking
//!   the next waiter) and lines up for the next one, blocking until granted.
//!   Passing `None` as the destination is the terminal handoff, e.g. before
//!   disk I/O that needs no further ordering.
//! - [`CustodyThread`]: a thread wrapper that hands its task a fresh
//!   `Custody` already enqueued on the first stage, captures the task's
//!   result or panic, and guarantees the token is released on every exit
//!   path. [`CustodyThread::result`] blocks and re-raises.
//!
//! Threads must line up for stages in pipeline order; there is no deadlock
//! detector. Two pipelines requesting the same resources in reverse order
//! can deadlock, exactly as with any lock ordering discipline.
//!
//! # Example
//!
//! ```rust
//! use scope_core::custody::{CustodyThread, Resource};
//!
//! let camera = Resource::new("camera");
//! let display = Resource::new("display");
//!
//! let mut threads = Vec::new();
//! for frame in 0..4u64 {
//!     let camera = camera.clone();
//!     let display = display.clone();
//!     threads.push(
//!         CustodyThread::spawn("frame", Some(&camera.clone()), move |custody| {
//!             custody.wait_in_line();
//!             // ... record into the frame slot while holding "camera" ...
//!             custody.switch_from(Some(&camera), Some(&display));
//!             // ... show the frame while holding "display" ...
//!             custody.switch_from(Some(&display), None);
//!             Ok(frame)
//!         })
//!         .expect("spawn"),
//!     );
//! }
//! for th in threads {
//!     th.result().expect("frame pipeline failed");
//! }
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{panic_message, CoreResult, RemoteError, ScopeError};

/// Tickets are process-global so a custody token can move between resources.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// A named mutual-exclusion queue for one pipeline stage.
///
/// Invariants:
/// - at most one holder at any instant (the front of the queue, once its
///   thread has observed the grant);
/// - grants happen strictly in arrival order.
pub struct Resource {
    name: String,
    queue: Mutex<VecDeque<u64>>,
    granted: Condvar,
}

impl Resource {
    /// Create a resource named after the stage it serializes.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            granted: Condvar::new(),
        })
    }

    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tickets currently queued (holder included).
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn enqueue(&self, ticket: u64) {
        let mut q = self.queue.lock();
        if !q.contains(&ticket) {
            q.push_back(ticket);
        }
    }

    /// Remove `ticket` wherever it is in line and wake whoever is now front.
    fn remove(&self, ticket: u64) {
        let mut q = self.queue.lock();
        q.retain(|&t| t != ticket);
        if !q.is_empty() {
            self.granted.notify_all();
        }
    }

    /// Block until `ticket` is at the front of the queue.
    ///
    /// Returns `false` on deadline expiry (the ticket is left in line; the
    /// caller is responsible for removing it).
    fn wait_until_front(&self, ticket: u64, deadline: Option<Instant>) -> bool {
        let mut q = self.queue.lock();
        while q.front() != Some(&ticket) {
            match deadline {
                Some(d) => {
                    if self.granted.wait_until(&mut q, d).timed_out() {
                        return q.front() == Some(&ticket);
                    }
                }
                None => self.granted.wait(&mut q),
            }
        }
        true
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

/// A thread's claim on (at most) one pipeline stage.
///
/// The token names the resource it currently holds or waits for. It is
/// released on drop, so a task that errors out or panics can never leave a
/// stage permanently held.
pub struct Custody {
    ticket: u64,
    has_custody: bool,
    target: Option<Arc<Resource>>,
}

impl Custody {
    /// Fresh token holding nothing.
    pub fn new() -> Self {
        Self {
            ticket: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            has_custody: false,
            target: None,
        }
    }

    /// True once the token is the registered holder of its target resource.
    pub fn has_custody(&self) -> bool {
        self.has_custody
    }

    /// The resource this token currently holds or waits for.
    pub fn target(&self) -> Option<&Arc<Resource>> {
        self.target.as_ref()
    }

    /// Get in line for `to` without waiting.
    ///
    /// Used by [`CustodyThread::spawn`] so that launch order decides queue
    /// order while the waiting happens on the launched thread.
    pub fn enqueue(&mut self, to: &Arc<Resource>) {
        to.enqueue(self.ticket);
        self.has_custody = false;
        self.target = Some(Arc::clone(to));
    }

    /// Block until this token is granted its target resource.
    ///
    /// No-op when the token already has custody or has no target.
    pub fn wait_in_line(&mut self) {
        if self.has_custody {
            return;
        }
        if let Some(target) = self.target.clone() {
            target.wait_until_front(self.ticket, None);
            self.has_custody = true;
            trace!(resource = target.name(), "custody granted");
        }
    }

    /// Atomically leave `from` and line up for (then wait on) `to`.
    ///
    /// The token first joins `to`'s queue, then leaves `from`'s queue and
    /// wakes the next waiter, then blocks until granted `to`. The only
    /// instant it occupies two queues is the crossover itself, so pipeline
    /// order is preserved end to end.
    ///
    /// `to = None` releases without reacquiring (terminal handoff).
    ///
    /// # Panics
    ///
    /// Debug builds assert that `from` matches the currently held resource.
    pub fn switch_from(&mut self, from: Option<&Arc<Resource>>, to: Option<&Arc<Resource>>) {
        self.crossover(from, to);
        self.wait_in_line();
    }

    /// [`Custody::switch_from`] with a bound on the wait for `to`.
    ///
    /// On timeout the token is removed from `to`'s queue (no residue) and
    /// `ScopeError::CustodyTimeout` is returned. `from` has already been
    /// released by then; the caller holds nothing.
    pub fn switch_from_timeout(
        &mut self,
        from: Option<&Arc<Resource>>,
        to: Option<&Arc<Resource>>,
        timeout: Duration,
    ) -> CoreResult<()> {
        self.crossover(from, to);
        if self.has_custody {
            return Ok(());
        }
        let Some(target) = self.target.clone() else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        if target.wait_until_front(self.ticket, Some(deadline)) {
            self.has_custody = true;
            Ok(())
        } else {
            target.remove(self.ticket);
            self.target = None;
            Err(ScopeError::CustodyTimeout {
                resource: target.name().to_string(),
                waited: timeout,
            })
        }
    }

    /// Release whatever this token holds or waits for.
    ///
    /// Safe to call at any point, including while queued but not yet
    /// granted. Also invoked on drop.
    pub fn release(&mut self) {
        if let Some(target) = self.target.take() {
            target.remove(self.ticket);
            debug!(resource = target.name(), "custody released");
        }
        self.has_custody = false;
    }

    fn crossover(&mut self, from: Option<&Arc<Resource>>, to: Option<&Arc<Resource>>) {
        debug_assert!(
            from.is_some() || to.is_some(),
            "switch_from(None, None) is meaningless"
        );
        if let Some(to) = to {
            to.enqueue(self.ticket);
        }
        if let Some(from) = from {
            debug_assert!(self.has_custody, "switching from a resource not held");
            debug_assert!(
                self.target.as_ref().is_some_and(|t| Arc::ptr_eq(t, from)),
                "switching from a resource other than the held one"
            );
            from.remove(self.ticket);
        }
        self.has_custody = false;
        self.target = to.map(Arc::clone);
    }
}

impl Default for Custody {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Custody {
    fn drop(&mut self) {
        self.release();
    }
}

/// A thread that walks a custody pipeline and reports back.
///
/// The target receives a fresh [`Custody`] already enqueued (not waiting) on
/// `first_resource`; queue position is decided by spawn order, while the
/// waiting happens on the launched thread. The token is released
/// unconditionally when the target returns, errors, or panics.
pub struct CustodyThread<R> {
    handle: thread::JoinHandle<CoreResult<R>>,
}

impl<R: Send + 'static> CustodyThread<R> {
    /// Launch `target` with a custody token queued on `first_resource`.
    ///
    /// # Errors
    ///
    /// `ScopeError::Allocation` when the OS refuses to spawn another thread.
    pub fn spawn<F>(
        name: &str,
        first_resource: Option<&Arc<Resource>>,
        target: F,
    ) -> CoreResult<Self>
    where
        F: FnOnce(&mut Custody) -> CoreResult<R> + Send + 'static,
    {
        let mut custody = Custody::new();
        if let Some(first) = first_resource {
            // Claim a queue position before the thread exists, so that the
            // order threads are launched is the order they are served.
            custody.enqueue(first);
        }
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| target(&mut custody)));
                custody.release();
                match outcome {
                    Ok(result) => result,
                    Err(payload) => Err(ScopeError::Remote(RemoteError::capture(
                        thread_name,
                        panic_message(&*payload),
                    ))),
                }
            })
            .map_err(|e| ScopeError::Allocation(format!("failed to spawn custody thread: {e}")))?;
        Ok(Self { handle })
    }

    /// True once the target has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the target finishes; re-raise its error or return its
    /// value.
    pub fn result(self) -> CoreResult<R> {
        match self.handle.join() {
            Ok(result) => result,
            // The panic was already converted inside the thread; reaching
            // this arm means the join itself failed.
            Err(payload) => Err(ScopeError::Remote(RemoteError::capture(
                "custody thread",
                panic_message(&*payload),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_single_thread_walks_chain() {
        let a = Resource::new("a");
        let b = Resource::new("b");
        let mut custody = Custody::new();

        custody.switch_from(None, Some(&a));
        assert!(custody.has_custody());
        custody.switch_from(Some(&a), Some(&b));
        assert_eq!(a.queue_len(), 0);
        assert!(custody.has_custody());
        custody.switch_from(Some(&b), None);
        assert!(!custody.has_custody());
        assert_eq!(b.queue_len(), 0);
    }

    #[test]
    fn test_fifo_grant_order() {
        let stage = Resource::new("stage");
        let order: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut threads = Vec::new();
        for i in 0..8u64 {
            let stage = stage.clone();
            let order = order.clone();
            threads.push(
                CustodyThread::spawn("fifo", Some(&stage.clone()), move |custody| {
                    custody.wait_in_line();
                    order.lock().expect("poisoned").push(i);
                    // Hold briefly so later threads really do queue up.
                    thread::sleep(Duration::from_millis(2));
                    custody.switch_from(Some(&stage), None);
                    Ok(())
                })
                .expect("spawn"),
            );
            // Stagger launches so spawn order is unambiguous.
            thread::sleep(Duration::from_millis(1));
        }
        for th in threads {
            th.result().expect("thread failed");
        }
        let got = order.lock().expect("poisoned").clone();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_release_on_error_unblocks_next() {
        let stage = Resource::new("stage");

        let failing = {
            let stage = stage.clone();
            CustodyThread::spawn("bad", Some(&stage.clone()), move |custody| {
                custody.wait_in_line();
                let _ = &stage;
                Err::<(), _>(ScopeError::Aborted("injected".into()))
            })
            .expect("spawn")
        };
        thread::sleep(Duration::from_millis(5));
        let follower = {
            let stage = stage.clone();
            CustodyThread::spawn("good", Some(&stage.clone()), move |custody| {
                custody.wait_in_line();
                custody.switch_from(Some(&stage), None);
                Ok(42)
            })
            .expect("spawn")
        };

        assert!(failing.result().is_err());
        assert_eq!(follower.result().expect("follower starved"), 42);
        assert_eq!(stage.queue_len(), 0);
    }

    #[test]
    fn test_release_on_panic_unblocks_next() {
        let stage = Resource::new("stage");

        let panicking = {
            let stage = stage.clone();
            CustodyThread::spawn("panics", Some(&stage.clone()), move |custody| -> CoreResult<()> {
                custody.wait_in_line();
                let _ = &stage;
                panic!("boom")
            })
            .expect("spawn")
        };
        thread::sleep(Duration::from_millis(5));
        let follower = {
            let stage = stage.clone();
            CustodyThread::spawn("good", Some(&stage.clone()), move |custody| {
                custody.switch_from(None, Some(&stage));
                custody.switch_from(Some(&stage), None);
                Ok(())
            })
            .expect("spawn")
        };

        let err = panicking.result().expect_err("panic not surfaced");
        assert!(err.to_string().contains("boom"));
        assert!(err.remote_traceback().is_some());
        follower.result().expect("follower starved");
    }

    #[test]
    fn test_switch_from_timeout_leaves_no_residue() {
        let stage = Resource::new("stage");
        let mut holder = Custody::new();
        holder.switch_from(None, Some(&stage));

        let mut waiter = Custody::new();
        let err = waiter
            .switch_from_timeout(None, Some(&stage), Duration::from_millis(20))
            .expect_err("should time out");
        assert!(matches!(err, ScopeError::CustodyTimeout { .. }));
        assert_eq!(stage.queue_len(), 1); // only the holder remains

        holder.switch_from(Some(&stage), None);
        assert_eq!(stage.queue_len(), 0);
    }

    #[test]
    fn test_drop_releases_queued_token() {
        let stage = Resource::new("stage");
        let mut holder = Custody::new();
        holder.switch_from(None, Some(&stage));

        {
            let mut queued = Custody::new();
            queued.enqueue(&stage);
            assert_eq!(stage.queue_len(), 2);
        } // dropped while waiting in line

        assert_eq!(stage.queue_len(), 1);
        holder.release();
        assert_eq!(stage.queue_len(), 0);
    }
}
