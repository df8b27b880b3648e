//! Worker-owned hardware objects behind transparent call handles.
//!
//! Each hardware-owning object (camera, stage, display, writer) lives on a
//! dedicated worker that owns it outright; nothing else ever touches the
//! object. A [`ProxyObject`] is the handle held by the caller: every call is
//! shipped to the worker over a bounded channel, executed there, and the
//! result (or failure) shipped back. Large frames never travel over the
//! channel; a [`SlotDescriptor`](crate::buffer::SlotDescriptor) does, and
//! the worker resolves it against its own clone of the pool.
//!
//! # Worker run loop
//!
//! The loop is single-threaded and cooperative: it polls its inbound channel
//! on a fixed short tick, executes at most one command per poll, and never
//! blocks on anything but one command's execution. Worker-side failures
//! (error returns and panics alike) are caught at the loop boundary,
//! wrapped in [`RemoteError`] with a captured backtrace, and shipped to the
//! caller, so a worker never dies silently. On loop exit, by shutdown command,
//! handle drop, or channel disconnect, [`WorkerObject::close`] runs
//! unconditionally so hardware is released even on ungraceful teardown.
//!
//! # Example
//!
//! ```rust
//! use scope_core::buffer::FrameDtype;
//! use scope_core::proxy::{ProxyManager, WorkerObject};
//!
//! struct Counter(u64);
//! impl WorkerObject for Counter {}
//!
//! let mut manager = ProxyManager::new(Default::default());
//! manager.allocate(&[64, 64], FrameDtype::U16, 4).expect("pool");
//! let counter = manager
//!     .proxy_object("counter", || Ok(Counter(0)))
//!     .expect("worker init");
//! let value = counter.call(|c| { c.0 += 1; Ok(c.0) }).expect("call");
//! assert_eq!(value, 1);
//! ```

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::buffer::{FrameDtype, SharedBufferPool};
use crate::config::WorkerSettings;
use crate::error::{panic_message, CoreResult, RemoteError, ScopeError};

/// Contract every proxied object fulfils.
///
/// `close` is the hardware-release hook, invoked exactly once when the
/// worker run loop exits, whatever the reason. The default does nothing.
pub trait WorkerObject: Send + 'static {
    /// Release hardware held by this object. Must be idempotent-safe to the
    /// extent the device requires; the core calls it once.
    fn close(&mut self) {}
}

type Operation<T> = Box<dyn FnOnce(&mut T) + Send>;

enum Command<T> {
    Call(Operation<T>),
    Shutdown,
}

/// Registry that owns the frame pool and spawns hardware workers.
///
/// One manager per acquisition process. `allocate` reserves the shared
/// frame slots; `proxy_object` spawns a worker and hands back the call
/// handle. Workers keep their own clone of the pool for descriptor
/// resolution.
pub struct ProxyManager {
    settings: WorkerSettings,
    pool: Option<SharedBufferPool>,
    worker_names: Vec<String>,
}

impl ProxyManager {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            settings,
            pool: None,
            worker_names: Vec::new(),
        }
    }

    /// Pre-reserve the shared frame slots every stage will use.
    ///
    /// # Errors
    ///
    /// `ScopeError::Allocation` on invalid geometry, and when a pool was
    /// already allocated; the pool is created once at startup.
    pub fn allocate(
        &mut self,
        shape: &[usize],
        dtype: FrameDtype,
        count: usize,
    ) -> CoreResult<SharedBufferPool> {
        if self.pool.is_some() {
            return Err(ScopeError::Allocation(
                "frame pool already allocated".into(),
            ));
        }
        let pool = SharedBufferPool::allocate(shape, dtype, count)?;
        self.pool = Some(pool.clone());
        Ok(pool)
    }

    /// The pool allocated by [`ProxyManager::allocate`].
    pub fn pool(&self) -> Option<&SharedBufferPool> {
        self.pool.as_ref()
    }

    /// Names of workers spawned so far.
    pub fn worker_names(&self) -> &[String] {
        &self.worker_names
    }

    /// Spawn a worker, construct the object inside it, and block until the
    /// worker reports initialized.
    ///
    /// `init` runs on the worker; a failed or panicking `init` is captured
    /// with its backtrace and re-raised here as `ScopeError::Remote`.
    ///
    /// # Errors
    ///
    /// - `ScopeError::Allocation` when the worker cannot be spawned.
    /// - `ScopeError::Remote` when `init` fails inside the worker.
    /// - `ScopeError::ProxyConnection` when the worker vanishes before
    ///   reporting.
    pub fn proxy_object<T, F>(&mut self, name: &str, init: F) -> CoreResult<ProxyObject<T>>
    where
        T: WorkerObject,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = bounded::<Command<T>>(self.settings.channel_depth);
        let (init_tx, init_rx) = bounded::<Result<(), RemoteError>>(1);
        let tick = self.settings.tick;
        let worker_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_name}"))
            .spawn(move || worker_loop(worker_name, cmd_rx, init_tx, init, tick))
            .map_err(|e| ScopeError::Allocation(format!("failed to spawn worker: {e}")))?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                info!(worker = name, "worker initialized");
            }
            Ok(Err(remote)) => {
                // Worker reported an init failure and is exiting; reap it.
                let _ = handle.join();
                return Err(ScopeError::Remote(remote));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(ScopeError::ProxyConnection(format!(
                    "worker '{name}' terminated before initializing"
                )));
            }
        }

        self.worker_names.push(name.to_string());
        Ok(ProxyObject {
            name: name.to_string(),
            cmd_tx,
            handle: Some(handle),
        })
    }
}

fn worker_loop<T, F>(
    name: String,
    cmd_rx: Receiver<Command<T>>,
    init_tx: Sender<Result<(), RemoteError>>,
    init: F,
    tick: Duration,
) where
    T: WorkerObject,
    F: FnOnce() -> anyhow::Result<T>,
{
    let mut obj = match catch_unwind(AssertUnwindSafe(init)) {
        Ok(Ok(obj)) => {
            let _ = init_tx.send(Ok(()));
            obj
        }
        Ok(Err(e)) => {
            let _ = init_tx.send(Err(RemoteError::capture(
                format!("worker '{name}' init"),
                format!("{e:#}"),
            )));
            return;
        }
        Err(payload) => {
            let _ = init_tx.send(Err(RemoteError::capture(
                format!("worker '{name}' init"),
                panic_message(&*payload),
            )));
            return;
        }
    };

    // Cooperative poll: at most one command per tick, so the loop stays
    // responsive to shutdown between commands.
    loop {
        match cmd_rx.recv_timeout(tick) {
            Ok(Command::Call(op)) => op(&mut obj),
            Ok(Command::Shutdown) => {
                debug!(worker = %name, "worker shutdown requested");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker = %name, "command channel closed");
                break;
            }
        }
    }

    obj.close();
    info!(worker = %name, "worker closed");
}

/// Handle to an object living on its worker.
///
/// Dropping the handle shuts the worker down (and thereby runs
/// [`WorkerObject::close`]) and joins it.
pub struct ProxyObject<T: WorkerObject> {
    name: String,
    cmd_tx: Sender<Command<T>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<T: WorkerObject> ProxyObject<T> {
    /// Worker name this handle talks to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `op` on the worker-owned object and block for the result.
    ///
    /// Failures inside `op`, error returns and panics alike, come back as
    /// `ScopeError::Remote` with the worker backtrace attached. A dead
    /// worker surfaces as `ScopeError::ProxyConnection`.
    pub fn call<R, F>(&self, op: F) -> CoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> anyhow::Result<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded::<Result<R, RemoteError>>(1);
        let name = self.name.clone();
        let wrapped: Operation<T> = Box::new(move |obj: &mut T| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| op(obj))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RemoteError::capture(
                    format!("worker '{name}'"),
                    format!("{e:#}"),
                )),
                Err(payload) => Err(RemoteError::capture(
                    format!("worker '{name}'"),
                    panic_message(&*payload),
                )),
            };
            let _ = reply_tx.send(outcome);
        });

        self.cmd_tx
            .send(Command::Call(wrapped))
            .map_err(|_| self.disconnected())?;
        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(ScopeError::Remote(remote)),
            Err(_) => Err(self.disconnected()),
        }
    }

    /// [`ProxyObject::call`] with a bound on the wait for the reply.
    ///
    /// Meant for calls gated on physical hardware; an expired bound is a
    /// hard failure, not a silent pass.
    pub fn call_with_timeout<R, F>(&self, op: F, timeout: Duration) -> CoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> anyhow::Result<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded::<Result<R, RemoteError>>(1);
        let name = self.name.clone();
        let wrapped: Operation<T> = Box::new(move |obj: &mut T| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| op(obj))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RemoteError::capture(
                    format!("worker '{name}'"),
                    format!("{e:#}"),
                )),
                Err(payload) => Err(RemoteError::capture(
                    format!("worker '{name}'"),
                    panic_message(&*payload),
                )),
            };
            let _ = reply_tx.send(outcome);
        });

        self.cmd_tx
            .send(Command::Call(wrapped))
            .map_err(|_| self.disconnected())?;
        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(ScopeError::Remote(remote)),
            Err(RecvTimeoutError::Timeout) => Err(ScopeError::HardwareTimeout {
                device: self.name.clone(),
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Ask the worker to exit its run loop and join it.
    ///
    /// Idempotent; also performed on drop.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.cmd_tx.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker panicked during shutdown");
            }
        }
    }

    fn disconnected(&self) -> ScopeError {
        ScopeError::ProxyConnection(format!("worker '{}' terminated", self.name))
    }
}

impl<T: WorkerObject> Drop for ProxyObject<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
