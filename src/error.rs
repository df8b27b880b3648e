//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `ScopeError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of the concurrency core:
//! shared-buffer allocation, worker lifecycle, custody waits, and the
//! feature execution engine.
//!
//! ## Error Hierarchy
//!
//! - **`Allocation`**: the shared frame-slot pool could not be created
//!   (zero-sized request, size overflow, or reservation failure).
//! - **`DescriptorMismatch`**: a `SlotDescriptor` did not match the pool it
//!   was resolved against (wrong slot id, shape, or dtype). Indicates a
//!   stale or foreign descriptor, never coerced.
//! - **`ProxyConnection`**: the channel to a worker is gone: the worker
//!   terminated or its run loop exited. Surfaces on the *next* call.
//! - **`Remote`**: a worker-side operation failed. Carries the original
//!   message and the captured diagnostic backtrace from the worker, so the
//!   operator can distinguish "camera worker crashed" from a local fault.
//! - **`CustodyTimeout`**: a bounded `switch_from` wait expired before the
//!   calling thread reached the front of the resource queue.
//! - **`HardwareTimeout`**: a device-related step was not acknowledged by
//!   hardware within the configured bound. Treated as a hard failure, not
//!   a silent pass.
//! - **`Aborted`**: the acquisition was cancelled; raised once to the
//!   original caller, not per-node.
//! - **`Config`**: configuration parsing or semantic validation failed.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type CoreResult<T> = std::result::Result<T, ScopeError>;

/// Error captured at a worker boundary.
///
/// Worker-side failures (error returns and panics alike) never kill the
/// worker loop; they are converted into this structured value and shipped
/// back to the caller. `traceback` is an explicit diagnostic string captured
/// where the failure happened; there is no implicit global capture.
#[derive(Error, Debug, Clone)]
#[error("{context}: {message}")]
pub struct RemoteError {
    /// Which worker / operation produced the failure.
    pub context: String,
    /// The original error message.
    pub message: String,
    /// Backtrace text captured inside the worker. Non-empty by contract.
    pub traceback: String,
}

impl RemoteError {
    pub fn new(
        context: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    /// Capture a backtrace at the current point and build a `RemoteError`.
    pub fn capture(context: impl Into<String>, message: impl Into<String>) -> Self {
        let traceback = std::backtrace::Backtrace::force_capture().to_string();
        Self::new(context, message, traceback)
    }
}

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Shared frame-slot pool could not be allocated.
    ///
    /// Permanent - the requested geometry is invalid or the platform cannot
    /// reserve the memory. Fix the pool settings and retry.
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// A slot descriptor did not resolve against this pool.
    ///
    /// Permanent - indicates a stale descriptor or a descriptor from a
    /// different pool. Shape and dtype are fixed at allocation time and are
    /// never coerced.
    #[error("Descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// The channel to a worker is disconnected.
    ///
    /// The worker terminated (normally or not) and can no longer accept
    /// calls. Recovery requires spawning a fresh worker.
    #[error("Proxy connection lost: {0}")]
    ProxyConnection(String),

    /// A worker-side operation failed.
    ///
    /// The original message and worker backtrace are preserved so the
    /// failure reads as if it were raised locally.
    #[error("{0}")]
    Remote(#[from] RemoteError),

    /// A bounded custody wait expired.
    #[error("Custody of '{resource}' not granted within {waited:?}")]
    CustodyTimeout {
        /// Name of the resource being waited on.
        resource: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Hardware did not acknowledge a device-related step in time.
    #[error("Device '{device}' unacknowledged after {waited:?}")]
    HardwareTimeout {
        /// Name of the device being waited on.
        device: String,
        /// How long the signal thread waited.
        waited: Duration,
    },

    /// The acquisition was cancelled.
    #[error("Acquisition aborted: {0}")]
    Aborted(String),

    /// Configuration parsing or validation failed.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Best-effort extraction of a panic payload's message.
///
/// Used wherever a worker or custody thread converts a caught panic into a
/// `RemoteError`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

impl From<config::ConfigError> for ScopeError {
    fn from(e: config::ConfigError) -> Self {
        ScopeError::Config(e.to_string())
    }
}

impl ScopeError {
    /// True when the error originated inside a worker.
    pub fn is_remote(&self) -> bool {
        matches!(self, ScopeError::Remote(_))
    }

    /// The worker backtrace, when one was captured.
    pub fn remote_traceback(&self) -> Option<&str> {
        match self {
            ScopeError::Remote(e) => Some(e.traceback.as_str()),
            _ => None,
        }
    }
}
