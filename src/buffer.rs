//! Pre-allocated shared frame-slot pool.
//!
//! Frames produced by a multi-megapixel camera are too large to copy between
//! pipeline stages. This module provides `SharedBufferPool`: a fixed set of
//! fixed-shape, fixed-dtype slots allocated once at startup and addressed by
//! integer slot id. A `SlotDescriptor`, not the frame content, is what
//! travels to a worker; the worker resolves it into a locally usable
//! `BufferHandle` with [`SharedBufferPool::attach`]. That resolution step is
//! explicit: no code may assume a slot is visible without attaching.
//!
//! # Memory flow
//!
//! ```text
//! 1. allocate() reserves `count` slots of shape x dtype at startup
//! 2. acquire_slot() hands out a free slot id (lock-free free list)
//! 3. descriptor(slot) produces the Send-able SlotDescriptor
//! 4. attach(&descriptor) resolves it into a BufferHandle on any side
//! 5. write()/read() guards give exclusive / shared access to the bytes
//! 6. release_slot(slot) returns the id to the free list
//! ```
//!
//! Shape and dtype are fixed at allocation time; only content changes. Slots
//! are never individually freed; the pool lives until drop.

use crossbeam_queue::SegQueue;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{CoreResult, ScopeError};

/// Element type of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDtype {
    U8,
    U16,
    F32,
}

impl FrameDtype {
    /// Size of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            FrameDtype::U8 => 1,
            FrameDtype::U16 => 2,
            FrameDtype::F32 => 4,
        }
    }
}

impl std::fmt::Display for FrameDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FrameDtype::U8 => "u8",
            FrameDtype::U16 => "u16",
            FrameDtype::F32 => "f32",
        };
        write!(f, "{}", label)
    }
}

/// The cross-worker representation of a frame slot.
///
/// Identity is (slot id, shape, dtype). A descriptor is cheap to clone and
/// send; it carries no frame content. Resolving it requires the pool it was
/// issued by; `attach` rejects descriptors whose geometry does not match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    /// Slot index inside the pool.
    pub slot: usize,
    /// Frame shape, outermost dimension first.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: FrameDtype,
}

struct PoolInner {
    shape: Vec<usize>,
    dtype: FrameDtype,
    slot_bytes: usize,
    slots: Box<[RwLock<Box<[u8]>>]>,
    /// Lock-free free list of slot ids.
    free: SegQueue<usize>,
    available: AtomicUsize,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
    attach_count: AtomicU64,
}

/// Pool of pre-allocated frame slots shared by every pipeline stage.
///
/// Cloning the pool is cheap (`Arc` internally); each worker keeps its own
/// clone and attaches descriptors against it. Thread-safe throughout.
#[derive(Clone)]
pub struct SharedBufferPool {
    inner: Arc<PoolInner>,
}

impl SharedBufferPool {
    /// Pre-reserve `count` slots of the given shape and dtype.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::Allocation` when the shape is empty, any
    /// dimension is zero, `count` is zero, or the total size overflows.
    pub fn allocate(shape: &[usize], dtype: FrameDtype, count: usize) -> CoreResult<Self> {
        if count == 0 {
            return Err(ScopeError::Allocation("slot count must be > 0".into()));
        }
        if shape.is_empty() || shape.contains(&0) {
            return Err(ScopeError::Allocation(format!(
                "invalid frame shape {:?}",
                shape
            )));
        }
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| ScopeError::Allocation("frame shape overflows usize".into()))?;
        let slot_bytes = elements
            .checked_mul(dtype.item_size())
            .ok_or_else(|| ScopeError::Allocation("frame size overflows usize".into()))?;
        slot_bytes
            .checked_mul(count)
            .ok_or_else(|| ScopeError::Allocation("pool size overflows usize".into()))?;

        let slots: Vec<RwLock<Box<[u8]>>> = (0..count)
            .map(|_| RwLock::new(vec![0u8; slot_bytes].into_boxed_slice()))
            .collect();
        let free = SegQueue::new();
        for id in 0..count {
            free.push(id);
        }

        info!(
            slot_count = count,
            slot_mb = slot_bytes as f64 / (1024.0 * 1024.0),
            total_mb = (slot_bytes * count) as f64 / (1024.0 * 1024.0),
            dtype = %dtype,
            "SharedBufferPool allocated"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                shape: shape.to_vec(),
                dtype,
                slot_bytes,
                slots: slots.into_boxed_slice(),
                free,
                available: AtomicUsize::new(count),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
                attach_count: AtomicU64::new(0),
            }),
        })
    }

    /// Take a free slot id off the free list.
    ///
    /// Returns `None` when every slot is in flight (backpressure indicator).
    pub fn acquire_slot(&self) -> Option<usize> {
        let slot = self.inner.free.pop()?;
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        Some(slot)
    }

    /// Return a slot id to the free list.
    pub fn release_slot(&self, slot: usize) {
        debug_assert!(slot < self.inner.slots.len());
        self.inner.free.push(slot);
        self.inner.available.fetch_add(1, Ordering::Relaxed);
        self.inner.total_returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Build the descriptor for a slot id.
    pub fn descriptor(&self, slot: usize) -> SlotDescriptor {
        SlotDescriptor {
            slot,
            shape: self.inner.shape.clone(),
            dtype: self.inner.dtype,
        }
    }

    /// Resolve a descriptor into a locally usable handle.
    ///
    /// This is the explicit "reconnect" step: a descriptor is inert until
    /// the receiving side attaches it against its clone of the pool.
    ///
    /// # Errors
    ///
    /// `ScopeError::DescriptorMismatch` when the slot id is out of range or
    /// the shape/dtype disagree with this pool.
    pub fn attach(&self, desc: &SlotDescriptor) -> CoreResult<BufferHandle> {
        if desc.slot >= self.inner.slots.len() {
            return Err(ScopeError::DescriptorMismatch(format!(
                "slot {} out of range (pool has {})",
                desc.slot,
                self.inner.slots.len()
            )));
        }
        if desc.shape != self.inner.shape || desc.dtype != self.inner.dtype {
            return Err(ScopeError::DescriptorMismatch(format!(
                "descriptor {:?}/{} vs pool {:?}/{}",
                desc.shape, desc.dtype, self.inner.shape, self.inner.dtype
            )));
        }
        self.inner.attach_count.fetch_add(1, Ordering::Relaxed);
        Ok(BufferHandle {
            pool: Arc::clone(&self.inner),
            slot: desc.slot,
        })
    }

    /// Frame shape of every slot.
    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    /// Element type of every slot.
    pub fn dtype(&self) -> FrameDtype {
        self.inner.dtype
    }

    /// Size of one slot in bytes.
    pub fn slot_bytes(&self) -> usize {
        self.inner.slot_bytes
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of slot ids currently on the free list.
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Total slot acquisitions since allocation.
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Total slot returns since allocation.
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Relaxed)
    }

    /// How many descriptors have been attached against this pool.
    pub fn attach_count(&self) -> u64 {
        self.inner.attach_count.load(Ordering::Relaxed)
    }
}

/// A locally mapped view of one slot.
///
/// Obtained from [`SharedBufferPool::attach`]. Read/write access goes
/// through guards; content mutation is expected to be serialized by the
/// custody layer; the `RwLock` is a backstop, not the ordering mechanism.
pub struct BufferHandle {
    pool: Arc<PoolInner>,
    slot: usize,
}

impl BufferHandle {
    /// Slot id this handle maps.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Size of the mapped slot in bytes.
    pub fn len_bytes(&self) -> usize {
        self.pool.slot_bytes
    }

    /// Shared read access to the slot bytes.
    pub fn read(&self) -> FrameRead<'_> {
        FrameRead {
            guard: self.pool.slots[self.slot].read(),
        }
    }

    /// Exclusive write access to the slot bytes.
    pub fn write(&self) -> FrameWrite<'_> {
        FrameWrite {
            guard: self.pool.slots[self.slot].write(),
        }
    }
}

/// Read guard over a slot's bytes.
pub struct FrameRead<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl std::ops::Deref for FrameRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Write guard over a slot's bytes.
pub struct FrameWrite<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl std::ops::Deref for FrameWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for FrameWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_geometry() {
        let pool = SharedBufferPool::allocate(&[4, 8, 8], FrameDtype::U16, 3)
            .expect("allocation failed");
        assert_eq!(pool.slot_count(), 3);
        assert_eq!(pool.slot_bytes(), 4 * 8 * 8 * 2);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_allocate_rejects_bad_geometry() {
        assert!(SharedBufferPool::allocate(&[], FrameDtype::U8, 1).is_err());
        assert!(SharedBufferPool::allocate(&[0, 4], FrameDtype::U8, 1).is_err());
        assert!(SharedBufferPool::allocate(&[4], FrameDtype::U8, 0).is_err());
        assert!(SharedBufferPool::allocate(&[usize::MAX, 2], FrameDtype::U16, 1).is_err());
    }

    #[test]
    fn test_acquire_release_accounting() {
        let pool = SharedBufferPool::allocate(&[16], FrameDtype::U8, 2).expect("alloc");
        let a = pool.acquire_slot().expect("slot");
        let b = pool.acquire_slot().expect("slot");
        assert_ne!(a, b);
        assert!(pool.acquire_slot().is_none());
        assert_eq!(pool.available(), 0);

        pool.release_slot(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_acquires(), 2);
        assert_eq!(pool.total_returns(), 1);
    }

    #[test]
    fn test_descriptor_round_trip() {
        let pool = SharedBufferPool::allocate(&[8, 8], FrameDtype::U8, 1).expect("alloc");
        let slot = pool.acquire_slot().expect("slot");
        let desc = pool.descriptor(slot);

        // Writer side.
        let handle = pool.attach(&desc).expect("attach");
        handle.write().copy_from_slice(&[0xAB; 64]);

        // Reader side (a worker's clone of the pool).
        let remote = pool.clone();
        let other = remote.attach(&desc).expect("attach");
        assert!(other.read().iter().all(|&b| b == 0xAB));
        assert_eq!(pool.attach_count(), 2);
    }

    #[test]
    fn test_attach_rejects_mismatch() {
        let pool = SharedBufferPool::allocate(&[8, 8], FrameDtype::U8, 1).expect("alloc");
        let mut desc = pool.descriptor(0);
        desc.shape = vec![4, 4];
        assert!(matches!(
            pool.attach(&desc),
            Err(ScopeError::DescriptorMismatch(_))
        ));

        let stale = SlotDescriptor {
            slot: 99,
            shape: vec![8, 8],
            dtype: FrameDtype::U8,
        };
        assert!(pool.attach(&stale).is_err());
    }
}
