//! # Synchronization Primitives
//!
//! Completion tags and flush stamps. Both are published atomically so that
//! callers can observe progress without taking a receiver's lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::types::*;

// =============================================================================
// COMPLETION TAG
// =============================================================================

/// GPU-written completion marker
///
/// The epilogue barrier of every submission writes its task count here with
/// a post-sync operation. The value only moves forward.
#[derive(Debug)]
pub struct CompletionTag {
    /// GPU address the post-sync write targets
    gpu_addr: GpuAddr,
    /// Last completed task count
    value: AtomicU32,
}

impl CompletionTag {
    /// Create a new tag at `gpu_addr`, nothing completed
    pub fn new(gpu_addr: GpuAddr) -> Self {
        Self {
            gpu_addr,
            value: AtomicU32::new(0),
        }
    }

    /// Get GPU address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Highest completed task count
    #[inline]
    pub fn completed(&self) -> TaskCount {
        self.value.load(Ordering::Acquire)
    }

    /// Publish completion up to `task_count`
    #[inline]
    pub fn signal(&self, task_count: TaskCount) {
        self.value.fetch_max(task_count, Ordering::AcqRel);
    }

    /// Check if a task count has completed
    #[inline]
    pub fn is_completed(&self, task_count: TaskCount) -> bool {
        self.completed() >= task_count
    }

    /// Spin-wait for `task_count`
    ///
    /// `spin_limit` bounds the number of polls; `None` waits forever.
    pub fn wait(&self, task_count: TaskCount, spin_limit: Option<u64>) -> Result<()> {
        let mut spins = 0u64;
        while !self.is_completed(task_count) {
            if let Some(limit) = spin_limit {
                if spins >= limit {
                    log::warn!(
                        "CompletionTag: wait for {} timed out at {}",
                        task_count,
                        self.completed()
                    );
                    return Err(Error::FenceTimeout);
                }
            }
            spins += 1;
            core::hint::spin_loop();
        }
        Ok(())
    }
}

// =============================================================================
// FLUSH STAMPS
// =============================================================================

/// Shared cell receiving the flush stamp of the submission that carried a
/// recorded buffer
#[derive(Debug, Default)]
pub struct FlushStampObject {
    stamp: AtomicU64,
}

impl FlushStampObject {
    /// Create an unset stamp object
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stamp, 0 while unflushed
    #[inline]
    pub fn peek(&self) -> FlushStamp {
        self.stamp.load(Ordering::Acquire)
    }

    /// Store a stamp
    #[inline]
    pub fn set(&self, stamp: FlushStamp) {
        self.stamp.store(stamp, Ordering::Release);
    }
}

/// Owner-side view of a stamp object that can be swapped for a caller's
#[derive(Debug, Clone)]
pub struct FlushStampTracker {
    object: Arc<FlushStampObject>,
}

impl FlushStampTracker {
    /// Tracker with a private stamp object
    pub fn new() -> Self {
        Self {
            object: Arc::new(FlushStampObject::new()),
        }
    }

    /// Current stamp
    pub fn peek_stamp(&self) -> FlushStamp {
        self.object.peek()
    }

    /// Set the stamp
    pub fn set_stamp(&self, stamp: FlushStamp) {
        self.object.set(stamp);
    }

    /// Redirect updates into a caller-owned object
    pub fn replace_stamp_object(&mut self, object: Arc<FlushStampObject>) {
        self.object = object;
    }

    /// Shared reference to the stamp object
    pub fn stamp_object(&self) -> Arc<FlushStampObject> {
        Arc::clone(&self.object)
    }
}

impl Default for FlushStampTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects stamp objects of one chained run and updates them together
#[derive(Debug, Default)]
pub struct FlushStampUpdateHelper {
    objects: Vec<Arc<FlushStampObject>>,
}

impl FlushStampUpdateHelper {
    /// Empty helper
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object
    pub fn insert(&mut self, object: Arc<FlushStampObject>) {
        self.objects.push(object);
    }

    /// Number of collected objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing was collected
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Publish `stamp` to every collected object
    pub fn update_all(&self, stamp: FlushStamp) {
        for object in &self.objects {
            object.set(stamp);
        }
    }
}
