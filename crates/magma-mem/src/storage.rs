//! # Allocation Storage
//!
//! Allocations a receiver stopped using but the GPU may still read.
//!
//! Two lists are kept per submission endpoint. Temporary allocations are
//! released once the GPU is past their last task count; reusable ones may
//! instead be handed back out (e.g. as the next command buffer) under the
//! same condition.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use magma_core::{ByteSize, OsContextId, TaskCount};

use crate::allocation::{AllocationType, GraphicsAllocation};
use crate::manager::MemoryManager;

/// Which list an allocation is stored on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationUsage {
    /// Released after completion
    Temporary,
    /// Kept for reuse after completion
    Reusable,
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Allocations stored
    pub stored: u64,
    /// Allocations returned to the memory manager
    pub released: u64,
    /// Allocations handed back out
    pub reused: u64,
}

/// Per-endpoint lists of allocations awaiting GPU completion
#[derive(Debug)]
pub struct AllocationStorage {
    context: OsContextId,
    temporary: Vec<Arc<GraphicsAllocation>>,
    reusable: Vec<Arc<GraphicsAllocation>>,
    stats: StorageStats,
}

impl AllocationStorage {
    /// Create empty storage for `context`
    pub fn new(context: OsContextId) -> Self {
        Self {
            context,
            temporary: Vec::new(),
            reusable: Vec::new(),
            stats: StorageStats::default(),
        }
    }

    fn list_mut(&mut self, usage: AllocationUsage) -> &mut Vec<Arc<GraphicsAllocation>> {
        match usage {
            AllocationUsage::Temporary => &mut self.temporary,
            AllocationUsage::Reusable => &mut self.reusable,
        }
    }

    /// Store an allocation with its current task count
    pub fn store_allocation(&mut self, allocation: Arc<GraphicsAllocation>, usage: AllocationUsage) {
        self.stats.stored += 1;
        self.list_mut(usage).push(allocation);
    }

    /// Stamp `task_count` as the last use, then store
    pub fn store_allocation_with_task_count(
        &mut self,
        allocation: Arc<GraphicsAllocation>,
        usage: AllocationUsage,
        task_count: TaskCount,
    ) {
        allocation.update_task_count(task_count, self.context);
        self.store_allocation(allocation, usage);
    }

    /// Release every allocation on `usage` whose last use is at or below
    /// `bound`; returns how many were released
    ///
    /// `bound` must not exceed the highest task count the GPU completed.
    pub fn clean_allocation_list(
        &mut self,
        bound: TaskCount,
        usage: AllocationUsage,
        memory_manager: &dyn MemoryManager,
    ) -> usize {
        let context = self.context;
        let list = mem::take(self.list_mut(usage));
        let (released, kept): (Vec<_>, Vec<_>) = list
            .into_iter()
            .partition(|a| a.is_released_by(bound, context));
        *self.list_mut(usage) = kept;

        let count = released.len();
        for allocation in released {
            log::trace!(
                "AllocationStorage: releasing {:?} (task count {}, bound {})",
                allocation.id(),
                allocation.task_count(context),
                bound
            );
            memory_manager.free_graphics_memory(allocation);
        }
        self.stats.released += count as u64;
        count
    }

    /// Take a reusable allocation of `alloc_type` holding at least `size`
    /// bytes whose last use has completed
    pub fn obtain_reusable_allocation(
        &mut self,
        size: ByteSize,
        alloc_type: AllocationType,
        completed: TaskCount,
    ) -> Option<Arc<GraphicsAllocation>> {
        let context = self.context;
        let index = self.reusable.iter().position(|a| {
            a.alloc_type() == alloc_type && a.size() >= size && a.is_released_by(completed, context)
        })?;
        self.stats.reused += 1;
        Some(self.reusable.remove(index))
    }

    /// Number of stored allocations on `usage`
    pub fn len(&self, usage: AllocationUsage) -> usize {
        match usage {
            AllocationUsage::Temporary => self.temporary.len(),
            AllocationUsage::Reusable => self.reusable.len(),
        }
    }

    /// Whether both lists are empty
    pub fn is_empty(&self) -> bool {
        self.temporary.is_empty() && self.reusable.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }
}
