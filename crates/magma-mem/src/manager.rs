//! # Memory Manager
//!
//! The allocation contract the submission core consumes, and a system
//! memory implementation backed by a first-fit VA allocator.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use magma_core::{ByteSize, GpuAddr, HardwareInfo, Result};

use crate::address_space::{AddressSpace, VaRange};
use crate::allocation::{AllocationId, AllocationProperties, GraphicsAllocation};

// =============================================================================
// MEMORY MANAGER TRAIT
// =============================================================================

/// Supplies and releases graphics allocations
pub trait MemoryManager: Send + Sync {
    /// Allocate GPU memory described by `properties`
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>>;

    /// Release an allocation
    ///
    /// Callers guarantee the GPU no longer references it.
    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>);

    /// Whether the device's resource budget is currently exhausted
    fn is_memory_budget_exhausted(&self) -> bool;
}

// =============================================================================
// SYSTEM MEMORY MANAGER
// =============================================================================

/// Memory manager configuration
#[derive(Debug, Clone, Copy)]
pub struct MemoryManagerConfig {
    /// GPU virtual range handed out
    pub va_range: VaRange,
    /// Committed bytes at which the budget counts as exhausted
    pub budget: ByteSize,
}

impl MemoryManagerConfig {
    /// Budget equal to the device's global memory
    pub fn for_device(hw: &HardwareInfo) -> Self {
        Self {
            va_range: VaRange::new(GpuAddr::new(0x1_0000_0000), ByteSize::from_gib(256)),
            budget: hw.global_mem_size,
        }
    }
}

/// Memory manager statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Successful allocations
    pub allocations: u64,
    /// Frees
    pub frees: u64,
    /// Failed allocations
    pub failures: u64,
    /// Bytes currently committed
    pub committed: u64,
    /// Highest committed value seen
    pub peak_committed: u64,
}

#[derive(Debug)]
struct ManagerState {
    address_space: AddressSpace,
    stats: MemoryStats,
}

/// Memory manager handing out system-memory backed allocations
#[derive(Debug)]
pub struct SystemMemoryManager {
    config: MemoryManagerConfig,
    state: spin::Mutex<ManagerState>,
    next_id: AtomicU64,
    /// Budget pressure reported by the platform regardless of commitment
    external_pressure: AtomicBool,
}

impl SystemMemoryManager {
    /// Create a new manager
    pub fn new(config: MemoryManagerConfig) -> Self {
        Self {
            config,
            state: spin::Mutex::new(ManagerState {
                address_space: AddressSpace::new(config.va_range),
                stats: MemoryStats::default(),
            }),
            next_id: AtomicU64::new(1),
            external_pressure: AtomicBool::new(false),
        }
    }

    /// Force or clear platform memory pressure
    pub fn set_memory_pressure(&self, exhausted: bool) {
        self.external_pressure.store(exhausted, Ordering::Release);
    }

    /// Bytes currently committed
    pub fn committed(&self) -> ByteSize {
        ByteSize::from_bytes(self.state.lock().stats.committed)
    }

    /// Snapshot of statistics
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats.clone()
    }

    /// Configuration
    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }
}

impl MemoryManager for SystemMemoryManager {
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>> {
        let mut state = self.state.lock();
        let range = match state
            .address_space
            .allocate(properties.size, properties.alignment)
        {
            Ok(range) => range,
            Err(e) => {
                state.stats.failures += 1;
                log::warn!(
                    "MemoryManager: {:?} allocation of {} failed: {}",
                    properties.alloc_type,
                    properties.size,
                    e
                );
                return Err(e);
            }
        };

        let id = AllocationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let allocation = Arc::new(GraphicsAllocation::new(id, range.start, properties));

        state.stats.allocations += 1;
        state.stats.committed += properties.size.as_bytes();
        state.stats.peak_committed = state.stats.peak_committed.max(state.stats.committed);

        log::trace!(
            "MemoryManager: {:?} {:?} at {} ({})",
            properties.alloc_type,
            id,
            range.start,
            properties.size
        );
        Ok(allocation)
    }

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        let mut state = self.state.lock();
        if let Err(e) = state.address_space.free(allocation.gpu_addr()) {
            log::warn!(
                "MemoryManager: free of unknown {:?} at {}: {}",
                allocation.id(),
                allocation.gpu_addr(),
                e
            );
            return;
        }
        state.stats.frees += 1;
        state.stats.committed -= allocation.size().as_bytes();
    }

    fn is_memory_budget_exhausted(&self) -> bool {
        self.external_pressure.load(Ordering::Acquire)
            || self.state.lock().stats.committed >= self.config.budget.as_bytes()
    }
}
