//! # Graphics Allocations
//!
//! GPU-visible memory regions with per-endpoint residency and usage stamps.
//!
//! An allocation may be referenced by several submission endpoints (OS
//! contexts). For each endpoint it tracks:
//!
//! - `task_count`: the last submission that referenced it
//! - `residency_task_count`: the submission it was last made resident for
//! - `resident`: whether it is currently mapped for that endpoint
//!
//! Stamps are written by the owning receiver under its lock and read
//! lock-free, so they are atomics.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use magma_core::{ByteSize, Error, GpuAddr, Handle, OBJECT_NOT_USED, OsContextId, Result, TaskCount};

/// Number of submission endpoints an allocation can track
pub const MAX_OS_CONTEXTS: usize = 8;

/// Allocation identifier
pub type AllocationId = Handle<GraphicsAllocation>;

/// Allocations handed to a submission for residency
pub type ResidencyContainer = Vec<Arc<GraphicsAllocation>>;

// =============================================================================
// ALLOCATION PROPERTIES
// =============================================================================

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// User buffer referenced by dispatches
    Buffer,
    /// Backing store of a command stream
    CommandBuffer,
    /// Mid-thread context save area
    Preemption,
    /// Completion tag storage
    TagBuffer,
    /// Driver-internal heap
    Internal,
}

bitflags::bitflags! {
    /// Flags for memory allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// CPU accessible (mappable)
        const CPU_VISIBLE = 1 << 0;
        /// GPU local (VRAM preferred)
        const GPU_LOCAL = 1 << 1;
        /// Coherent (no explicit flush needed)
        const COHERENT = 1 << 2;
    }
}

/// Request passed to a memory manager
#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    /// Requested size
    pub size: ByteSize,
    /// Required GPU address alignment
    pub alignment: u64,
    /// Usage
    pub alloc_type: AllocationType,
    /// Placement flags
    pub flags: AllocFlags,
}

impl AllocationProperties {
    /// Properties with the default placement for `alloc_type`
    pub fn new(size: ByteSize, alloc_type: AllocationType) -> Self {
        let flags = match alloc_type {
            AllocationType::CommandBuffer => AllocFlags::CPU_VISIBLE | AllocFlags::COHERENT,
            AllocationType::TagBuffer => AllocFlags::COHERENT,
            _ => AllocFlags::GPU_LOCAL,
        };
        Self {
            size,
            alignment: magma_core::memory_constants::PAGE_SIZE,
            alloc_type,
            flags,
        }
    }

    /// Override alignment
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Override flags
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }
}

// =============================================================================
// PER-ENDPOINT USAGE
// =============================================================================

#[derive(Debug)]
struct UsageInfo {
    task_count: AtomicU32,
    residency_task_count: AtomicU32,
    resident: AtomicBool,
}

impl UsageInfo {
    const fn new() -> Self {
        Self {
            task_count: AtomicU32::new(OBJECT_NOT_USED),
            residency_task_count: AtomicU32::new(OBJECT_NOT_USED),
            resident: AtomicBool::new(false),
        }
    }
}

// =============================================================================
// GRAPHICS ALLOCATION
// =============================================================================

/// One GPU-visible memory region
pub struct GraphicsAllocation {
    id: AllocationId,
    gpu_addr: GpuAddr,
    size: ByteSize,
    alloc_type: AllocationType,
    flags: AllocFlags,
    usage: [UsageInfo; MAX_OS_CONTEXTS],
    /// Zeroed CPU mapping, present for `CPU_VISIBLE` allocations
    backing: Option<spin::Mutex<Box<[u8]>>>,
}

#[inline]
fn slot(context: OsContextId) -> usize {
    let index = context as usize;
    assert!(index < MAX_OS_CONTEXTS, "os context {} out of range", context);
    index
}

impl GraphicsAllocation {
    /// Create an allocation placed at `gpu_addr`
    pub fn new(id: AllocationId, gpu_addr: GpuAddr, properties: &AllocationProperties) -> Self {
        let backing = if properties.flags.contains(AllocFlags::CPU_VISIBLE) {
            Some(spin::Mutex::new(
                vec![0u8; properties.size.as_bytes() as usize].into_boxed_slice(),
            ))
        } else {
            None
        };

        Self {
            id,
            gpu_addr,
            size: properties.size,
            alloc_type: properties.alloc_type,
            flags: properties.flags,
            usage: [const { UsageInfo::new() }; MAX_OS_CONTEXTS],
            backing,
        }
    }

    /// Get allocation ID
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Get GPU address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Get size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Get usage type
    pub fn alloc_type(&self) -> AllocationType {
        self.alloc_type
    }

    /// Get placement flags
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    /// Whether the CPU can read and patch the contents
    pub fn is_cpu_visible(&self) -> bool {
        self.backing.is_some()
    }

    // =========================================================================
    // Usage stamps
    // =========================================================================

    /// Last submission on `context` that referenced this allocation
    pub fn task_count(&self, context: OsContextId) -> TaskCount {
        self.usage[slot(context)].task_count.load(Ordering::Acquire)
    }

    /// Stamp the last referencing submission
    pub fn update_task_count(&self, task_count: TaskCount, context: OsContextId) {
        self.usage[slot(context)]
            .task_count
            .store(task_count, Ordering::Release);
    }

    /// Whether `context` ever referenced this allocation
    pub fn is_used_by_context(&self, context: OsContextId) -> bool {
        self.task_count(context) != OBJECT_NOT_USED
    }

    /// Whether any endpoint references this allocation
    pub fn is_used(&self) -> bool {
        self.usage
            .iter()
            .any(|u| u.task_count.load(Ordering::Acquire) != OBJECT_NOT_USED)
    }

    /// Whether every reference on `context` is at or below `bound`
    pub fn is_released_by(&self, bound: TaskCount, context: OsContextId) -> bool {
        let task_count = self.task_count(context);
        task_count == OBJECT_NOT_USED || task_count <= bound
    }

    // =========================================================================
    // Residency
    // =========================================================================

    /// Submission this allocation was last made resident for
    pub fn residency_task_count(&self, context: OsContextId) -> TaskCount {
        self.usage[slot(context)]
            .residency_task_count
            .load(Ordering::Acquire)
    }

    /// Stamp the residency submission
    pub fn update_residency_task_count(&self, task_count: TaskCount, context: OsContextId) {
        self.usage[slot(context)]
            .residency_task_count
            .store(task_count, Ordering::Release);
    }

    /// Whether residency must still be established for `task_count`
    pub fn is_residency_task_count_below(&self, task_count: TaskCount, context: OsContextId) -> bool {
        let current = self.residency_task_count(context);
        current == OBJECT_NOT_USED || current < task_count
    }

    /// Whether the allocation is resident for `context`
    pub fn is_resident(&self, context: OsContextId) -> bool {
        self.usage[slot(context)].resident.load(Ordering::Acquire)
    }

    /// Mark resident for `context`
    pub fn set_resident(&self, context: OsContextId) {
        self.usage[slot(context)].resident.store(true, Ordering::Release);
    }

    /// Drop residency for `context`
    pub fn release_residency(&self, context: OsContextId) {
        let usage = &self.usage[slot(context)];
        usage.resident.store(false, Ordering::Release);
        usage
            .residency_task_count
            .store(OBJECT_NOT_USED, Ordering::Release);
    }

    // =========================================================================
    // CPU access
    // =========================================================================

    /// Copy `bytes` into the CPU mapping at `offset`
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let backing = self.backing.as_ref().ok_or(Error::NotCpuVisible)?;
        let mut memory = backing.lock();
        let end = offset.checked_add(bytes.len()).ok_or(Error::BufferOverflow)?;
        let target = memory.get_mut(offset..end).ok_or(Error::BufferOverflow)?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `value`
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        let backing = self.backing.as_ref().ok_or(Error::NotCpuVisible)?;
        let mut memory = backing.lock();
        let end = offset.checked_add(len).ok_or(Error::BufferOverflow)?;
        let target = memory.get_mut(offset..end).ok_or(Error::BufferOverflow)?;
        target.fill(value);
        Ok(())
    }

    /// Copy out of the CPU mapping at `offset`
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let backing = self.backing.as_ref().ok_or(Error::NotCpuVisible)?;
        let memory = backing.lock();
        let end = offset.checked_add(out.len()).ok_or(Error::BufferOverflow)?;
        let source = memory.get(offset..end).ok_or(Error::BufferOverflow)?;
        out.copy_from_slice(source);
        Ok(())
    }

    /// Run `f` over the whole CPU mapping
    pub fn with_cpu_view<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let backing = self.backing.as_ref().ok_or(Error::NotCpuVisible)?;
        let memory = backing.lock();
        Ok(f(&memory))
    }
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.id)
            .field("gpu_addr", &self.gpu_addr)
            .field("size", &self.size)
            .field("alloc_type", &self.alloc_type)
            .field("cpu_visible", &self.is_cpu_visible())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(size: u64, flags: AllocFlags) -> GraphicsAllocation {
        let props = AllocationProperties::new(ByteSize::from_bytes(size), AllocationType::Buffer)
            .with_flags(flags);
        GraphicsAllocation::new(AllocationId::new(1), GpuAddr::new(0x10000), &props)
    }

    #[test]
    fn test_fresh_allocation_unused() {
        let alloc = buffer(4096, AllocFlags::GPU_LOCAL);
        assert!(!alloc.is_used());
        assert!(!alloc.is_resident(0));
        assert!(alloc.is_residency_task_count_below(1, 0));
        assert!(alloc.is_released_by(0, 0));
    }

    #[test]
    fn test_stamps_are_per_context() {
        let alloc = buffer(4096, AllocFlags::GPU_LOCAL);
        alloc.update_task_count(5, 1);
        assert!(alloc.is_used_by_context(1));
        assert!(!alloc.is_used_by_context(0));
        assert!(alloc.is_used());
        assert!(!alloc.is_released_by(4, 1));
        assert!(alloc.is_released_by(5, 1));
    }

    #[test]
    fn test_residency_release() {
        let alloc = buffer(4096, AllocFlags::GPU_LOCAL);
        alloc.update_residency_task_count(3, 0);
        alloc.set_resident(0);
        assert!(alloc.is_resident(0));
        assert!(!alloc.is_residency_task_count_below(3, 0));
        assert!(alloc.is_residency_task_count_below(4, 0));

        alloc.release_residency(0);
        assert!(!alloc.is_resident(0));
        assert!(alloc.is_residency_task_count_below(1, 0));
    }

    #[test]
    fn test_cpu_access() {
        let alloc = buffer(64, AllocFlags::CPU_VISIBLE);
        alloc.write_bytes(8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        alloc.read_bytes(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        alloc.fill(8, 4, 0).unwrap();
        assert!(alloc.with_cpu_view(|b| b.iter().all(|&x| x == 0)).unwrap());
        assert_eq!(alloc.write_bytes(62, &[0; 4]), Err(Error::BufferOverflow));
    }

    #[test]
    fn test_gpu_only_has_no_mapping() {
        let alloc = buffer(64, AllocFlags::GPU_LOCAL);
        assert_eq!(alloc.write_bytes(0, &[1]), Err(Error::NotCpuVisible));
    }

    #[test]
    #[should_panic]
    fn test_context_out_of_range() {
        let alloc = buffer(64, AllocFlags::GPU_LOCAL);
        alloc.update_task_count(1, MAX_OS_CONTEXTS as OsContextId);
    }
}
