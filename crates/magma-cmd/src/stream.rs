//! # Command Stream
//!
//! Fixed-capacity, bump-allocated command memory backed by a CPU-visible
//! graphics allocation, plus patch points for rewriting emitted commands in
//! place.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::Pod;
use magma_core::{Error, GpuAddr, Result};
use magma_mem::GraphicsAllocation;

// =============================================================================
// PATCH POINTS
// =============================================================================

/// What a patch point may be rewritten into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Batch end sentinel, reserved to the size of a jump
    BatchEnd,
    /// Synchronization barrier that may become no-ops
    Barrier,
}

/// Location of an emitted command that can be patched later
#[derive(Debug, Clone)]
pub struct PatchPoint {
    allocation: Arc<GraphicsAllocation>,
    offset: usize,
    len: usize,
    kind: PatchKind,
}

impl PatchPoint {
    /// Byte offset inside the backing allocation
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reserved length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the patch point covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Patch kind
    pub fn kind(&self) -> PatchKind {
        self.kind
    }

    /// Backing allocation
    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    /// GPU address of the first byte
    pub fn gpu_addr(&self) -> GpuAddr {
        self.allocation.gpu_addr() + self.offset as u64
    }

    /// Overwrite the start of the patch point with `bytes`
    pub fn patch(&self, bytes: &[u8]) -> Result<()> {
        self.patch_at(0, bytes)
    }

    /// Overwrite `bytes` at `relative` offset inside the patch point
    pub fn patch_at(&self, relative: usize, bytes: &[u8]) -> Result<()> {
        assert!(
            relative + bytes.len() <= self.len,
            "patch of {} bytes at +{} exceeds {:?} point of {} bytes",
            bytes.len(),
            relative,
            self.kind,
            self.len
        );
        self.allocation.write_bytes(self.offset + relative, bytes)
    }

    /// Turn the whole patch point into no-ops
    pub fn patch_noop(&self) -> Result<()> {
        self.allocation.fill(self.offset, self.len, 0)
    }

    /// Copy out the current contents
    pub fn read(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.len];
        self.allocation.read_bytes(self.offset, &mut bytes)?;
        Ok(bytes)
    }

    /// Whether the contents are all no-ops
    pub fn is_noop(&self) -> Result<bool> {
        Ok(self.read()?.iter().all(|&b| b == 0))
    }
}

// =============================================================================
// COMMAND STREAM
// =============================================================================

/// Append-only command memory
///
/// `used <= capacity` always holds; every write is a bump allocation.
#[derive(Debug)]
pub struct CommandStream {
    allocation: Arc<GraphicsAllocation>,
    capacity: usize,
    used: usize,
}

impl CommandStream {
    /// Create a stream over a CPU-visible allocation
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Result<Self> {
        if !allocation.is_cpu_visible() {
            return Err(Error::NotCpuVisible);
        }
        let capacity = allocation.size().as_bytes() as usize;
        Ok(Self {
            allocation,
            capacity,
            used: 0,
        })
    }

    /// Backing allocation
    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    /// GPU address of the stream start
    pub fn gpu_base(&self) -> GpuAddr {
        self.allocation.gpu_addr()
    }

    /// Total bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still free
    pub fn available_space(&self) -> usize {
        self.capacity - self.used
    }

    /// Reserve `size` bytes, returning their offset
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if size > self.available_space() {
            log::warn!(
                "CommandStream: {} bytes requested, {} of {} available",
                size,
                self.available_space(),
                self.capacity
            );
            return Err(Error::CommandBufferFull);
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Append raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let offset = self.get_space(bytes.len())?;
        self.allocation.write_bytes(offset, bytes)?;
        Ok(offset)
    }

    /// Append one hardware command
    pub fn emit<T: Pod>(&mut self, command: &T) -> Result<usize> {
        self.emit_bytes(bytemuck::bytes_of(command))
    }

    /// Append one hardware command and remember where it went
    pub fn emit_patchable<T: Pod>(&mut self, command: &T, kind: PatchKind) -> Result<PatchPoint> {
        let offset = self.emit(command)?;
        Ok(self.patch_point(offset, core::mem::size_of::<T>(), kind))
    }

    /// Append `bytes` of no-ops
    pub fn emit_noops(&mut self, bytes: usize) -> Result<()> {
        debug_assert_eq!(bytes % 4, 0);
        let offset = self.get_space(bytes)?;
        self.allocation.fill(offset, bytes, 0)
    }

    /// Pad with no-ops up to a multiple of `alignment`
    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        let padding = self.used.next_multiple_of(alignment) - self.used;
        if padding > 0 {
            self.emit_noops(padding)?;
        }
        Ok(())
    }

    /// Drop everything written at or after `offset`
    pub fn rewind(&mut self, offset: usize) {
        assert!(offset <= self.used, "rewind past the write cursor");
        self.used = offset;
    }

    /// Patch point over `len` already emitted bytes at `offset`
    pub fn patch_point(&self, offset: usize, len: usize, kind: PatchKind) -> PatchPoint {
        assert!(offset + len <= self.used, "patch point past the write cursor");
        PatchPoint {
            allocation: Arc::clone(&self.allocation),
            offset,
            len,
            kind,
        }
    }

    /// Continue in a fresh allocation, returning the previous one
    pub fn replace_allocation(
        &mut self,
        allocation: Arc<GraphicsAllocation>,
    ) -> Result<Arc<GraphicsAllocation>> {
        if !allocation.is_cpu_visible() {
            return Err(Error::NotCpuVisible);
        }
        self.capacity = allocation.size().as_bytes() as usize;
        self.used = 0;
        Ok(core::mem::replace(&mut self.allocation, allocation))
    }
}
