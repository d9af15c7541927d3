//! # GPU Address Space
//!
//! First-fit virtual address allocator backing [`crate::SystemMemoryManager`].

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use magma_core::{ByteSize, Error, GpuAddr, Result, align_up, memory_constants};

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: GpuAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end - self.start)
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// Address space statistics
#[derive(Debug, Clone, Default)]
pub struct AddressSpaceStats {
    /// Number of allocations
    pub allocs: u64,
    /// Number of frees
    pub frees: u64,
    /// Currently reserved bytes
    pub reserved: u64,
}

/// GPU virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    /// Managed range
    range: VaRange,
    /// Free ranges sorted by start address, never adjacent
    free: Vec<VaRange>,
    /// Live reservations: start -> end
    reserved: BTreeMap<u64, u64>,
    /// Statistics
    stats: AddressSpaceStats,
}

impl AddressSpace {
    /// Create an address space covering `range`
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            free: alloc::vec![range],
            reserved: BTreeMap::new(),
            stats: AddressSpaceStats::default(),
        }
    }

    /// Get managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Reserve `size` bytes at `alignment` (at least one page)
    pub fn allocate(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        let alignment = alignment.max(memory_constants::PAGE_SIZE);
        if !alignment.is_power_of_two() {
            return Err(Error::MisalignedAddress);
        }
        let size = align_up(size.as_bytes().max(1), memory_constants::PAGE_SIZE);

        let (index, start) = self
            .free
            .iter()
            .enumerate()
            .find_map(|(i, hole)| {
                let start = align_up(hole.start.raw(), alignment);
                let end = start.checked_add(size)?;
                (end <= hole.end.raw()).then_some((i, start))
            })
            .ok_or(Error::OutOfMemory)?;

        let hole = self.free.remove(index);
        let end = start + size;
        let mut insert_at = index;
        if start > hole.start.raw() {
            self.free.insert(insert_at, VaRange {
                start: hole.start,
                end: GpuAddr::new(start),
            });
            insert_at += 1;
        }
        if end < hole.end.raw() {
            self.free.insert(insert_at, VaRange {
                start: GpuAddr::new(end),
                end: hole.end,
            });
        }

        self.reserved.insert(start, end);
        self.stats.allocs += 1;
        self.stats.reserved += size;

        Ok(VaRange {
            start: GpuAddr::new(start),
            end: GpuAddr::new(end),
        })
    }

    /// Return a reservation starting at `start`
    pub fn free(&mut self, start: GpuAddr) -> Result<()> {
        let end = self.reserved.remove(&start.raw()).ok_or(Error::NotFound)?;
        let released = VaRange {
            start,
            end: GpuAddr::new(end),
        };

        let index = self.free.partition_point(|hole| hole.start < released.start);
        self.free.insert(index, released);
        self.coalesce(index);

        self.stats.frees += 1;
        self.stats.reserved -= end - start.raw();
        Ok(())
    }

    fn coalesce(&mut self, index: usize) {
        if index + 1 < self.free.len() && self.free[index].end == self.free[index + 1].start {
            self.free[index].end = self.free[index + 1].end;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end == self.free[index].start {
            self.free[index - 1].end = self.free[index].end;
            self.free.remove(index);
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &AddressSpaceStats {
        &self.stats
    }

    /// Total unreserved bytes
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(self.free.iter().map(|r| r.size().as_bytes()).sum())
    }
}
