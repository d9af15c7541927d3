//! Recorded command buffers and the batch descriptors handed to a back end.

use alloc::sync::Arc;

use magma_core::{FlushStampTracker, GpuAddr, TaskCount, TaskLevel};
use magma_mem::{GraphicsAllocation, ResidencyContainer};

use crate::stream::PatchPoint;

/// Back end throttle hint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Throttle {
    /// Yield to other work
    Low,
    /// Normal
    #[default]
    Medium,
    /// Run ahead of other work
    High,
}

/// Per-submission hints the back end consumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SubmissionHints {
    /// Memory must stay coherent with the CPU while running
    pub requires_coherency: bool,
    /// Schedule at low priority
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: Throttle,
    /// Requested slice count, 0 for the device default
    pub slice_count: u32,
}

/// Physical submission descriptor
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    /// Allocation holding the first command
    pub allocation: Arc<GraphicsAllocation>,
    /// Offset of the first command
    pub start_offset: usize,
    /// End of the first buffer's commands; chained buffers follow by jump
    pub used_size: usize,
    /// Hints of the first buffer
    pub hints: SubmissionHints,
    /// Task count the chain completes
    pub task_count: TaskCount,
    /// Buffers reachable from the entry point
    pub chained_buffers: usize,
}

impl BatchBuffer {
    /// GPU entry point
    pub fn start_address(&self) -> GpuAddr {
        self.allocation.gpu_addr() + self.start_offset as u64
    }
}

/// One recorded, not yet submitted, piece of work
///
/// The patch points refer into the command stream allocation and stay
/// valid while the buffer is owned by the aggregator.
#[derive(Debug)]
pub struct RecordedCommandBuffer {
    /// Command stream allocation at record time
    pub allocation: Arc<GraphicsAllocation>,
    /// First byte of this buffer's commands
    pub start_offset: usize,
    /// One past the last byte, cache-line aligned
    pub end_offset: usize,
    /// Allocations the commands reference
    pub surfaces: ResidencyContainer,
    /// Epilogue barrier when it may be dropped by chaining
    pub erasable_barrier: Option<PatchPoint>,
    /// Epilogue barrier carrying the completion post-sync
    pub epilogue_barrier: PatchPoint,
    /// Batch end, patched into a jump when chained
    pub batch_end: PatchPoint,
    /// Task count the epilogue writes
    pub task_count: TaskCount,
    /// Task level recorded at
    pub task_level: TaskLevel,
    /// Submission hints
    pub hints: SubmissionHints,
    /// Receives the flush stamp of the carrying submission
    pub flush_stamp: FlushStampTracker,
}

impl RecordedCommandBuffer {
    /// GPU address of the first command
    pub fn start_address(&self) -> GpuAddr {
        self.allocation.gpu_addr() + self.start_offset as u64
    }

    /// Stand-alone batch for this buffer
    pub fn batch_buffer(&self) -> BatchBuffer {
        BatchBuffer {
            allocation: Arc::clone(&self.allocation),
            start_offset: self.start_offset,
            used_size: self.end_offset,
            hints: self.hints,
            task_count: self.task_count,
            chained_buffers: 1,
        }
    }
}
