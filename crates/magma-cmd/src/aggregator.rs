//! # Submission Aggregator
//!
//! FIFO of recorded command buffers waiting for a flush. A flush turns the
//! front of the FIFO into one physical submission by chaining buffers
//! together:
//!
//! ```text
//!   buffer 0                 buffer 1                 buffer 2
//!  ┌───────────────────┐    ┌───────────────────┐    ┌───────────────────┐
//!  │ commands          │    │ commands          │    │ commands          │
//!  │ barrier (no-op'd) │    │ barrier           │    │ barrier + DC flush│
//!  │ BB_START ─────────┼───▶│ BB_START ─────────┼───▶│ BB_END            │
//!  └───────────────────┘    └───────────────────┘    └───────────────────┘
//!      level 3                  level 3 → 4              level 4
//! ```
//!
//! A barrier is dropped only when it was recorded as erasable and the next
//! buffer sits at the same task level. The chain tail always flushes the
//! data cache.
//!
//! The FIFO is only modified by [`SubmissionAggregator::retire_run`]; a run
//! whose submission fails stays queued and is prepared again by the next
//! flush.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use hashbrown::HashSet;
use magma_core::memory_constants::CACHE_LINE_SIZE;
use magma_core::{ByteSize, FlushStampUpdateHelper, GpuAddr, HardwareInfo, Result, TaskCount};
use magma_mem::{AllocationId, ResidencyContainer};

use crate::buffer::{BatchBuffer, RecordedCommandBuffer};
use crate::encoder::CommandEncoder;
use crate::stream::PatchPoint;

// =============================================================================
// LIMITS
// =============================================================================

/// Bounds on how much one chained run may contain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationLimits {
    /// Stop chaining at the first buffer whose hints differ from the head's
    pub split_on_hint_mismatch: bool,
    /// Stop chaining before unique surface bytes would exceed this
    pub resource_budget: Option<ByteSize>,
}

impl AggregationLimits {
    /// Chain the whole FIFO into one run
    pub const fn unlimited() -> Self {
        Self {
            split_on_hint_mismatch: false,
            resource_budget: None,
        }
    }

    /// Split on hint changes and cap a run at half the device memory
    pub fn conservative(hw: &HardwareInfo) -> Self {
        Self {
            split_on_hint_mismatch: true,
            resource_budget: Some(ByteSize::from_bytes(hw.global_mem_size.as_bytes() / 2)),
        }
    }
}

// =============================================================================
// CHAINED RUN
// =============================================================================

/// Front of the FIFO prepared as one physical submission
#[derive(Debug)]
pub struct ChainedRun {
    /// Entry point and completion value
    pub batch: BatchBuffer,
    /// Deduplicated surfaces of every chained buffer
    pub surfaces: ResidencyContainer,
    /// Unique surface bytes
    pub resource_bytes: u64,
    /// Buffers in the run
    pub buffer_count: usize,
    /// Barriers turned into no-ops
    pub elided_barriers: usize,
    /// Joins where execution falls through into the next buffer
    pub fallthrough_joins: usize,
    /// Task count of the tail
    pub last_task_count: TaskCount,
    /// Stamp objects of every chained buffer
    pub stamps: FlushStampUpdateHelper,
}

/// Aggregator statistics
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    /// Buffers recorded
    pub recorded: u64,
    /// Runs retired after a successful submission
    pub runs_retired: u64,
    /// Buffers retired
    pub buffers_retired: u64,
}

// =============================================================================
// AGGREGATOR
// =============================================================================

/// Where execution continues when a batch end is turned into no-ops
fn fallthrough_address(batch_end: &PatchPoint) -> GpuAddr {
    (batch_end.gpu_addr() + batch_end.len() as u64).align_up(CACHE_LINE_SIZE as u64)
}

/// FIFO of recorded command buffers
#[derive(Debug, Default)]
pub struct SubmissionAggregator {
    buffers: VecDeque<RecordedCommandBuffer>,
    stats: AggregatorStats,
}

impl SubmissionAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a recorded buffer
    ///
    /// Task counts must strictly increase through the FIFO.
    pub fn record_command_buffer(&mut self, buffer: RecordedCommandBuffer) {
        if let Some(last) = self.buffers.back() {
            assert!(
                last.task_count < buffer.task_count,
                "task count {} recorded after {}",
                buffer.task_count,
                last.task_count
            );
        }
        self.stats.recorded += 1;
        self.buffers.push_back(buffer);
    }

    /// Pending buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Oldest pending buffer
    pub fn peek_head(&self) -> Option<&RecordedCommandBuffer> {
        self.buffers.front()
    }

    /// Pending buffers, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &RecordedCommandBuffer> {
        self.buffers.iter()
    }

    /// Get statistics
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Pick the run length and collect its unique surfaces
    fn select_run(&self, limits: &AggregationLimits) -> (usize, ResidencyContainer, u64) {
        let mut seen: HashSet<AllocationId> = HashSet::new();
        let mut surfaces = ResidencyContainer::new();
        let mut bytes = 0u64;
        let Some(head) = self.buffers.front() else {
            return (0, surfaces, bytes);
        };

        let mut count = 0;
        for buffer in &self.buffers {
            if count > 0 {
                if limits.split_on_hint_mismatch && buffer.hints != head.hints {
                    break;
                }
                if let Some(budget) = limits.resource_budget {
                    let added: u64 = buffer
                        .surfaces
                        .iter()
                        .filter(|s| !seen.contains(&s.id()))
                        .map(|s| s.size().as_bytes())
                        .sum();
                    if bytes + added > budget.as_bytes() {
                        break;
                    }
                }
            }

            for surface in &buffer.surfaces {
                if seen.insert(surface.id()) {
                    bytes += surface.size().as_bytes();
                    surfaces.push(Arc::clone(surface));
                }
            }
            count += 1;
        }
        (count, surfaces, bytes)
    }

    /// Patch the front of the FIFO into one chain
    ///
    /// Returns `None` when nothing is pending. The FIFO itself is left
    /// untouched; call [`SubmissionAggregator::retire_run`] once the
    /// submission succeeded.
    pub fn prepare_run(
        &self,
        encoder: &dyn CommandEncoder,
        limits: &AggregationLimits,
    ) -> Result<Option<ChainedRun>> {
        let (count, surfaces, resource_bytes) = self.select_run(limits);
        if count == 0 {
            return Ok(None);
        }

        let mut elided_barriers = 0;
        let mut fallthrough_joins = 0;
        let mut stamps = FlushStampUpdateHelper::new();
        for index in 0..count {
            let current = &self.buffers[index];
            stamps.insert(current.flush_stamp.stamp_object());

            let Some(next) = self.buffers.get(index + 1).filter(|_| index + 1 < count) else {
                continue;
            };
            let target = next.start_address();
            if fallthrough_address(&current.batch_end) == target {
                current.batch_end.patch_noop()?;
                fallthrough_joins += 1;
            } else {
                encoder.patch_jump(&current.batch_end, target)?;
            }
            if let Some(barrier) = &current.erasable_barrier {
                if current.task_level == next.task_level {
                    barrier.patch_noop()?;
                    elided_barriers += 1;
                }
            }
        }

        let head = &self.buffers[0];
        let tail = &self.buffers[count - 1];
        encoder.set_barrier_dc_flush(&tail.epilogue_barrier, true)?;

        let mut batch = head.batch_buffer();
        batch.task_count = tail.task_count;
        batch.chained_buffers = count;

        log::trace!(
            "Aggregator: run of {} buffers, tasks {}..={}, {} barriers elided, {} fallthrough joins, {} surfaces",
            count,
            head.task_count,
            tail.task_count,
            elided_barriers,
            fallthrough_joins,
            surfaces.len()
        );

        Ok(Some(ChainedRun {
            batch,
            surfaces,
            resource_bytes,
            buffer_count: count,
            elided_barriers,
            fallthrough_joins,
            last_task_count: tail.task_count,
            stamps,
        }))
    }

    /// Drop the first `count` buffers after their submission succeeded
    pub fn retire_run(&mut self, count: usize) {
        assert!(count <= self.buffers.len(), "retiring more buffers than pending");
        self.buffers.drain(..count);
        self.stats.runs_retired += 1;
        self.stats.buffers_retired += count as u64;
    }
}
