//! Dispatch descriptors handed to the receiver, and what it hands back.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_cmd::{PreemptionRequest, SubmissionHints, Throttle};
use magma_core::{FlushStamp, FlushStampObject, PreemptionMode, TaskCount, TaskLevel};
use magma_mem::{GraphicsAllocation, ResidencyContainer};

bitflags::bitflags! {
    /// Per-dispatch behavior flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DispatchHints: u32 {
        /// The caller waits for this work right away
        const BLOCKING = 1 << 0;
        /// Flush the data cache after the work
        const DC_FLUSH = 1 << 1;
        /// The work may complete out of order with its queue
        const OUT_OF_ORDER = 1 << 2;
        /// Memory must stay CPU coherent while running
        const REQUIRES_COHERENCY = 1 << 3;
        /// Schedule at low priority
        const LOW_PRIORITY = 1 << 4;
        /// Guard the work with a full barrier
        const GUARD_WITH_BARRIER = 1 << 5;
        /// Flush pending work once this dispatch is recorded
        const IMPLICIT_FLUSH = 1 << 6;
        /// The work must not be preempted
        const DISABLE_PREEMPTION = 1 << 7;
        /// The work cannot save mid-thread state
        const NO_MID_THREAD = 1 << 8;
    }
}

/// One unit of work to record
#[derive(Debug, Clone, Default)]
pub struct DispatchDescriptor {
    /// Encoded instructions, a whole number of dwords
    pub instructions: Vec<u8>,
    /// Allocations the instructions reference
    pub allocations: ResidencyContainer,
    /// Dependency level
    pub task_level: TaskLevel,
    /// Behavior flags
    pub hints: DispatchHints,
    /// Back end throttle hint
    pub throttle: Throttle,
    /// Requested slice count, 0 for the device default
    pub slice_count: u32,
    /// Preemption mode instead of the device default
    pub preemption_mode: Option<PreemptionMode>,
    /// Receives the flush stamp of the carrying submission
    pub flush_stamp: Option<Arc<FlushStampObject>>,
}

impl DispatchDescriptor {
    /// Dispatch of `instructions` at level 0
    pub fn new(instructions: impl Into<Vec<u8>>) -> Self {
        Self {
            instructions: instructions.into(),
            ..Self::default()
        }
    }

    /// Reference an allocation
    pub fn with_allocation(mut self, allocation: Arc<GraphicsAllocation>) -> Self {
        self.allocations.push(allocation);
        self
    }

    /// Set the dependency level
    pub fn at_level(mut self, task_level: TaskLevel) -> Self {
        self.task_level = task_level;
        self
    }

    /// Add behavior flags
    pub fn with_hints(mut self, hints: DispatchHints) -> Self {
        self.hints |= hints;
        self
    }

    /// Override the preemption mode
    pub fn with_preemption_mode(mut self, mode: PreemptionMode) -> Self {
        self.preemption_mode = Some(mode);
        self
    }

    /// Publish the flush stamp into `object`
    pub fn with_flush_stamp(mut self, object: Arc<FlushStampObject>) -> Self {
        self.flush_stamp = Some(object);
        self
    }

    pub(crate) fn submission_hints(&self) -> SubmissionHints {
        SubmissionHints {
            requires_coherency: self.hints.contains(DispatchHints::REQUIRES_COHERENCY),
            low_priority: self.hints.contains(DispatchHints::LOW_PRIORITY),
            throttle: self.throttle,
            slice_count: self.slice_count,
        }
    }

    pub(crate) fn preemption_request(&self) -> PreemptionRequest {
        PreemptionRequest {
            override_mode: self.preemption_mode,
            disable: self.hints.contains(DispatchHints::DISABLE_PREEMPTION),
            no_mid_thread: self.hints.contains(DispatchHints::NO_MID_THREAD),
        }
    }
}

/// Identity of recorded work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStamp {
    /// Submission identifier; completes when the tag reaches it
    pub task_count: TaskCount,
    /// Level the work was recorded at
    pub task_level: TaskLevel,
    /// Flush stamp at record time, 0 while the work is still batched
    pub flush_stamp: FlushStamp,
}
