//! # Command Stream Receiver
//!
//! Records dispatches into one command stream and turns them into physical
//! submissions, either one per dispatch or chained in batches.
//!
//! ## Flow
//!
//! ```text
//!  record(dispatch)
//!     │  budget check ──(exhausted)──▶ flush pending
//!     │  size query + capacity check (may switch stream allocation)
//!     │  emit: preemption │ level barrier │ instructions │ epilogue │ end
//!     │  residency
//!     ├─ Immediate ──▶ backend.submit()
//!     └─ Batched   ──▶ aggregator ──(BLOCKING / IMPLICIT_FLUSH)──▶ flush()
//!
//!  flush()
//!     └─ per run: prepare chain ─▶ backend.submit() ─▶ retire, publish stamps
//! ```
//!
//! ## Locking
//!
//! Everything that mutates the stream, the aggregator, residency or the
//! preemption state happens under one `spin::Mutex`. Counters are atomics
//! readable without it, and completion waits spin outside it.

use alloc::sync::Arc;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use magma_cmd::{
    BarrierArgs, CommandEncoder, CommandStream, RecordedCommandBuffer, PreemptionState,
    SubmissionAggregator, encoder_for, task_preemption_mode,
};
use magma_core::memory_constants::{CACHE_LINE_SIZE, PAGE_SIZE_64K};
use magma_core::{
    ByteSize, CompletionTag, Error, FlushStamp, FlushStampTracker, GpuAddr, HardwareInfo,
    PreemptionMode, Result, TASK_LEVEL_NOT_READY, TaskCount, TaskLevel, align_up,
};
use magma_mem::{
    AllocationProperties, AllocationStorage, AllocationType, AllocationUsage, GraphicsAllocation,
    MemoryManager, ResidencyContainer,
};

use crate::backend::SubmissionBackend;
use crate::config::{CsrConfig, DispatchMode};
use crate::dispatch::{CompletionStamp, DispatchDescriptor, DispatchHints};

// =============================================================================
// STATISTICS
// =============================================================================

/// Receiver statistics
#[derive(Debug, Clone, Default)]
pub struct CsrStats {
    /// Dispatches recorded
    pub records: u64,
    /// Physical submissions
    pub submissions: u64,
    /// Failed physical submissions
    pub failed_submissions: u64,
    /// Buffers joined to a predecessor by a jump
    pub chained_buffers: u64,
    /// Epilogue barriers turned into no-ops
    pub elided_barriers: u64,
    /// Flushes forced by memory budget pressure
    pub budget_flushes: u64,
    /// Flushes triggered by dispatch flags
    pub implicit_flushes: u64,
    /// Command stream allocation switches
    pub stream_reallocations: u64,
}

// =============================================================================
// RECEIVER
// =============================================================================

struct CsrState<B> {
    backend: B,
    command_stream: CommandStream,
    aggregator: SubmissionAggregator,
    /// Allocations made resident for the next record
    residency: ResidencyContainer,
    /// Bytes made resident since the last physical submission
    total_memory_used: u64,
    preemption: PreemptionState,
    preemption_allocation: Option<Arc<GraphicsAllocation>>,
    storage: AllocationStorage,
    flush_stamp: FlushStampTracker,
    stats: CsrStats,
}

/// Command stream receiver for one submission endpoint
pub struct CommandStreamReceiver<B: SubmissionBackend> {
    hw: Arc<HardwareInfo>,
    config: CsrConfig,
    encoder: Arc<dyn CommandEncoder>,
    memory_manager: Arc<dyn MemoryManager>,
    tag: Arc<CompletionTag>,
    tag_allocation: Arc<GraphicsAllocation>,
    /// Last assigned task count
    task_count: AtomicU32,
    /// Current task level
    task_level: AtomicU32,
    /// Tail task count of the last physical submission
    latest_flushed_task_count: AtomicU32,
    /// Physical submissions
    flush_count: AtomicU64,
    state: spin::Mutex<CsrState<B>>,
}

impl<B: SubmissionBackend> CommandStreamReceiver<B> {
    /// Create a receiver driving `backend`
    pub fn new(
        hw: Arc<HardwareInfo>,
        config: CsrConfig,
        memory_manager: Arc<dyn MemoryManager>,
        mut backend: B,
    ) -> Result<Self> {
        hw.validate()?;
        config.validate()?;

        let encoder = encoder_for(&hw);
        let tag_allocation = memory_manager.allocate_graphics_memory(&AllocationProperties::new(
            ByteSize::from_kib(4),
            AllocationType::TagBuffer,
        ))?;
        let tag = Arc::new(CompletionTag::new(tag_allocation.gpu_addr()));
        backend.bind_completion_tag(Arc::clone(&tag));

        let stream_size = config.command_buffer_size.align_up(PAGE_SIZE_64K);
        let stream_allocation = memory_manager.allocate_graphics_memory(&AllocationProperties::new(
            stream_size,
            AllocationType::CommandBuffer,
        ))?;
        let command_stream = CommandStream::new(stream_allocation)?;

        log::debug!(
            "CSR: {} encoder, context {}, {:?} dispatch, {} command buffer",
            encoder.name(),
            config.os_context,
            config.dispatch_mode,
            stream_size
        );

        Ok(Self {
            encoder,
            tag,
            tag_allocation,
            task_count: AtomicU32::new(0),
            task_level: AtomicU32::new(0),
            latest_flushed_task_count: AtomicU32::new(0),
            flush_count: AtomicU64::new(0),
            state: spin::Mutex::new(CsrState {
                backend,
                command_stream,
                aggregator: SubmissionAggregator::new(),
                residency: ResidencyContainer::new(),
                total_memory_used: 0,
                preemption: PreemptionState::new(),
                preemption_allocation: None,
                storage: AllocationStorage::new(config.os_context),
                flush_stamp: FlushStampTracker::new(),
                stats: CsrStats::default(),
            }),
            hw,
            config,
            memory_manager,
        })
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record a dispatch
    ///
    /// In batched mode the returned flush stamp is 0 until the work is
    /// flushed; callers wanting the final stamp pass a stamp object.
    pub fn record(&self, dispatch: &DispatchDescriptor) -> Result<CompletionStamp> {
        assert!(
            dispatch.task_level < TASK_LEVEL_NOT_READY,
            "dispatch recorded before its level is ready"
        );
        if dispatch.instructions.len() % 4 != 0 {
            return Err(Error::InvalidParameter);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let batched = self.config.dispatch_mode == DispatchMode::Batched;
        let hints = dispatch.hints;

        if batched && self.is_over_memory_budget(state) {
            log::warn!(
                "CSR: memory budget exhausted with {} resident, flushing {} pending buffers",
                ByteSize::from_bytes(state.total_memory_used),
                state.aggregator.len()
            );
            state.stats.budget_flushes += 1;
            self.flush_batched_submissions(state)?;
        }

        let task_count = self.task_count.load(Ordering::Acquire) + 1;

        let preemption_mode = task_preemption_mode(&self.hw, &dispatch.preemption_request());
        let save_area = if preemption_mode == PreemptionMode::MidThread {
            Some(self.ensure_preemption_allocation(state)?)
        } else {
            None
        };
        let save_address = save_area.as_ref().map(|a| a.gpu_addr());

        let guarded = hints.contains(DispatchHints::GUARD_WITH_BARRIER);
        let dc_flush = hints.contains(DispatchHints::DC_FLUSH) || (!batched && guarded);
        let level_closed = !batched
            && hints.intersects(
                DispatchHints::BLOCKING | DispatchHints::DC_FLUSH | DispatchHints::GUARD_WITH_BARRIER,
            );
        let current_level = self.task_level.load(Ordering::Acquire);
        let ordering_barrier =
            dispatch.task_level > current_level && !self.config.timestamp_packet_write_enabled;

        let stall = BarrierArgs::default();
        let epilogue_args = BarrierArgs {
            dc_flush,
            post_sync: Some((self.tag.gpu_addr(), task_count as u64)),
        };

        let encoder = &*self.encoder;
        let ordering_size = if ordering_barrier {
            encoder.barrier_size(&stall)
        } else {
            0
        };
        let required = state
            .preemption
            .required_cmd_stream_size(encoder, &self.hw, preemption_mode)
            + state
                .preemption
                .required_preamble_size(encoder, preemption_mode, save_address)
            + ordering_size
            + dispatch.instructions.len()
            + encoder.barrier_size(&epilogue_args)
            + encoder.batch_end_size()
            + CACHE_LINE_SIZE;
        self.ensure_command_stream_space(state, required)?;

        // Emission
        let preemption_before = state.preemption.clone();
        let stream = &mut state.command_stream;
        let start_offset = stream.used();
        state
            .preemption
            .program(stream, encoder, &self.hw, preemption_mode, save_address)?;
        if ordering_barrier {
            encoder.emit_barrier(stream, &stall)?;
        }
        if dispatch.task_level > current_level {
            self.task_level.store(dispatch.task_level, Ordering::Release);
        }
        stream.emit_bytes(&dispatch.instructions)?;
        let epilogue_barrier = encoder.emit_barrier(stream, &epilogue_args)?;
        let batch_end = encoder.emit_batch_end(stream)?;
        stream.align_to(CACHE_LINE_SIZE)?;
        let end_offset = stream.used();
        debug_assert!(end_offset - start_offset <= required);
        let stream_allocation = Arc::clone(stream.allocation());

        // Residency
        for allocation in &dispatch.allocations {
            self.make_resident_locked(state, allocation);
        }
        if let Some(save_area) = &save_area {
            self.make_resident_locked(state, save_area);
        }
        self.make_resident_locked(state, &self.tag_allocation);
        self.make_resident_locked(state, &stream_allocation);

        let erasable = self.is_barrier_erasable(hints, dc_flush);
        let mut flush_stamp = FlushStampTracker::new();
        if let Some(object) = &dispatch.flush_stamp {
            flush_stamp.replace_stamp_object(Arc::clone(object));
        }
        let buffer = RecordedCommandBuffer {
            allocation: stream_allocation,
            start_offset,
            end_offset,
            surfaces: mem::take(&mut state.residency),
            erasable_barrier: erasable.then(|| epilogue_barrier.clone()),
            epilogue_barrier,
            batch_end,
            task_count,
            task_level: dispatch.task_level,
            hints: dispatch.submission_hints(),
            flush_stamp,
        };

        log::trace!(
            "CSR: recorded task {} at level {} ({} bytes, {} surfaces{})",
            task_count,
            dispatch.task_level,
            end_offset - start_offset,
            buffer.surfaces.len(),
            if erasable { ", erasable" } else { "" }
        );

        match self.config.dispatch_mode {
            DispatchMode::Immediate => {
                if let Err(e) = self.submit_immediate(state, &buffer) {
                    // Nothing reached the device; undo the record
                    state.command_stream.rewind(start_offset);
                    state.preemption = preemption_before;
                    state.residency = buffer.surfaces;
                    self.task_level.store(current_level, Ordering::Release);
                    return Err(e);
                }
            }
            DispatchMode::Batched => state.aggregator.record_command_buffer(buffer),
        }
        self.task_count.store(task_count, Ordering::Release);
        state.stats.records += 1;

        if level_closed {
            self.task_level.fetch_add(1, Ordering::AcqRel);
        }
        if batched && hints.intersects(DispatchHints::BLOCKING | DispatchHints::IMPLICIT_FLUSH) {
            state.stats.implicit_flushes += 1;
            self.flush_batched_submissions(state)?;
        }

        Ok(CompletionStamp {
            task_count,
            task_level: self.task_level.load(Ordering::Acquire),
            flush_stamp: state.flush_stamp.peek_stamp(),
        })
    }

    /// Erasable when a chained successor at the same level makes it redundant
    fn is_barrier_erasable(&self, hints: DispatchHints, dc_flush: bool) -> bool {
        let out_of_order =
            hints.contains(DispatchHints::OUT_OF_ORDER) && !self.config.n_to_1_submission_model;
        !dc_flush && (out_of_order || self.config.timestamp_packet_write_enabled)
    }

    fn is_over_memory_budget(&self, state: &CsrState<B>) -> bool {
        self.memory_manager.is_memory_budget_exhausted()
            && state.total_memory_used >= self.hw.global_mem_size.as_bytes() / 4
    }

    fn ensure_preemption_allocation(&self, state: &mut CsrState<B>) -> Result<Arc<GraphicsAllocation>> {
        if let Some(allocation) = &state.preemption_allocation {
            return Ok(Arc::clone(allocation));
        }
        let properties = AllocationProperties::new(self.hw.preemption_surface_size, AllocationType::Preemption)
            .with_alignment(self.hw.preemption_surface_alignment);
        let allocation = self.memory_manager.allocate_graphics_memory(&properties)?;
        log::debug!(
            "CSR: preemption save area at {} ({})",
            allocation.gpu_addr(),
            allocation.size()
        );
        state.preemption_allocation = Some(Arc::clone(&allocation));
        Ok(allocation)
    }

    /// Switch to a new command buffer when `required` bytes do not fit
    fn ensure_command_stream_space(&self, state: &mut CsrState<B>, required: usize) -> Result<()> {
        if state.command_stream.available_space() >= required {
            return Ok(());
        }

        let size = ByteSize::from_bytes(align_up(
            required as u64 + self.config.command_buffer_size.as_bytes(),
            PAGE_SIZE_64K,
        ));
        let reused = state.storage.obtain_reusable_allocation(
            size,
            AllocationType::CommandBuffer,
            self.tag.completed(),
        );
        let allocation = match reused {
            Some(allocation) => allocation,
            None => self
                .memory_manager
                .allocate_graphics_memory(&AllocationProperties::new(size, AllocationType::CommandBuffer))?,
        };

        let previous = state.command_stream.replace_allocation(allocation)?;
        log::debug!(
            "CSR: command buffer {} exhausted, continuing in {} ({})",
            previous.gpu_addr(),
            state.command_stream.gpu_base(),
            size
        );
        state.storage.store_allocation(previous, AllocationUsage::Reusable);
        state.stats.stream_reallocations += 1;
        Ok(())
    }

    fn submit_immediate(&self, state: &mut CsrState<B>, buffer: &RecordedCommandBuffer) -> Result<()> {
        let batch = buffer.batch_buffer();
        let stamp = match state.backend.submit(&batch, &buffer.surfaces) {
            Ok(stamp) => stamp,
            Err(e) => {
                state.stats.failed_submissions += 1;
                log::warn!("CSR: submission of task {} failed: {}", buffer.task_count, e);
                return Err(e);
            }
        };

        self.latest_flushed_task_count
            .store(buffer.task_count, Ordering::Release);
        self.flush_count.fetch_add(1, Ordering::AcqRel);
        buffer.flush_stamp.set_stamp(stamp);
        state.flush_stamp.set_stamp(stamp);
        self.make_surfaces_non_resident(&buffer.surfaces);
        state.total_memory_used = 0;
        state.stats.submissions += 1;
        Ok(())
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Submit every pending buffer
    ///
    /// On a back end failure the failed run and everything after it stay
    /// pending.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_batched_submissions(&mut state)
    }

    fn flush_batched_submissions(&self, state: &mut CsrState<B>) -> Result<()> {
        let context = self.config.os_context;
        while let Some(run) = state
            .aggregator
            .prepare_run(&*self.encoder, &self.config.aggregation)?
        {
            for surface in &run.surfaces {
                surface.set_resident(context);
            }

            let stamp = match state.backend.submit(&run.batch, &run.surfaces) {
                Ok(stamp) => stamp,
                Err(e) => {
                    state.stats.failed_submissions += 1;
                    log::warn!(
                        "CSR: submission of tasks up to {} failed: {}, {} buffers stay pending",
                        run.last_task_count,
                        e,
                        state.aggregator.len()
                    );
                    return Err(e);
                }
            };

            state.aggregator.retire_run(run.buffer_count);
            self.latest_flushed_task_count
                .store(run.last_task_count, Ordering::Release);
            self.task_level.fetch_add(1, Ordering::AcqRel);
            self.flush_count.fetch_add(1, Ordering::AcqRel);
            run.stamps.update_all(stamp);
            state.flush_stamp.set_stamp(stamp);
            self.make_surfaces_non_resident(&run.surfaces);

            state.stats.submissions += 1;
            state.stats.chained_buffers += run.buffer_count as u64 - 1;
            state.stats.elided_barriers += run.elided_barriers as u64;
            state.total_memory_used = 0;

            log::debug!(
                "CSR: flushed {} buffers up to task {} ({} barriers elided, {} surfaces, stamp {})",
                run.buffer_count,
                run.last_task_count,
                run.elided_barriers,
                run.surfaces.len(),
                stamp
            );
        }
        Ok(())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Block until `task_count` completed, flushing first if needed
    pub fn wait_for_completion(&self, task_count: TaskCount) -> Result<()> {
        if task_count > self.task_count() {
            return Err(Error::InvalidParameter);
        }
        if self.latest_flushed_task_count() < task_count {
            let mut state = self.state.lock();
            if self.latest_flushed_task_count() < task_count {
                self.flush_batched_submissions(&mut state)?;
            }
        }
        self.tag.wait(task_count, self.config.wait_spin_limit)
    }

    /// Block until everything recorded so far completed
    pub fn finish(&self) -> Result<()> {
        self.wait_for_completion(self.task_count())
    }

    /// Release stored allocations the GPU is done with
    ///
    /// Waits for the last flushed task count first; nothing newer than it is
    /// ever released.
    pub fn cleanup_resources(&self) -> Result<()> {
        let bound = self.latest_flushed_task_count();
        self.tag.wait(bound, self.config.wait_spin_limit)?;

        let mut state = self.state.lock();
        let mm = &*self.memory_manager;
        let released = state
            .storage
            .clean_allocation_list(bound, AllocationUsage::Temporary, mm)
            + state
                .storage
                .clean_allocation_list(bound, AllocationUsage::Reusable, mm);
        if released > 0 {
            log::debug!("CSR: released {} allocations up to task {}", released, bound);
        }
        Ok(())
    }

    // =========================================================================
    // Residency
    // =========================================================================

    /// Make `allocation` resident for the next record
    pub fn make_resident(&self, allocation: &Arc<GraphicsAllocation>) {
        let mut state = self.state.lock();
        self.make_resident_locked(&mut state, allocation);
    }

    fn make_resident_locked(&self, state: &mut CsrState<B>, allocation: &Arc<GraphicsAllocation>) {
        let context = self.config.os_context;
        let task_count = self.task_count.load(Ordering::Acquire) + 1;
        if allocation.is_residency_task_count_below(task_count, context) {
            state.residency.push(Arc::clone(allocation));
            allocation.update_task_count(task_count, context);
            if !allocation.is_resident(context) {
                state.total_memory_used += allocation.size().as_bytes();
                allocation.set_resident(context);
            }
        }
        allocation.update_residency_task_count(task_count, context);
    }

    /// Drop residency of `allocation` on this endpoint
    pub fn make_non_resident(&self, allocation: &GraphicsAllocation) {
        allocation.release_residency(self.config.os_context);
    }

    fn make_surfaces_non_resident(&self, surfaces: &[Arc<GraphicsAllocation>]) {
        for surface in surfaces {
            self.make_non_resident(surface);
        }
    }

    // =========================================================================
    // Allocation storage
    // =========================================================================

    /// Hand an allocation over for release once the GPU is done with it
    pub fn store_allocation(&self, allocation: Arc<GraphicsAllocation>, usage: AllocationUsage) {
        self.state.lock().storage.store_allocation(allocation, usage);
    }

    /// Take a completed reusable allocation
    pub fn obtain_reusable_allocation(
        &self,
        size: ByteSize,
        alloc_type: AllocationType,
    ) -> Option<Arc<GraphicsAllocation>> {
        let completed = self.tag.completed();
        self.state
            .lock()
            .storage
            .obtain_reusable_allocation(size, alloc_type, completed)
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Last assigned task count
    pub fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    /// Current task level
    pub fn task_level(&self) -> TaskLevel {
        self.task_level.load(Ordering::Acquire)
    }

    /// Tail task count of the last physical submission
    pub fn latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed_task_count.load(Ordering::Acquire)
    }

    /// Physical submissions so far
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Acquire)
    }

    /// Recorded buffers not yet submitted
    pub fn pending_count(&self) -> usize {
        self.state.lock().aggregator.len()
    }

    /// Bytes made resident since the last physical submission
    pub fn total_memory_used(&self) -> ByteSize {
        ByteSize::from_bytes(self.state.lock().total_memory_used)
    }

    /// Preemption mode last programmed
    pub fn preemption_mode(&self) -> PreemptionMode {
        self.state.lock().preemption.current()
    }

    /// Context save area, once a MidThread dispatch created it
    pub fn preemption_save_area(&self) -> Option<GpuAddr> {
        self.state
            .lock()
            .preemption_allocation
            .as_ref()
            .map(|a| a.gpu_addr())
    }

    /// Stamp of the last physical submission
    pub fn flush_stamp(&self) -> FlushStamp {
        self.state.lock().flush_stamp.peek_stamp()
    }

    /// Snapshot of statistics
    pub fn stats(&self) -> CsrStats {
        self.state.lock().stats.clone()
    }

    /// Completion tag written by epilogue barriers
    pub fn completion_tag(&self) -> &Arc<CompletionTag> {
        &self.tag
    }

    /// Device description
    pub fn hardware_info(&self) -> &HardwareInfo {
        &self.hw
    }

    /// Configuration
    pub fn config(&self) -> &CsrConfig {
        &self.config
    }

    /// Encoder in use
    pub fn encoder(&self) -> &dyn CommandEncoder {
        &*self.encoder
    }
}

impl<B: SubmissionBackend> fmt::Debug for CommandStreamReceiver<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("hw", &self.hw.name)
            .field("encoder", &self.encoder.name())
            .field("dispatch_mode", &self.config.dispatch_mode)
            .field("task_count", &self.task_count())
            .field("task_level", &self.task_level())
            .field("latest_flushed_task_count", &self.latest_flushed_task_count())
            .field("flush_count", &self.flush_count())
            .field("completed", &self.tag.completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImmediateBackend, NullBackend};
    use crate::backend::testing::{RecordingBackend, SubmissionLog};
    use alloc::vec;
    use alloc::vec::Vec;
    use magma_cmd::preemption::CS_GPR_R0;
    use magma_cmd::{AggregationLimits, DecodedCommand, MiLoadRegisterImm, PipeControlFlags};
    use magma_core::FlushStampObject;
    use magma_mem::{MemoryManagerConfig, SystemMemoryManager};

    type TestCsr = CommandStreamReceiver<RecordingBackend>;

    fn setup(hw: HardwareInfo, config: CsrConfig) -> (TestCsr, Arc<SubmissionLog>, Arc<SystemMemoryManager>) {
        let mm = Arc::new(SystemMemoryManager::new(MemoryManagerConfig::for_device(&hw)));
        let (backend, log) = RecordingBackend::new();
        let csr = CommandStreamReceiver::new(Arc::new(hw), config, mm.clone(), backend).unwrap();
        (csr, log, mm)
    }

    fn kernel(value: u32) -> DispatchDescriptor {
        DispatchDescriptor::new(MiLoadRegisterImm::new(0x2000, value).as_bytes())
    }

    fn surface(mm: &SystemMemoryManager, size: ByteSize) -> Arc<GraphicsAllocation> {
        mm.allocate_graphics_memory(&AllocationProperties::new(size, AllocationType::Buffer))
            .unwrap()
    }

    fn decode_range(allocation: &GraphicsAllocation, start: usize, end: usize) -> Vec<DecodedCommand> {
        allocation
            .with_cpu_view(|bytes| magma_cmd::decode(&bytes[start..end]))
            .unwrap()
            .unwrap()
    }

    fn submitted_commands(csr: &TestCsr, log: &SubmissionLog) -> Vec<DecodedCommand> {
        let submitted = log.last().unwrap();
        let end = csr.state.lock().command_stream.used();
        decode_range(&submitted.batch.allocation, submitted.batch.start_offset, end)
    }

    fn epilogues(commands: &[DecodedCommand]) -> Vec<(PipeControlFlags, u64)> {
        commands
            .iter()
            .filter_map(|c| match c {
                DecodedCommand::PipeControl {
                    flags,
                    post_sync: Some((_, value)),
                } => Some((*flags, *value)),
                _ => None,
            })
            .collect()
    }

    fn count(commands: &[DecodedCommand], pred: impl Fn(&DecodedCommand) -> bool) -> usize {
        commands.iter().filter(|c| pred(c)).count()
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    #[test]
    fn test_batched_records_single_submission() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        for i in 0..5 {
            let stamp = csr.record(&kernel(i)).unwrap();
            assert_eq!(stamp.task_count, i + 1);
            assert_eq!(stamp.flush_stamp, 0);
        }
        assert_eq!(log.count(), 0);
        assert_eq!(csr.pending_count(), 5);

        csr.flush().unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(csr.flush_count(), 1);
        assert_eq!(csr.latest_flushed_task_count(), 5);
        assert_eq!(csr.pending_count(), 0);

        let submitted = log.last().unwrap();
        assert_eq!(submitted.batch.task_count, 5);
        assert_eq!(submitted.batch.chained_buffers, 5);
        assert_eq!(csr.stats().chained_buffers, 4);

        csr.flush().unwrap();
        assert_eq!(log.count(), 1);
    }

    #[test]
    fn test_out_of_order_chain_elides_barriers() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        for i in 0..3 {
            csr.record(&kernel(i).at_level(0).with_hints(DispatchHints::OUT_OF_ORDER))
                .unwrap();
        }
        csr.flush().unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(csr.latest_flushed_task_count(), 3);
        assert_eq!(csr.stats().elided_barriers, 2);

        let commands = submitted_commands(&csr, &log);
        let surviving = epilogues(&commands);
        assert_eq!(surviving.len(), 1);
        let (flags, value) = surviving[0];
        assert_eq!(value, 3);
        assert!(flags.contains(PipeControlFlags::DC_FLUSH));
        assert_eq!(
            count(&commands, |c| matches!(c, DecodedCommand::BatchBufferStart { .. })),
            0
        );
        assert_eq!(count(&commands, |c| *c == DecodedCommand::BatchBufferEnd), 1);
    }

    #[test]
    fn test_in_order_chain_keeps_barriers() {
        let (csr, log, _mm) = setup(HardwareInfo::gen9(), CsrConfig::default());
        for i in 0..3 {
            csr.record(&kernel(i)).unwrap();
        }
        csr.flush().unwrap();
        assert_eq!(csr.stats().elided_barriers, 0);

        let values: Vec<u64> = epilogues(&submitted_commands(&csr, &log))
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_level_change_blocks_elision() {
        let (csr, _log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let ooo = DispatchHints::OUT_OF_ORDER;
        csr.record(&kernel(0).at_level(0).with_hints(ooo)).unwrap();
        csr.record(&kernel(1).at_level(0).with_hints(ooo)).unwrap();
        csr.record(&kernel(2).at_level(1).with_hints(ooo)).unwrap();
        assert_eq!(csr.task_level(), 1);

        csr.flush().unwrap();
        assert_eq!(csr.stats().elided_barriers, 1);
        assert_eq!(csr.task_level(), 2);
    }

    #[test]
    fn test_erasable_predicate() {
        let timestamps = CsrConfig {
            timestamp_packet_write_enabled: true,
            ..Default::default()
        };
        let (csr, _log, _mm) = setup(HardwareInfo::gen12(), timestamps);
        csr.record(&kernel(0)).unwrap();
        csr.record(&kernel(1)).unwrap();
        csr.flush().unwrap();
        assert_eq!(csr.stats().elided_barriers, 1);

        let n_to_1 = CsrConfig {
            n_to_1_submission_model: true,
            ..Default::default()
        };
        let (csr, _log, _mm) = setup(HardwareInfo::gen12(), n_to_1);
        csr.record(&kernel(0).with_hints(DispatchHints::OUT_OF_ORDER)).unwrap();
        csr.record(&kernel(1).with_hints(DispatchHints::OUT_OF_ORDER)).unwrap();
        csr.flush().unwrap();
        assert_eq!(csr.stats().elided_barriers, 0);

        let (csr, _log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        csr.record(&kernel(0).with_hints(DispatchHints::OUT_OF_ORDER | DispatchHints::DC_FLUSH))
            .unwrap();
        csr.record(&kernel(1).with_hints(DispatchHints::OUT_OF_ORDER)).unwrap();
        csr.flush().unwrap();
        assert_eq!(csr.stats().elided_barriers, 0);
    }

    #[test]
    fn test_ordering_barrier_on_level_advance() {
        let (csr, _log, _mm) = setup(HardwareInfo::gen9(), CsrConfig::default());
        csr.record(&kernel(0)).unwrap();
        csr.record(&kernel(1).at_level(2)).unwrap();
        assert_eq!(csr.task_level(), 2);

        let state = csr.state.lock();
        let second = state.aggregator.iter().nth(1).unwrap();
        let commands = decode_range(&second.allocation, second.start_offset, second.end_offset);
        assert_eq!(
            commands[0],
            DecodedCommand::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                post_sync: None,
            }
        );
        assert_eq!(second.task_level, 2);
    }

    #[test]
    fn test_hint_split_with_stamps() {
        let hw = HardwareInfo::gen12();
        let config = CsrConfig {
            aggregation: AggregationLimits::conservative(&hw),
            ..Default::default()
        };
        let (csr, log, _mm) = setup(hw, config);
        let objects: Vec<_> = (0..3).map(|_| Arc::new(FlushStampObject::new())).collect();
        let hints = [DispatchHints::empty(), DispatchHints::empty(), DispatchHints::LOW_PRIORITY];
        for (i, (object, hint)) in objects.iter().zip(hints).enumerate() {
            let dispatch = kernel(i as u32)
                .with_hints(hint)
                .with_flush_stamp(Arc::clone(object));
            csr.record(&dispatch).unwrap();
        }

        csr.flush().unwrap();
        assert_eq!(log.count(), 2);
        assert_eq!(objects[0].peek(), 101);
        assert_eq!(objects[1].peek(), 101);
        assert_eq!(objects[2].peek(), 102);
        assert_eq!(csr.flush_stamp(), 102);
        assert!(log.last().unwrap().batch.hints.low_priority);
    }

    #[test]
    fn test_stream_reallocation_keeps_chain() {
        let config = CsrConfig {
            command_buffer_size: ByteSize::from_kib(4),
            ..Default::default()
        };
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), config);
        let payload = vec![0u8; 16 * 1024];
        for _ in 0..4 {
            let dispatch = DispatchDescriptor::new(payload.clone()).with_hints(DispatchHints::OUT_OF_ORDER);
            csr.record(&dispatch).unwrap();
        }
        assert_eq!(csr.stats().stream_reallocations, 1);

        let (third_end, fourth_start, first_base) = {
            let state = csr.state.lock();
            let buffers: Vec<_> = state.aggregator.iter().collect();
            assert_eq!(state.storage.len(AllocationUsage::Reusable), 1);
            (
                buffers[2].batch_end.clone(),
                buffers[3].start_address(),
                buffers[0].allocation.gpu_addr(),
            )
        };
        assert_ne!(third_end.allocation().gpu_addr(), fourth_start);

        csr.flush().unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(log.last().unwrap().batch.start_address(), first_base);
        assert_eq!(
            csr.encoder().decode(&third_end.read().unwrap()).unwrap(),
            vec![DecodedCommand::BatchBufferStart { target: fourth_start }]
        );
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    #[test]
    fn test_backend_failure_keeps_pending_work() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        log.fail.store(true, Ordering::Relaxed);
        csr.record(&kernel(0)).unwrap();
        csr.record(&kernel(1)).unwrap();

        assert_eq!(csr.flush(), Err(Error::SubmissionFailed));
        assert_eq!(csr.finish(), Err(Error::SubmissionFailed));
        assert_eq!(csr.pending_count(), 2);
        assert_eq!(csr.latest_flushed_task_count(), 0);
        assert_eq!(csr.stats().failed_submissions, 2);

        log.fail.store(false, Ordering::Relaxed);
        csr.flush().unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(csr.latest_flushed_task_count(), 2);
        csr.finish().unwrap();
    }

    #[test]
    fn test_wait_timeout_with_null_backend() {
        let hw = HardwareInfo::gen12();
        let mm = Arc::new(SystemMemoryManager::new(MemoryManagerConfig::for_device(&hw)));
        let config = CsrConfig {
            wait_spin_limit: Some(1_000),
            ..Default::default()
        };
        let csr = CommandStreamReceiver::new(Arc::new(hw), config, mm, NullBackend::new()).unwrap();
        let stamp = csr.record(&kernel(0)).unwrap();

        assert_eq!(csr.wait_for_completion(stamp.task_count), Err(Error::FenceTimeout));
        assert_eq!(csr.flush_count(), 1);
        assert_eq!(csr.wait_for_completion(5), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_immediate_backend_round_trip() {
        let hw = HardwareInfo::gen9();
        let mm = Arc::new(SystemMemoryManager::new(MemoryManagerConfig::for_device(&hw)));
        let csr =
            CommandStreamReceiver::new(Arc::new(hw), CsrConfig::default(), mm, ImmediateBackend::new()).unwrap();
        let stamps: Vec<_> = (0..3).map(|i| csr.record(&kernel(i)).unwrap()).collect();
        assert!(!csr.completion_tag().is_completed(stamps[0].task_count));

        csr.wait_for_completion(stamps[1].task_count).unwrap();
        assert_eq!(csr.completion_tag().completed(), 3);
        assert_eq!(csr.flush_stamp(), 1);
        csr.finish().unwrap();
        assert_eq!(csr.flush_count(), 1);
    }

    #[test]
    fn test_invalid_instruction_length() {
        let (csr, _log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let err = csr.record(&DispatchDescriptor::new([0u8; 6])).unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
        assert_eq!(csr.task_count(), 0);
        assert_eq!(csr.state.lock().command_stream.used(), 0);
    }

    // =========================================================================
    // Immediate mode
    // =========================================================================

    #[test]
    fn test_immediate_mode_submits_each_record() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::immediate());
        let first = csr.record(&kernel(0)).unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(first.flush_stamp, 101);
        assert_eq!(csr.latest_flushed_task_count(), 1);
        assert_eq!(csr.pending_count(), 0);

        let level = csr.task_level();
        csr.record(&kernel(1).with_hints(DispatchHints::BLOCKING)).unwrap();
        assert_eq!(csr.task_level(), level + 1);
        csr.record(&kernel(2)).unwrap();
        assert_eq!(csr.task_level(), level + 1);

        csr.record(&kernel(3).with_hints(DispatchHints::GUARD_WITH_BARRIER)).unwrap();
        assert_eq!(log.count(), 4);
        let last = log.last().unwrap();
        let commands = decode_range(&last.batch.allocation, last.batch.start_offset, last.batch.used_size);
        let guarded = epilogues(&commands);
        assert_eq!(guarded.len(), 1);
        assert!(guarded[0].0.contains(PipeControlFlags::DC_FLUSH));
        assert_eq!(guarded[0].1, 4);

        csr.finish().unwrap();
    }

    #[test]
    fn test_immediate_failure_does_not_advance() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::immediate());
        log.fail.store(true, Ordering::Relaxed);
        assert_eq!(csr.record(&kernel(0)), Err(Error::SubmissionFailed));
        assert_eq!(csr.task_count(), 0);
        assert_eq!(csr.pending_count(), 0);
    }

    #[test]
    fn test_immediate_failure_rolls_back_record() {
        let (csr, log, mm) = setup(HardwareInfo::gen9(), CsrConfig::immediate());
        let buffer = surface(&mm, ByteSize::from_mib(1));
        let level = csr.task_level();
        log.fail.store(true, Ordering::Relaxed);
        assert_eq!(
            csr.record(&kernel(0).with_allocation(Arc::clone(&buffer))),
            Err(Error::SubmissionFailed)
        );
        assert_eq!(csr.preemption_mode(), PreemptionMode::Unprogrammed);
        assert_eq!(csr.task_level(), level);
        {
            let state = csr.state.lock();
            assert_eq!(state.command_stream.used(), 0);
            assert!(state.residency.iter().any(|a| a.id() == buffer.id()));
        }

        log.fail.store(false, Ordering::Relaxed);
        let stamp = csr.record(&kernel(1)).unwrap();
        assert_eq!(stamp.task_count, 1);
        assert_eq!(csr.preemption_mode(), PreemptionMode::MidThread);
        assert!(!buffer.is_resident(0));

        let submitted = log.last().unwrap();
        assert_eq!(submitted.batch.start_offset, 0);
        assert!(submitted.residency.iter().any(|a| a.id() == buffer.id()));

        let commands = decode_range(
            &submitted.batch.allocation,
            submitted.batch.start_offset,
            submitted.batch.used_size,
        );
        let config = csr.encoder().preemption_config();
        assert_eq!(
            count(&commands, |c| *c
                == DecodedCommand::LoadRegisterImm {
                    register: config.mmio_address,
                    value: config.mask | config.mid_thread,
                }),
            1
        );
        assert_eq!(epilogues(&commands).last().map(|e| e.1), Some(1));
    }

    #[test]
    fn test_implicit_flush() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        csr.record(&kernel(0)).unwrap();
        csr.record(&kernel(1).with_hints(DispatchHints::IMPLICIT_FLUSH)).unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(csr.pending_count(), 0);
        assert_eq!(csr.latest_flushed_task_count(), 2);

        let stamp = csr.record(&kernel(2).with_hints(DispatchHints::BLOCKING)).unwrap();
        assert_eq!(log.count(), 2);
        assert_eq!(stamp.flush_stamp, 102);
        assert_eq!(csr.stats().implicit_flushes, 2);
    }

    // =========================================================================
    // Preemption
    // =========================================================================

    #[test]
    fn test_preemption_programmed_on_change_only() {
        let (csr, log, _mm) = setup(HardwareInfo::gen9(), CsrConfig::default());
        assert_eq!(csr.preemption_mode(), PreemptionMode::Unprogrammed);

        csr.record(&kernel(0)).unwrap();
        assert_eq!(csr.preemption_mode(), PreemptionMode::MidThread);
        let save_area = csr.preemption_save_area().unwrap();
        assert!(save_area.is_aligned(256 * 1024));

        csr.record(&kernel(1)).unwrap();
        csr.record(&kernel(2).with_hints(DispatchHints::NO_MID_THREAD)).unwrap();
        assert_eq!(csr.preemption_mode(), PreemptionMode::ThreadGroup);
        csr.flush().unwrap();

        let commands = submitted_commands(&csr, &log);
        let config = csr.encoder().preemption_config();
        let writes: Vec<u32> = commands
            .iter()
            .filter_map(|c| match c {
                DecodedCommand::LoadRegisterImm { register, value } if *register == config.mmio_address => {
                    Some(*value)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![config.mask | config.mid_thread, config.mask | config.thread_group]
        );
        assert_eq!(
            count(&commands, |c| *c == DecodedCommand::CsrBaseAddress { address: save_area }),
            1
        );
        assert_eq!(
            count(&commands, |c| matches!(
                c,
                DecodedCommand::LoadRegisterImm { register, .. } if *register == CS_GPR_R0
            )),
            4
        );
        assert!(log
            .last()
            .unwrap()
            .residency
            .iter()
            .any(|a| a.gpu_addr() == save_area));
    }

    #[test]
    fn test_disabled_preemption_dispatch() {
        let (csr, _log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        csr.record(&kernel(0).with_hints(DispatchHints::DISABLE_PREEMPTION)).unwrap();
        assert_eq!(csr.preemption_mode(), PreemptionMode::Disabled);
        assert!(csr.preemption_save_area().is_none());
    }

    // =========================================================================
    // Residency and lifetime
    // =========================================================================

    #[test]
    fn test_residency_counted_once_per_window() {
        let (csr, log, mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let buffer = surface(&mm, ByteSize::from_mib(1));
        csr.make_resident(&buffer);
        csr.make_resident(&buffer);
        assert_eq!(csr.total_memory_used(), ByteSize::from_mib(1));
        assert_eq!(csr.state.lock().residency.len(), 1);
        assert!(buffer.is_resident(0));
        assert_eq!(buffer.task_count(0), 1);

        csr.record(&kernel(0).with_allocation(Arc::clone(&buffer))).unwrap();
        csr.flush().unwrap();
        assert!(!buffer.is_resident(0));
        assert_eq!(csr.total_memory_used(), ByteSize::ZERO);

        let submitted = log.last().unwrap();
        let listed = submitted
            .residency
            .iter()
            .filter(|a| a.id() == buffer.id())
            .count();
        assert_eq!(listed, 1);
    }

    #[test]
    fn test_budget_pressure_flushes_eagerly() {
        let (csr, log, mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let huge = [
            surface(&mm, ByteSize::from_gib(2)),
            surface(&mm, ByteSize::from_gib(2)),
        ];
        mm.set_memory_pressure(true);

        csr.record(&kernel(0)).unwrap();
        assert_eq!(log.count(), 0);
        csr.make_resident(&huge[0]);
        assert!(csr.total_memory_used() >= ByteSize::from_gib(2));
        csr.record(&kernel(1)).unwrap();
        assert_eq!(log.count(), 1);
        csr.make_resident(&huge[1]);
        csr.record(&kernel(2)).unwrap();
        assert_eq!(log.count(), 2);
        assert_eq!(csr.stats().budget_flushes, 2);
        assert_eq!(csr.pending_count(), 1);
    }

    #[test]
    fn test_no_eager_flush_without_pressure() {
        let (csr, log, mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let huge = surface(&mm, ByteSize::from_gib(2));
        csr.record(&kernel(0)).unwrap();
        csr.make_resident(&huge);
        csr.record(&kernel(1)).unwrap();
        assert_eq!(log.count(), 0);
        assert_eq!(csr.pending_count(), 2);
    }

    #[test]
    fn test_empty_flush_keeps_tracked_memory() {
        let (csr, log, mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let huge = surface(&mm, ByteSize::from_gib(2));
        csr.make_resident(&huge);
        csr.flush().unwrap();
        assert_eq!(log.count(), 0);
        assert_eq!(csr.total_memory_used(), ByteSize::from_gib(2));

        mm.set_memory_pressure(true);
        csr.record(&kernel(0)).unwrap();
        assert_eq!(log.count(), 0);
        csr.record(&kernel(1)).unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(csr.stats().budget_flushes, 2);
        assert!(csr.total_memory_used() < ByteSize::from_gib(2));
    }

    #[test]
    fn test_cleanup_never_releases_pending_work() {
        let (csr, _log, mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let scratch = surface(&mm, ByteSize::from_kib(64));
        csr.record(&kernel(0).with_allocation(Arc::clone(&scratch))).unwrap();
        assert_eq!(scratch.task_count(0), 1);
        csr.store_allocation(scratch, AllocationUsage::Temporary);

        let frees = mm.stats().frees;
        csr.cleanup_resources().unwrap();
        assert_eq!(mm.stats().frees, frees);

        csr.flush().unwrap();
        csr.cleanup_resources().unwrap();
        assert_eq!(mm.stats().frees, frees + 1);
    }

    #[test]
    fn test_reusable_allocation_after_completion() {
        let (csr, _log, mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let staging = mm
            .allocate_graphics_memory(&AllocationProperties::new(
                ByteSize::from_kib(64),
                AllocationType::CommandBuffer,
            ))
            .unwrap();
        csr.record(&kernel(0).with_allocation(Arc::clone(&staging))).unwrap();
        csr.store_allocation(staging, AllocationUsage::Reusable);

        let size = ByteSize::from_kib(32);
        assert!(csr
            .obtain_reusable_allocation(size, AllocationType::CommandBuffer)
            .is_none());
        csr.finish().unwrap();
        assert!(csr
            .obtain_reusable_allocation(size, AllocationType::CommandBuffer)
            .is_some());
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[test]
    fn test_concurrent_records() {
        let (csr, log, _mm) = setup(HardwareInfo::gen12(), CsrConfig::default());
        let csr = Arc::new(csr);
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let csr = Arc::clone(&csr);
                std::thread::spawn(move || {
                    (0..25u32)
                        .map(|i| csr.record(&kernel(t * 100 + i)).unwrap().task_count)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut task_counts: Vec<TaskCount> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        task_counts.sort_unstable();
        assert_eq!(task_counts, (1..=100).collect::<Vec<_>>());

        csr.finish().unwrap();
        assert_eq!(log.count(), 1);
        assert_eq!(csr.latest_flushed_task_count(), 100);
        assert_eq!(csr.completion_tag().completed(), 100);
    }
}
