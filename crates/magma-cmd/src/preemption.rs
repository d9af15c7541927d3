//! # Preemption Programming
//!
//! Tracks the mode last programmed on an engine and emits the register
//! writes needed to move to a new one.
//!
//! ## Mode Transitions
//!
//! ```text
//!   any ──(same mode)──────────────────────────────▶ nothing emitted
//!   any ──(Disabled | MidBatch)────────────────────▶ LRI(cmd level)
//!   any ──(ThreadGroup)──────[sentinel]────────────▶ LRI(thread group)
//!   any ──(MidThread)────────[sentinel]────────────▶ LRI(mid thread)
//!                                                    + CSR base if the save
//!                                                      area is not yet bound
//! ```
//!
//! Size queries and emission share one plan, so the bytes reserved always
//! match the bytes written.

use arrayvec::ArrayVec;
use magma_core::{Error, GpuAddr, HardwareInfo, PreemptionMode, Result, Workarounds};

use crate::encoder::CommandEncoder;
use crate::stream::CommandStream;

/// General purpose register used for the preemption sentinel
pub const CS_GPR_R0: u32 = 0x2600;
/// Sentinel value written before reprogramming
pub const SENTINEL_BEGIN: u32 = 0xFFFF_FFFF;
/// Sentinel value written after reprogramming
pub const SENTINEL_END: u32 = 0;

// =============================================================================
// REGISTER CONFIGURATION
// =============================================================================

/// Per-family preemption control register layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptionConfig {
    /// MMIO offset of the control register
    pub mmio_address: u32,
    /// Masked-write enable bits
    pub mask: u32,
    /// Value selecting thread-group preemption
    pub thread_group: u32,
    /// Value selecting command-level preemption
    pub cmd_level: u32,
    /// Value selecting mid-thread preemption
    pub mid_thread: u32,
}

impl PreemptionConfig {
    /// Register value programming `mode`
    ///
    /// Disabled and MidBatch share the command-level encoding.
    pub fn register_value(&self, mode: PreemptionMode) -> Option<u32> {
        let value = match mode {
            PreemptionMode::Unprogrammed => return None,
            PreemptionMode::Disabled | PreemptionMode::MidBatch => self.cmd_level,
            PreemptionMode::ThreadGroup => self.thread_group,
            PreemptionMode::MidThread => self.mid_thread,
        };
        Some(self.mask | value)
    }
}

// =============================================================================
// TASK MODE SELECTION
// =============================================================================

/// Per-dispatch inputs to mode selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreemptionRequest {
    /// Explicit mode instead of the device default
    pub override_mode: Option<PreemptionMode>,
    /// Work must not be preempted
    pub disable: bool,
    /// Work cannot save mid-thread state
    pub no_mid_thread: bool,
}

/// Mode a dispatch runs with
///
/// The requested (or default) mode is capped by the device maximum, then
/// downgraded by the request's restrictions.
pub fn task_preemption_mode(hw: &HardwareInfo, request: &PreemptionRequest) -> PreemptionMode {
    let requested = request.override_mode.unwrap_or(hw.default_preemption_mode);
    let mut mode = requested.min(hw.max_preemption_mode);
    if request.disable {
        mode = PreemptionMode::Disabled;
    } else if request.no_mid_thread && mode == PreemptionMode::MidThread {
        mode = PreemptionMode::ThreadGroup;
    }
    mode
}

// =============================================================================
// PROGRAMMING STATE
// =============================================================================

/// One planned preemption command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionCommand {
    /// Register write
    LoadRegister {
        /// MMIO offset
        register: u32,
        /// Value
        value: u32,
    },
    /// Bind the context save area
    SaveAreaBase(GpuAddr),
}

/// Planned command sequence, at most sentinel + write + base + sentinel
pub type PreemptionPlan = ArrayVec<PreemptionCommand, 4>;

/// Mode currently programmed on one engine
#[derive(Debug, Clone)]
pub struct PreemptionState {
    current: PreemptionMode,
    save_area: Option<GpuAddr>,
    reprogram_count: u64,
}

impl Default for PreemptionState {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptionState {
    /// Nothing programmed yet
    pub const fn new() -> Self {
        Self {
            current: PreemptionMode::Unprogrammed,
            save_area: None,
            reprogram_count: 0,
        }
    }

    /// Last programmed mode
    pub fn current(&self) -> PreemptionMode {
        self.current
    }

    /// Save area last bound
    pub fn save_area(&self) -> Option<GpuAddr> {
        self.save_area
    }

    /// Number of transitions emitted
    pub fn reprogram_count(&self) -> u64 {
        self.reprogram_count
    }

    fn needs_save_area(&self, new_mode: PreemptionMode, save_area: Option<GpuAddr>) -> bool {
        new_mode == PreemptionMode::MidThread && save_area.is_some() && self.save_area != save_area
    }

    /// Commands moving the engine to `new_mode`
    pub fn plan(
        &self,
        config: &PreemptionConfig,
        hw: &HardwareInfo,
        new_mode: PreemptionMode,
        save_area: Option<GpuAddr>,
    ) -> PreemptionPlan {
        let mut plan = PreemptionPlan::new();
        let Some(value) = config.register_value(new_mode) else {
            return plan;
        };
        if new_mode == self.current {
            return plan;
        }

        let sentinel = hw.has_workaround(Workarounds::PREEMPTION_SENTINEL)
            && matches!(new_mode, PreemptionMode::ThreadGroup | PreemptionMode::MidThread);

        if sentinel {
            plan.push(PreemptionCommand::LoadRegister {
                register: CS_GPR_R0,
                value: SENTINEL_BEGIN,
            });
        }
        plan.push(PreemptionCommand::LoadRegister {
            register: config.mmio_address,
            value,
        });
        if self.needs_save_area(new_mode, save_area) {
            if let Some(address) = save_area {
                plan.push(PreemptionCommand::SaveAreaBase(address));
            }
        }
        if sentinel {
            plan.push(PreemptionCommand::LoadRegister {
                register: CS_GPR_R0,
                value: SENTINEL_END,
            });
        }
        plan
    }

    /// Bytes of register writes a transition to `new_mode` emits
    pub fn required_cmd_stream_size(
        &self,
        encoder: &dyn CommandEncoder,
        hw: &HardwareInfo,
        new_mode: PreemptionMode,
    ) -> usize {
        self.plan(&encoder.preemption_config(), hw, new_mode, None)
            .iter()
            .filter(|cmd| matches!(cmd, PreemptionCommand::LoadRegister { .. }))
            .count()
            * encoder.load_register_imm_size()
    }

    /// Bytes of save-area programming a transition to `new_mode` emits
    pub fn required_preamble_size(
        &self,
        encoder: &dyn CommandEncoder,
        new_mode: PreemptionMode,
        save_area: Option<GpuAddr>,
    ) -> usize {
        if self.current != new_mode && self.needs_save_area(new_mode, save_area) {
            encoder.csr_base_address_size()
        } else {
            0
        }
    }

    /// Emit the transition to `new_mode`, returning the bytes written
    ///
    /// MidThread requires `save_area`.
    pub fn program(
        &mut self,
        stream: &mut CommandStream,
        encoder: &dyn CommandEncoder,
        hw: &HardwareInfo,
        new_mode: PreemptionMode,
        save_area: Option<GpuAddr>,
    ) -> Result<usize> {
        if new_mode == PreemptionMode::MidThread && save_area.is_none() {
            return Err(Error::InvalidParameter);
        }

        let plan = self.plan(&encoder.preemption_config(), hw, new_mode, save_area);
        if plan.is_empty() {
            return Ok(0);
        }

        let start = stream.used();
        for command in &plan {
            match *command {
                PreemptionCommand::LoadRegister { register, value } => {
                    encoder.emit_load_register_imm(stream, register, value)?;
                }
                PreemptionCommand::SaveAreaBase(address) => {
                    encoder.emit_csr_base_address(stream, address)?;
                    self.save_area = Some(address);
                }
            }
        }

        log::debug!(
            "Preemption: {:?} -> {:?} ({} commands)",
            self.current,
            new_mode,
            plan.len()
        );
        self.current = new_mode;
        self.reprogram_count += 1;
        Ok(stream.used() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{DecodedCommand, decode};
    use crate::encoder::encoder_for;
    use alloc::sync::Arc;
    use magma_core::ByteSize;
    use magma_mem::{AllocationId, AllocationProperties, AllocationType, GraphicsAllocation};

    fn stream() -> CommandStream {
        let props = AllocationProperties::new(ByteSize::from_kib(4), AllocationType::CommandBuffer);
        let alloc = GraphicsAllocation::new(AllocationId::new(1), GpuAddr::new(0x10_0000), &props);
        CommandStream::new(Arc::new(alloc)).unwrap()
    }

    fn emitted(stream: &CommandStream) -> alloc::vec::Vec<DecodedCommand> {
        stream
            .allocation()
            .with_cpu_view(|bytes| decode(&bytes[..stream.used()]))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_task_mode_selection() {
        let hw = HardwareInfo::gen9();
        let default = PreemptionRequest::default();
        assert_eq!(task_preemption_mode(&hw, &default), PreemptionMode::MidThread);

        let no_mid = PreemptionRequest {
            no_mid_thread: true,
            ..Default::default()
        };
        assert_eq!(task_preemption_mode(&hw, &no_mid), PreemptionMode::ThreadGroup);

        let disabled = PreemptionRequest {
            disable: true,
            ..Default::default()
        };
        assert_eq!(task_preemption_mode(&hw, &disabled), PreemptionMode::Disabled);

        let mut capped = HardwareInfo::gen12();
        capped.max_preemption_mode = PreemptionMode::MidBatch;
        let request = PreemptionRequest {
            override_mode: Some(PreemptionMode::MidThread),
            ..Default::default()
        };
        assert_eq!(task_preemption_mode(&capped, &request), PreemptionMode::MidBatch);
    }

    #[test]
    fn test_register_values() {
        let config = encoder_for(&HardwareInfo::gen9()).preemption_config();
        let mask = (0b110) << 16;
        assert_eq!(config.register_value(PreemptionMode::ThreadGroup), Some(mask | 1 << 1));
        assert_eq!(config.register_value(PreemptionMode::MidBatch), Some(mask | 1 << 2));
        assert_eq!(config.register_value(PreemptionMode::Disabled), Some(mask | 1 << 2));
        assert_eq!(config.register_value(PreemptionMode::MidThread), Some(mask));
        assert_eq!(config.register_value(PreemptionMode::Unprogrammed), None);
    }

    #[test]
    fn test_size_queries_match_emission() {
        for hw in [HardwareInfo::gen9(), HardwareInfo::gen12()] {
            let encoder = encoder_for(&hw);
            let save_area = Some(GpuAddr::new(0x4000_0000));
            let modes = [
                PreemptionMode::MidThread,
                PreemptionMode::MidThread,
                PreemptionMode::ThreadGroup,
                PreemptionMode::Disabled,
                PreemptionMode::MidBatch,
                PreemptionMode::MidThread,
            ];
            let mut state = PreemptionState::new();
            let mut stream = stream();
            for mode in modes {
                let expected = state.required_cmd_stream_size(&*encoder, &hw, mode)
                    + state.required_preamble_size(&*encoder, mode, save_area);
                let written = state.program(&mut stream, &*encoder, &hw, mode, save_area).unwrap();
                assert_eq!(written, expected, "{:?} on {}", mode, hw.name);
                assert_eq!(state.current(), mode);
            }
        }
    }

    #[test]
    fn test_sentinel_brackets_mid_thread() {
        let hw = HardwareInfo::gen9();
        let encoder = encoder_for(&hw);
        let config = encoder.preemption_config();
        let save_area = GpuAddr::new(0x4000_0000);
        let mut state = PreemptionState::new();
        let mut stream = stream();

        let written = state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::MidThread, Some(save_area))
            .unwrap();
        assert_eq!(written, 3 * 12 + 12);
        assert_eq!(
            emitted(&stream),
            alloc::vec![
                DecodedCommand::LoadRegisterImm {
                    register: CS_GPR_R0,
                    value: SENTINEL_BEGIN,
                },
                DecodedCommand::LoadRegisterImm {
                    register: config.mmio_address,
                    value: config.mask | config.mid_thread,
                },
                DecodedCommand::CsrBaseAddress { address: save_area },
                DecodedCommand::LoadRegisterImm {
                    register: CS_GPR_R0,
                    value: SENTINEL_END,
                },
            ]
        );
    }

    #[test]
    fn test_no_sentinel_for_cmd_level() {
        let hw = HardwareInfo::gen9();
        let encoder = encoder_for(&hw);
        let mut state = PreemptionState::new();
        let mut stream = stream();
        let written = state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::MidBatch, None)
            .unwrap();
        assert_eq!(written, 12);
        assert_eq!(emitted(&stream).len(), 1);
    }

    #[test]
    fn test_unchanged_mode_emits_nothing() {
        let hw = HardwareInfo::gen12();
        let encoder = encoder_for(&hw);
        let mut state = PreemptionState::new();
        let mut stream = stream();
        state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::ThreadGroup, None)
            .unwrap();
        let used = stream.used();
        assert_eq!(
            state.required_cmd_stream_size(&*encoder, &hw, PreemptionMode::ThreadGroup),
            0
        );
        state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::ThreadGroup, None)
            .unwrap();
        assert_eq!(stream.used(), used);
        assert_eq!(state.reprogram_count(), 1);
    }

    #[test]
    fn test_save_area_bound_once() {
        let hw = HardwareInfo::gen12();
        let encoder = encoder_for(&hw);
        let save_area = Some(GpuAddr::new(0x4000_0000));
        let mut state = PreemptionState::new();
        let mut stream = stream();

        state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::MidThread, save_area)
            .unwrap();
        state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::ThreadGroup, None)
            .unwrap();
        let written = state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::MidThread, save_area)
            .unwrap();
        assert_eq!(written, 12);
        assert_eq!(state.save_area(), save_area);
    }

    #[test]
    fn test_mid_thread_requires_save_area() {
        let hw = HardwareInfo::gen12();
        let encoder = encoder_for(&hw);
        let mut state = PreemptionState::new();
        let mut stream = stream();
        let err = state
            .program(&mut stream, &*encoder, &hw, PreemptionMode::MidThread, None)
            .unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
        assert_eq!(stream.used(), 0);
        assert_eq!(state.current(), PreemptionMode::Unprogrammed);
    }
}
