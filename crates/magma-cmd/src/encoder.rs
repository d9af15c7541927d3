//! # Command Encoders
//!
//! Per-family encoding of the commands the submission core emits. The
//! receiver picks an encoder once from [`HardwareInfo`] and talks to it
//! through [`CommandEncoder`] from then on.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;

use magma_core::{Error, GpuAddr, GpuFamily, HardwareInfo, Result, Workarounds};

use crate::commands::{
    self, DecodedCommand, GpgpuCsrBaseAddress, MiBatchBufferEnd, MiBatchBufferStart,
    MiLoadRegisterImm, PIPE_CONTROL, PipeControl, PipeControlFlags,
};
use crate::preemption::PreemptionConfig;
use crate::stream::{CommandStream, PatchKind, PatchPoint};

/// Preemption control register shared by the supported families
const CS_CHICKEN1: u32 = 0x2580;
const PREEMPTION_MASK: u32 = 0b110 << 16;

/// Barrier parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierArgs {
    /// Flush the data cache
    pub dc_flush: bool,
    /// Immediate write performed once prior work retires
    pub post_sync: Option<(GpuAddr, u64)>,
}

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Family-specific command encoding
pub trait CommandEncoder: Send + Sync + fmt::Debug {
    /// Family served
    fn family(&self) -> GpuFamily;

    /// Encoder name
    fn name(&self) -> &'static str;

    /// Bytes [`CommandEncoder::emit_barrier`] writes for `args`
    fn barrier_size(&self, args: &BarrierArgs) -> usize;

    /// Emit a barrier; the patch point covers every command it wrote
    fn emit_barrier(&self, stream: &mut CommandStream, args: &BarrierArgs) -> Result<PatchPoint>;

    /// Data cache flush bits for this family
    fn dc_flush_flags(&self) -> PipeControlFlags {
        PipeControlFlags::DC_FLUSH
    }

    /// Turn the data cache flush of an emitted barrier on or off
    fn set_barrier_dc_flush(&self, barrier: &PatchPoint, enable: bool) -> Result<()> {
        let pipe_control = size_of::<PipeControl>();
        let relative = barrier
            .len()
            .checked_sub(pipe_control)
            .ok_or(Error::TruncatedCommand)?;
        let bytes = barrier.read()?;
        let mut cmd: PipeControl =
            bytemuck::pod_read_unaligned(&bytes[relative..relative + pipe_control]);
        if cmd.header != PIPE_CONTROL {
            return Err(Error::InvalidCommand);
        }
        let mut flags = cmd.flags();
        flags.set(self.dc_flush_flags(), enable);
        cmd.flags = flags.bits();
        barrier.patch_at(relative, bytemuck::bytes_of(&cmd))
    }

    /// Bytes reserved for the batch end; always room for a jump
    fn batch_end_size(&self) -> usize {
        size_of::<MiBatchBufferStart>()
    }

    /// Emit a batch end padded to [`CommandEncoder::batch_end_size`]
    fn emit_batch_end(&self, stream: &mut CommandStream) -> Result<PatchPoint> {
        let offset = stream.emit(&MiBatchBufferEnd::new())?;
        stream.emit_noops(self.batch_end_size() - size_of::<MiBatchBufferEnd>())?;
        Ok(stream.patch_point(offset, self.batch_end_size(), PatchKind::BatchEnd))
    }

    /// Rewrite a batch end into a jump to `target`
    fn patch_jump(&self, batch_end: &PatchPoint, target: GpuAddr) -> Result<()> {
        debug_assert_eq!(batch_end.kind(), PatchKind::BatchEnd);
        batch_end.patch(bytemuck::bytes_of(&MiBatchBufferStart::new(target)))
    }

    /// Bytes of one register write
    fn load_register_imm_size(&self) -> usize {
        size_of::<MiLoadRegisterImm>()
    }

    /// Emit a register write
    fn emit_load_register_imm(&self, stream: &mut CommandStream, register: u32, value: u32) -> Result<()> {
        stream.emit(&MiLoadRegisterImm::new(register, value)).map(|_| ())
    }

    /// Bytes of the context save area binding
    fn csr_base_address_size(&self) -> usize {
        size_of::<GpgpuCsrBaseAddress>()
    }

    /// Bind the context save area
    fn emit_csr_base_address(&self, stream: &mut CommandStream, save_area: GpuAddr) -> Result<()> {
        stream.emit(&GpgpuCsrBaseAddress::new(save_area)).map(|_| ())
    }

    /// Preemption register layout
    fn preemption_config(&self) -> PreemptionConfig;

    /// Decode a command sequence
    fn decode(&self, bytes: &[u8]) -> Result<Vec<DecodedCommand>> {
        commands::decode(bytes)
    }
}

fn post_sync_barrier(flags: PipeControlFlags, args: &BarrierArgs) -> PipeControl {
    let flags = if args.dc_flush {
        flags
    } else {
        PipeControlFlags::empty()
    };
    PipeControl::new(flags, args.post_sync)
}

// =============================================================================
// GEN9
// =============================================================================

/// Gen9 encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen9Encoder;

impl CommandEncoder for Gen9Encoder {
    fn family(&self) -> GpuFamily {
        GpuFamily::Gen9
    }

    fn name(&self) -> &'static str {
        "gen9"
    }

    fn barrier_size(&self, _args: &BarrierArgs) -> usize {
        size_of::<PipeControl>()
    }

    fn emit_barrier(&self, stream: &mut CommandStream, args: &BarrierArgs) -> Result<PatchPoint> {
        stream.emit_patchable(&post_sync_barrier(self.dc_flush_flags(), args), PatchKind::Barrier)
    }

    fn preemption_config(&self) -> PreemptionConfig {
        PreemptionConfig {
            mmio_address: CS_CHICKEN1,
            mask: PREEMPTION_MASK,
            thread_group: 1 << 1,
            cmd_level: 1 << 2,
            mid_thread: 0,
        }
    }
}

// =============================================================================
// GEN12
// =============================================================================

/// Gen12 encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen12Encoder {
    /// Precede post-sync barriers with a stall-only barrier
    stall_before_post_sync: bool,
}

impl Gen12Encoder {
    /// Create an encoder for `hw`
    pub fn new(hw: &HardwareInfo) -> Self {
        Self {
            stall_before_post_sync: hw.has_workaround(Workarounds::STALL_BEFORE_POST_SYNC),
        }
    }

    fn needs_stall(&self, args: &BarrierArgs) -> bool {
        self.stall_before_post_sync && args.post_sync.is_some()
    }
}

impl CommandEncoder for Gen12Encoder {
    fn family(&self) -> GpuFamily {
        GpuFamily::Gen12
    }

    fn name(&self) -> &'static str {
        "gen12"
    }

    fn barrier_size(&self, args: &BarrierArgs) -> usize {
        let stall = if self.needs_stall(args) {
            size_of::<PipeControl>()
        } else {
            0
        };
        stall + size_of::<PipeControl>()
    }

    fn emit_barrier(&self, stream: &mut CommandStream, args: &BarrierArgs) -> Result<PatchPoint> {
        let start = stream.used();
        if self.needs_stall(args) {
            stream.emit(&PipeControl::stall())?;
        }
        stream.emit(&post_sync_barrier(self.dc_flush_flags(), args))?;
        Ok(stream.patch_point(start, stream.used() - start, PatchKind::Barrier))
    }

    fn dc_flush_flags(&self) -> PipeControlFlags {
        PipeControlFlags::DC_FLUSH | PipeControlFlags::HDC_PIPELINE_FLUSH
    }

    fn preemption_config(&self) -> PreemptionConfig {
        PreemptionConfig {
            mmio_address: CS_CHICKEN1,
            mask: PREEMPTION_MASK,
            thread_group: 1 << 1,
            cmd_level: 1 << 2,
            mid_thread: 0,
        }
    }
}

/// Encoder for the device described by `hw`
pub fn encoder_for(hw: &HardwareInfo) -> Arc<dyn CommandEncoder> {
    match hw.family {
        GpuFamily::Gen9 => Arc::new(Gen9Encoder),
        GpuFamily::Gen12 => Arc::new(Gen12Encoder::new(hw)),
    }
}
