//! # Hardware Commands
//!
//! Dword layouts of the commands the submission core emits or patches, and a
//! decoder used to inspect recorded streams.
//!
//! ```text
//! MI_NOOP                 0x00000000                          4 bytes
//! MI_BATCH_BUFFER_END     0x05000000                          4 bytes
//! MI_BATCH_BUFFER_START   0x18800001  addr_lo  addr_hi       12 bytes
//! MI_LOAD_REGISTER_IMM    0x11000001  register  value        12 bytes
//! PIPE_CONTROL            0x7A000004  flags  addr_lo  addr_hi  data_lo  data_hi
//! GPGPU_CSR_BASE_ADDRESS  0x61040001  addr_lo  addr_hi       12 bytes
//! ```

use alloc::vec::Vec;
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use magma_core::{Error, GpuAddr, Result};
use static_assertions::const_assert_eq;

// =============================================================================
// HEADERS
// =============================================================================

/// MI_NOOP
pub const MI_NOOP: u32 = 0x0000_0000;
/// MI_BATCH_BUFFER_END
pub const MI_BATCH_BUFFER_END: u32 = 0x0500_0000;
/// MI_BATCH_BUFFER_START, second-level off, 48-bit address
pub const MI_BATCH_BUFFER_START: u32 = 0x1880_0001;
/// MI_LOAD_REGISTER_IMM, one register
pub const MI_LOAD_REGISTER_IMM: u32 = 0x1100_0001;
/// PIPE_CONTROL
pub const PIPE_CONTROL: u32 = 0x7A00_0004;
/// GPGPU_CSR_BASE_ADDRESS
pub const GPGPU_CSR_BASE_ADDRESS: u32 = 0x6104_0001;

bitflags::bitflags! {
    /// PIPE_CONTROL dword 1
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeControlFlags: u32 {
        /// Flush the data cache
        const DC_FLUSH = 1 << 5;
        /// Flush the HDC pipeline
        const HDC_PIPELINE_FLUSH = 1 << 9;
        /// Post-sync operation: write immediate data
        const POST_SYNC_WRITE_IMMEDIATE = 1 << 14;
        /// Stall the command streamer until prior work retires
        const CS_STALL = 1 << 20;
    }
}

// =============================================================================
// LAYOUTS
// =============================================================================

/// MI_BATCH_BUFFER_END
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MiBatchBufferEnd {
    /// Header dword
    pub header: u32,
}

impl MiBatchBufferEnd {
    /// Encode
    pub const fn new() -> Self {
        Self {
            header: MI_BATCH_BUFFER_END,
        }
    }
}

impl Default for MiBatchBufferEnd {
    fn default() -> Self {
        Self::new()
    }
}

/// MI_BATCH_BUFFER_START
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MiBatchBufferStart {
    /// Header dword
    pub header: u32,
    /// Target address bits 31:0
    pub address_low: u32,
    /// Target address bits 63:32
    pub address_high: u32,
}

impl MiBatchBufferStart {
    /// Encode a jump to `target`
    pub const fn new(target: GpuAddr) -> Self {
        Self {
            header: MI_BATCH_BUFFER_START,
            address_low: target.low(),
            address_high: target.high(),
        }
    }
}

/// MI_LOAD_REGISTER_IMM
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MiLoadRegisterImm {
    /// Header dword
    pub header: u32,
    /// MMIO offset
    pub register_offset: u32,
    /// Value written
    pub data: u32,
}

impl MiLoadRegisterImm {
    /// Encode a write of `value` to `register`
    pub const fn new(register: u32, value: u32) -> Self {
        Self {
            header: MI_LOAD_REGISTER_IMM,
            register_offset: register,
            data: value,
        }
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// PIPE_CONTROL
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PipeControl {
    /// Header dword
    pub header: u32,
    /// [`PipeControlFlags`] bits
    pub flags: u32,
    /// Post-sync address bits 31:0
    pub address_low: u32,
    /// Post-sync address bits 63:32
    pub address_high: u32,
    /// Immediate data bits 31:0
    pub data_low: u32,
    /// Immediate data bits 63:32
    pub data_high: u32,
}

impl PipeControl {
    /// Encode a stall-only barrier
    pub const fn stall() -> Self {
        Self {
            header: PIPE_CONTROL,
            flags: PipeControlFlags::CS_STALL.bits(),
            address_low: 0,
            address_high: 0,
            data_low: 0,
            data_high: 0,
        }
    }

    /// Encode a barrier with an optional immediate post-sync write
    pub fn new(flags: PipeControlFlags, post_sync: Option<(GpuAddr, u64)>) -> Self {
        let mut cmd = Self::stall();
        let mut flags = flags | PipeControlFlags::CS_STALL;
        if let Some((address, data)) = post_sync {
            flags |= PipeControlFlags::POST_SYNC_WRITE_IMMEDIATE;
            cmd.address_low = address.low();
            cmd.address_high = address.high();
            cmd.data_low = data as u32;
            cmd.data_high = (data >> 32) as u32;
        }
        cmd.flags = flags.bits();
        cmd
    }

    /// Decoded flag bits
    pub fn flags(&self) -> PipeControlFlags {
        PipeControlFlags::from_bits_retain(self.flags)
    }
}

/// GPGPU_CSR_BASE_ADDRESS
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpgpuCsrBaseAddress {
    /// Header dword
    pub header: u32,
    /// Save area bits 31:0
    pub address_low: u32,
    /// Save area bits 63:32
    pub address_high: u32,
}

impl GpgpuCsrBaseAddress {
    /// Encode
    pub const fn new(save_area: GpuAddr) -> Self {
        Self {
            header: GPGPU_CSR_BASE_ADDRESS,
            address_low: save_area.low(),
            address_high: save_area.high(),
        }
    }
}

const_assert_eq!(size_of::<MiBatchBufferEnd>(), 4);
const_assert_eq!(size_of::<MiBatchBufferStart>(), 12);
const_assert_eq!(size_of::<MiLoadRegisterImm>(), 12);
const_assert_eq!(size_of::<PipeControl>(), 24);
const_assert_eq!(size_of::<GpgpuCsrBaseAddress>(), 12);

// =============================================================================
// DECODER
// =============================================================================

/// One decoded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedCommand {
    /// MI_NOOP
    Noop,
    /// MI_BATCH_BUFFER_END
    BatchBufferEnd,
    /// MI_BATCH_BUFFER_START
    BatchBufferStart {
        /// Jump target
        target: GpuAddr,
    },
    /// MI_LOAD_REGISTER_IMM
    LoadRegisterImm {
        /// MMIO offset
        register: u32,
        /// Value written
        value: u32,
    },
    /// PIPE_CONTROL
    PipeControl {
        /// Flag bits
        flags: PipeControlFlags,
        /// Post-sync target and data when a write is requested
        post_sync: Option<(GpuAddr, u64)>,
    },
    /// GPGPU_CSR_BASE_ADDRESS
    CsrBaseAddress {
        /// Save area
        address: GpuAddr,
    },
}

fn read<T: Pod>(bytes: &[u8], offset: usize) -> Result<T> {
    let end = offset + size_of::<T>();
    if end > bytes.len() {
        return Err(Error::TruncatedCommand);
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[offset..end]))
}

/// Decode a command sequence
pub fn decode(bytes: &[u8]) -> Result<Vec<DecodedCommand>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::TruncatedCommand);
    }

    let mut commands = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let header: u32 = read(bytes, offset)?;
        let (command, size) = match header {
            MI_NOOP => (DecodedCommand::Noop, 4),
            MI_BATCH_BUFFER_END => (DecodedCommand::BatchBufferEnd, 4),
            MI_BATCH_BUFFER_START => {
                let cmd: MiBatchBufferStart = read(bytes, offset)?;
                let target = GpuAddr::from_parts(cmd.address_low, cmd.address_high);
                (DecodedCommand::BatchBufferStart { target }, size_of::<MiBatchBufferStart>())
            }
            MI_LOAD_REGISTER_IMM => {
                let cmd: MiLoadRegisterImm = read(bytes, offset)?;
                let command = DecodedCommand::LoadRegisterImm {
                    register: cmd.register_offset,
                    value: cmd.data,
                };
                (command, size_of::<MiLoadRegisterImm>())
            }
            PIPE_CONTROL => {
                let cmd: PipeControl = read(bytes, offset)?;
                let flags = cmd.flags();
                let post_sync = flags
                    .contains(PipeControlFlags::POST_SYNC_WRITE_IMMEDIATE)
                    .then(|| {
                        let address = GpuAddr::from_parts(cmd.address_low, cmd.address_high);
                        (address, ((cmd.data_high as u64) << 32) | cmd.data_low as u64)
                    });
                (DecodedCommand::PipeControl { flags, post_sync }, size_of::<PipeControl>())
            }
            GPGPU_CSR_BASE_ADDRESS => {
                let cmd: GpgpuCsrBaseAddress = read(bytes, offset)?;
                let address = GpuAddr::from_parts(cmd.address_low, cmd.address_high);
                (DecodedCommand::CsrBaseAddress { address }, size_of::<GpgpuCsrBaseAddress>())
            }
            other => {
                log::debug!("decode: unknown header {:#010x} at +{}", other, offset);
                return Err(Error::InvalidCommand);
            }
        };
        commands.push(command);
        offset += size;
    }
    Ok(commands)
}
