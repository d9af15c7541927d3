//! # Hardware Information
//!
//! Immutable per-device configuration, built once at enumeration time and
//! shared by reference. Every generation-dependent decision in the
//! submission core reads from here instead of a global table.

use crate::error::{Error, Result};
use crate::types::{ByteSize, PreemptionMode};

// =============================================================================
// GPU FAMILY
// =============================================================================

/// Command encoding family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuFamily {
    /// Gen9 class render/compute engines
    Gen9,
    /// Gen12 class render/compute engines
    Gen12,
}

// =============================================================================
// WORKAROUNDS
// =============================================================================

bitflags::bitflags! {
    /// Hardware revision workarounds
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Workarounds: u32 {
        /// Bracket ThreadGroup/MidThread reprogramming with sentinel writes
        const PREEMPTION_SENTINEL = 1 << 0;
        /// Emit a stall-only barrier ahead of every post-sync barrier
        const STALL_BEFORE_POST_SYNC = 1 << 1;
    }
}

// =============================================================================
// HARDWARE INFO
// =============================================================================

/// Device description consumed by every submission component
#[derive(Debug, Clone)]
pub struct HardwareInfo {
    /// Marketing / platform name
    pub name: &'static str,
    /// Encoding family
    pub family: GpuFamily,
    /// Global memory visible to the device
    pub global_mem_size: ByteSize,
    /// Finest preemption granularity the device supports
    pub max_preemption_mode: PreemptionMode,
    /// Mode used when a dispatch does not override it
    pub default_preemption_mode: PreemptionMode,
    /// Minimum size of the mid-thread context save area
    pub preemption_surface_size: ByteSize,
    /// Required alignment of the context save area
    pub preemption_surface_alignment: u64,
    /// Active workarounds
    pub workarounds: Workarounds,
}

impl HardwareInfo {
    /// Gen9 class device
    pub fn gen9() -> Self {
        Self {
            name: "gen9",
            family: GpuFamily::Gen9,
            global_mem_size: ByteSize::from_gib(4),
            max_preemption_mode: PreemptionMode::MidThread,
            default_preemption_mode: PreemptionMode::MidThread,
            preemption_surface_size: ByteSize::from_mib(1),
            preemption_surface_alignment: 256 * 1024,
            workarounds: Workarounds::PREEMPTION_SENTINEL,
        }
    }

    /// Gen12 class device
    pub fn gen12() -> Self {
        Self {
            name: "gen12",
            family: GpuFamily::Gen12,
            global_mem_size: ByteSize::from_gib(8),
            max_preemption_mode: PreemptionMode::MidThread,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            preemption_surface_size: ByteSize::from_mib(2),
            preemption_surface_alignment: 64 * 1024,
            workarounds: Workarounds::STALL_BEFORE_POST_SYNC,
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if !self.default_preemption_mode.is_programmed() || !self.max_preemption_mode.is_programmed() {
            return Err(Error::InvalidParameter);
        }
        if !self.preemption_surface_alignment.is_power_of_two() {
            return Err(Error::MisalignedAddress);
        }
        if self.global_mem_size == ByteSize::ZERO {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Whether a workaround applies
    #[inline]
    pub fn has_workaround(&self, wa: Workarounds) -> bool {
        self.workarounds.contains(wa)
    }

    /// Default mode capped by device capability
    #[inline]
    pub fn device_preemption_mode(&self) -> PreemptionMode {
        self.default_preemption_mode.min(self.max_preemption_mode)
    }
}
