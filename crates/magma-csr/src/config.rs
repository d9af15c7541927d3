//! Receiver configuration.

use magma_cmd::AggregationLimits;
use magma_core::{ByteSize, Error, OsContextId, Result};
use magma_mem::MAX_OS_CONTEXTS;

/// How recorded work reaches the back end
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every record is submitted at once
    Immediate,
    /// Records queue in the aggregator until a flush
    #[default]
    Batched,
}

/// Command stream receiver configuration
#[derive(Debug, Clone, Copy)]
pub struct CsrConfig {
    /// Submission path
    pub dispatch_mode: DispatchMode,
    /// Submission endpoint this receiver drives
    pub os_context: OsContextId,
    /// Completion is tracked with timestamp packets
    pub timestamp_packet_write_enabled: bool,
    /// Several queues share one endpoint
    pub n_to_1_submission_model: bool,
    /// Minimum command buffer allocation size
    pub command_buffer_size: ByteSize,
    /// Bounds on chained runs
    pub aggregation: AggregationLimits,
    /// Polls before a completion wait gives up, `None` to wait forever
    pub wait_spin_limit: Option<u64>,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Batched,
            os_context: 0,
            timestamp_packet_write_enabled: false,
            n_to_1_submission_model: false,
            command_buffer_size: ByteSize::from_kib(64),
            aggregation: AggregationLimits::unlimited(),
            wait_spin_limit: None,
        }
    }
}

impl CsrConfig {
    /// Default configuration submitting every record at once
    pub fn immediate() -> Self {
        Self {
            dispatch_mode: DispatchMode::Immediate,
            ..Self::default()
        }
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.os_context as usize >= MAX_OS_CONTEXTS {
            return Err(Error::InvalidParameter);
        }
        if self.command_buffer_size.as_bytes() < 4096 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}
