//! # MAGMA Command Layer
//!
//! Everything between a dispatch and a physical submission: command
//! streams, per-family encoders, preemption programming and the submission
//! aggregator that chains recorded buffers.
//!
//! ## Recorded Buffer Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ preemption reprogramming (only on mode change)             │
//! │ task-level barrier       (only when the level advanced)    │
//! │ dispatch instructions                                      │
//! │ epilogue barrier  ── post-sync: task count → completion tag│
//! │ BB_END + no-op padding (room for a BB_START)               │
//! │ no-op padding to the cache line                            │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod aggregator;
pub mod buffer;
pub mod commands;
pub mod encoder;
pub mod preemption;
pub mod stream;

pub use aggregator::{AggregationLimits, AggregatorStats, ChainedRun, SubmissionAggregator};
pub use buffer::{BatchBuffer, RecordedCommandBuffer, SubmissionHints, Throttle};
pub use commands::{DecodedCommand, MiLoadRegisterImm, PipeControlFlags, decode};
pub use encoder::{BarrierArgs, CommandEncoder, Gen9Encoder, Gen12Encoder, encoder_for};
pub use preemption::{
    PreemptionCommand, PreemptionConfig, PreemptionRequest, PreemptionState, task_preemption_mode,
};
pub use stream::{CommandStream, PatchKind, PatchPoint};
