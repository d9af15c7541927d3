//! # MAGMA Command Stream Receiver
//!
//! The per-endpoint front door of the submission path. Dispatches come in,
//! task counts go out, and physical submissions reach a back end either one
//! per dispatch or as chained runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   CommandStreamReceiver<B>                      │
//! │                                                                 │
//! │  record ──▶ CommandStream ──▶ SubmissionAggregator ──┐          │
//! │                 │                                    │ flush    │
//! │          PreemptionState                             ▼          │
//! │                                             SubmissionBackend   │
//! │  residency / AllocationStorage          (ImmediateBackend, ...) │
//! │                                                      │          │
//! │  wait_for_completion ◀──────── CompletionTag ◀───────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Counters
//!
//! - `task_count`: id of the last recorded dispatch
//! - `latest_flushed_task_count`: tail of the last physical submission
//! - completion tag: highest task count the device finished
//!
//! `completed <= latest_flushed_task_count <= task_count` always holds.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod receiver;

// Re-exports
pub use backend::{ImmediateBackend, NullBackend, SubmissionBackend};
pub use config::{CsrConfig, DispatchMode};
pub use dispatch::{CompletionStamp, DispatchDescriptor, DispatchHints};
pub use receiver::{CommandStreamReceiver, CsrStats};
