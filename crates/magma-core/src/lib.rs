//! # MAGMA Core
//!
//! Foundational types, errors and synchronization primitives shared by the
//! submission core.
//!
//! Nothing in this crate touches hardware. It defines the vocabulary the
//! other crates speak: GPU addresses, task counts, flush stamps, preemption
//! modes, and the immutable [`HardwareInfo`] every component is configured
//! from.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │  Hardware   │  │     Error           │  │
//! │  │ (GpuAddr,   │  │   Info      │  │   Handling          │  │
//! │  │  TaskCount) │  │ (per device)│  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Sync: completion tag, flush stamp objects            │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod hw;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use hw::{GpuFamily, HardwareInfo, Workarounds};
pub use sync::{CompletionTag, FlushStampObject, FlushStampTracker, FlushStampUpdateHelper};
pub use types::*;
