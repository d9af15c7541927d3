//! # MAGMA Memory Management
//!
//! Graphics allocations, residency stamps and GPU-timeline-safe release.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MAGMA Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                 MemoryManager (trait)                     │  │
//! │  │      allocate / free / is_memory_budget_exhausted         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌──────┴──────────┐  ┌────────────────┐   │
//! │  │  Address Space  │  │    Graphics     │  │  Allocation    │   │
//! │  │   (first fit)   │  │   Allocation    │  │   Storage      │   │
//! │  │                 │  │ (per-ctx stamps)│  │ (by task count)│   │
//! │  └─────────────────┘  └─────────────────┘  └────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifetime Rule
//!
//! An allocation is released only once the GPU has completed every
//! submission that referenced it. Recorded-but-unflushed work keeps its
//! allocations alive because their task counts are newer than anything
//! flushed.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod address_space;
pub mod allocation;
pub mod manager;
pub mod storage;

// Re-exports
pub use address_space::{AddressSpace, VaRange};
pub use allocation::{
    AllocFlags, AllocationId, AllocationProperties, AllocationType, GraphicsAllocation,
    MAX_OS_CONTEXTS, ResidencyContainer,
};
pub use manager::{MemoryManager, MemoryManagerConfig, MemoryStats, SystemMemoryManager};
pub use storage::{AllocationStorage, AllocationUsage, StorageStats};
