//! # MAGMA Error Handling
//!
//! Error types for the submission core.
//!
//! Error handling follows these rules:
//! - Errors are typed and categorized
//! - Broken internal invariants assert instead of returning an error
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,
    /// Resource is busy
    Busy,
    /// Operation not supported on this hardware
    NotSupported,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// GPU hang detected
    GpuHang,
    /// No command encoder exists for this GPU family
    UnsupportedFamily,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of GPU memory or address space
    OutOfMemory,
    /// Allocation failed
    AllocationFailed,
    /// Address not aligned
    MisalignedAddress,
    /// Access past the end of a buffer
    BufferOverflow,
    /// Allocation has no CPU-visible backing
    NotCpuVisible,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Command stream has no room for the requested bytes
    CommandBufferFull,
    /// Unknown command header
    InvalidCommand,
    /// Command cut off before its declared length
    TruncatedCommand,
    /// Back end rejected a physical submission
    SubmissionFailed,
    /// Completion wait gave up
    FenceTimeout,
}

impl Error {
    /// Whether the error leaves the submission path unusable
    ///
    /// Command stream exhaustion means a size query disagreed with emission;
    /// a hang means the completion tag will never advance.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CommandBufferFull | Self::GpuHang)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Hardware
            Self::GpuHang => write!(f, "GPU hang detected"),
            Self::UnsupportedFamily => write!(f, "unsupported GPU family"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::MisalignedAddress => write!(f, "misaligned address"),
            Self::BufferOverflow => write!(f, "buffer overflow"),
            Self::NotCpuVisible => write!(f, "allocation is not CPU visible"),

            // Command
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::TruncatedCommand => write!(f, "truncated command"),
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::FenceTimeout => write!(f, "fence wait timeout"),
        }
    }
}
