//! # OPAL Error Handling
//!
//! Unified error types for the display-driver stack.
//!
//! Error handling in OPAL follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Allocation failures are locally recoverable by the caller
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// OPAL Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// OPAL unified error type
///
/// Covers all error conditions across the driver stack, categorized by
/// subsystem.
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
    /// Handle refers to a slot that has since been recycled
    StaleHandle,

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    /// Off-screen allocation failed
    Alloc(AllocError),

    // =========================================================================
    // Copy Engine Errors
    // =========================================================================
    /// Copy engine reported a transfer fault
    CopyFault,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::StaleHandle => write!(f, "stale handle"),

            // Allocation
            Self::Alloc(e) => write!(f, "allocation failed: {}", e),

            // Copy engine
            Self::CopyFault => write!(f, "copy engine transfer fault"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Off-screen allocation failure kinds
///
/// None of these is fatal to the heap. `TooLarge` and `NotWorthCaching`
/// are permanent for a given request; `OutOfSpace` is transient and the
/// caller falls back to system-memory storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Request exceeds hardware addressing limits or total pool capacity
    TooLarge,
    /// Request is below the minimum cacheable dimensions
    NotWorthCaching,
    /// Insufficient space even after evicting everything evictable
    OutOfSpace,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge => write!(f, "request exceeds hardware limits"),
            Self::NotWorthCaching => write!(f, "below minimum cacheable size"),
            Self::OutOfSpace => write!(f, "insufficient device memory"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Error::Alloc(e)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// =============================================================================
// TESTS
// =============================================================================
