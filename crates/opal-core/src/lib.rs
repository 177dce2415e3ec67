//! # OPAL Core
//!
//! Foundational types, error handling, and trait seams for the OPAL
//! display-adapter driver stack.
//!
//! This crate has no hardware dependencies. It defines the vocabulary the
//! memory-management layer is written in: device-pool offsets, byte sizes,
//! generational handles, the unified error type, and the copy-engine
//! boundary that separates allocator logic from real hardware.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       opal-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Traits    │  │     Error           │  │
//! │  │ (DevAddr,   │  │ (CopyEngine)│  │   Handling          │  │
//! │  │  Handle)    │  │             │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{AllocError, Error, Result};
pub use traits::CopyEngine;
pub use types::{ByteSize, DevAddr, Handle, RegionHandle, SurfaceHandle};
