//! # OPAL Memory Management
//!
//! Off-screen device-memory manager for 2D display adapters.
//!
//! The adapter's off-screen memory is a fixed contiguous pool. This crate
//! sub-allocates it into bitmap-surface regions so that accelerated
//! copy/fill operations can run out of fast device memory instead of
//! software-drawn system memory. Under pressure, least-recently-allocated
//! surfaces are demoted to system memory byte-for-byte and opportunistically
//! promoted back once space frees up.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         opal-mem                             │
//! │  ┌────────────┐   ┌─────────────┐   ┌─────────────────────┐  │
//! │  │ Offscreen  │──▶│  Free List  │   │     Cache List      │  │
//! │  │   Heap     │   │ (first-fit, │   │  (LRU, eviction     │  │
//! │  │            │──▶│  coalescing)│   │   candidates)       │  │
//! │  └─────┬──────┘   └──────┬──────┘   └──────────┬──────────┘  │
//! │        │                 └─────┬───────────────┘             │
//! │        ▼                       ▼                             │
//! │  ┌────────────┐   ┌──────────────────────┐                   │
//! │  │  Surfaces  │   │     Region Arena     │                   │
//! │  │ (demote /  │   │ (slot map, intrusive │                   │
//! │  │  promote)  │   │     index links)     │                   │
//! │  └────────────┘   └──────────────────────┘                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! The heap has a single logical owner and no internal locking. The caller
//! serializes all entry points per adapter instance; [`lock::LockedHeap`]
//! wraps a heap in a `spin::Mutex` for hosts that want that serialization
//! enforced by a lock.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod arena;
pub mod cache_list;
pub mod config;
pub mod copy;
pub mod free_list;
pub mod heap;
pub mod lock;
pub mod surface;

// Re-exports for convenience
pub use arena::{Region, RegionState};
pub use config::HeapConfig;
pub use copy::ApertureCopyEngine;
pub use heap::{AllocFlags, HeapStats, OffscreenHeap};
pub use lock::LockedHeap;
pub use surface::{Surface, SurfaceStorage, SystemBitmap};
