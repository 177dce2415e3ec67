//! # OPAL Core Traits
//!
//! Trait seams between the allocator logic and the hardware it serves.
//!
//! The memory manager never touches adapter memory directly. All byte
//! movement goes through [`CopyEngine`], so the allocator can be driven
//! against a software engine in tests and against the real blitter in the
//! driver.

use crate::error::Result;
use crate::types::DevAddr;

// =============================================================================
// COPY ENGINE TRAIT
// =============================================================================

/// Stride-aware 2D copy primitive over the adapter's memory aperture.
///
/// Implementations move `rows` rows of `row_bytes` bytes each between
/// system memory and the device pool, stepping `src_stride` / `dst_stride`
/// bytes between rows. Source and destination spans never overlap; the
/// caller guarantees both are large enough.
pub trait CopyEngine: Send {
    /// Block until the drawing engine has no operation in flight.
    ///
    /// Must be called before any transfer that touches device memory a
    /// draw operation may still be reading or writing.
    fn wait_idle(&mut self) -> Result<()>;

    /// Copy from the device pool into a system-memory buffer.
    fn device_to_system(
        &mut self,
        src: DevAddr,
        src_stride: u32,
        dst: &mut [u8],
        dst_stride: u32,
        row_bytes: u32,
        rows: u32,
    ) -> Result<()>;

    /// Copy from a system-memory buffer into the device pool.
    fn system_to_device(
        &mut self,
        src: &[u8],
        src_stride: u32,
        dst: DevAddr,
        dst_stride: u32,
        row_bytes: u32,
        rows: u32,
    ) -> Result<()>;
}
