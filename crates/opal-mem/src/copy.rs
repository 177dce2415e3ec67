//! # Aperture Copy Engine
//!
//! Software [`CopyEngine`] over a plain byte buffer standing in for the
//! adapter's memory aperture.
//!
//! Used by the test suite and by hosts running the adapter in
//! framebuffer-emulation mode. A real driver substitutes a blitter-backed
//! engine behind the same trait.

use alloc::vec::Vec;

use opal_core::{ByteSize, CopyEngine, DevAddr, Error, Result};

// =============================================================================
// APERTURE COPY ENGINE
// =============================================================================

/// CPU-driven copy engine over an in-memory device pool.
#[derive(Debug)]
pub struct ApertureCopyEngine {
    aperture: Vec<u8>,
}

impl ApertureCopyEngine {
    /// Create an engine with a zeroed aperture of `pool_size` bytes.
    pub fn new(pool_size: ByteSize) -> Self {
        let mut aperture = Vec::new();
        aperture.resize(pool_size.as_bytes() as usize, 0);
        Self { aperture }
    }

    /// Read access to the raw aperture bytes.
    pub fn aperture(&self) -> &[u8] {
        &self.aperture
    }

    /// Write access to the raw aperture bytes.
    pub fn aperture_mut(&mut self) -> &mut [u8] {
        &mut self.aperture
    }

    /// Bytes spanned by `rows` rows at `stride`, last row `row_bytes` long.
    fn span(stride: u32, row_bytes: u32, rows: u32) -> u64 {
        (rows as u64 - 1) * stride as u64 + row_bytes as u64
    }
}

impl CopyEngine for ApertureCopyEngine {
    fn wait_idle(&mut self) -> Result<()> {
        // Software engine: nothing is ever in flight.
        Ok(())
    }

    fn device_to_system(
        &mut self,
        src: DevAddr,
        src_stride: u32,
        dst: &mut [u8],
        dst_stride: u32,
        row_bytes: u32,
        rows: u32,
    ) -> Result<()> {
        if rows == 0 || row_bytes == 0 {
            return Ok(());
        }
        if row_bytes > src_stride || row_bytes > dst_stride {
            return Err(Error::CopyFault);
        }
        if src.raw() + Self::span(src_stride, row_bytes, rows) > self.aperture.len() as u64 {
            return Err(Error::CopyFault);
        }
        if Self::span(dst_stride, row_bytes, rows) > dst.len() as u64 {
            return Err(Error::CopyFault);
        }

        for row in 0..rows {
            let s = (src.raw() + row as u64 * src_stride as u64) as usize;
            let d = (row * dst_stride) as usize;
            let n = row_bytes as usize;
            dst[d..d + n].copy_from_slice(&self.aperture[s..s + n]);
        }
        Ok(())
    }

    fn system_to_device(
        &mut self,
        src: &[u8],
        src_stride: u32,
        dst: DevAddr,
        dst_stride: u32,
        row_bytes: u32,
        rows: u32,
    ) -> Result<()> {
        if rows == 0 || row_bytes == 0 {
            return Ok(());
        }
        if row_bytes > src_stride || row_bytes > dst_stride {
            return Err(Error::CopyFault);
        }
        if Self::span(src_stride, row_bytes, rows) > src.len() as u64 {
            return Err(Error::CopyFault);
        }
        if dst.raw() + Self::span(dst_stride, row_bytes, rows) > self.aperture.len() as u64 {
            return Err(Error::CopyFault);
        }

        for row in 0..rows {
            let s = (row * src_stride) as usize;
            let d = (dst.raw() + row as u64 * dst_stride as u64) as usize;
            let n = row_bytes as usize;
            self.aperture[d..d + n].copy_from_slice(&src[s..s + n]);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
