//! # Heap Configuration
//!
//! Adapter-specific constants supplied at heap initialization.

use opal_core::{ByteSize, Error, Result};

// =============================================================================
// HEAP CONFIGURATION
// =============================================================================

/// Configuration for an off-screen heap.
///
/// The stride and height bit widths come from the adapter's addressing
/// registers; a request that cannot be encoded in them is rejected before
/// any list is touched.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Total size of the off-screen device memory pool
    pub pool_size: ByteSize,
    /// Bytes per pixel of the adapter's frame format
    pub bytes_per_pixel: u32,
    /// Stride alignment required by the drawing engine (power of two)
    pub stride_align: u32,
    /// Bit width of the stride field in the addressing registers
    pub stride_bits: u32,
    /// Bit width of the height field in the addressing registers
    pub height_bits: u32,
    /// Minimum cacheable width in pixels
    pub min_width: u32,
    /// Minimum cacheable height in pixels
    pub min_height: u32,
    /// Promotion checks between attempts for a system-resident surface
    pub promote_interval: u8,
}

impl HeapConfig {
    /// Config for an 8 bpp adapter with 13-bit stride / 11-bit height
    /// registers.
    pub const fn adapter_8bpp(pool_size: ByteSize) -> Self {
        Self {
            pool_size,
            bytes_per_pixel: 1,
            stride_align: 8,
            stride_bits: 13,
            height_bits: 11,
            min_width: 8,
            min_height: 8,
            promote_interval: 10,
        }
    }

    /// Config for a 16 bpp adapter with 14-bit stride / 11-bit height
    /// registers.
    pub const fn adapter_16bpp(pool_size: ByteSize) -> Self {
        Self {
            pool_size,
            bytes_per_pixel: 2,
            stride_align: 16,
            stride_bits: 14,
            height_bits: 11,
            min_width: 8,
            min_height: 8,
            promote_interval: 10,
        }
    }

    /// Largest stride encodable in the addressing registers.
    pub const fn max_stride(&self) -> u32 {
        (1u32 << self.stride_bits) - 1
    }

    /// Largest height encodable in the addressing registers.
    pub const fn max_height(&self) -> u32 {
        (1u32 << self.height_bits) - 1
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size.is_zero() {
            return Err(Error::InvalidParameter);
        }
        if self.bytes_per_pixel == 0 || self.bytes_per_pixel > 4 {
            return Err(Error::InvalidParameter);
        }
        if self.stride_align == 0 || !self.stride_align.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        if self.stride_bits == 0 || self.stride_bits > 31 {
            return Err(Error::InvalidParameter);
        }
        if self.height_bits == 0 || self.height_bits > 31 {
            return Err(Error::InvalidParameter);
        }
        if self.promote_interval == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::adapter_8bpp(ByteSize::from_mib(4))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(HeapConfig::default().validate().is_ok());
        assert!(HeapConfig::adapter_16bpp(ByteSize::from_mib(8)).validate().is_ok());
    }

    #[test]
    fn test_register_limits() {
        let config = HeapConfig::adapter_8bpp(ByteSize::from_mib(4));
        assert_eq!(config.max_stride(), 8191);
        assert_eq!(config.max_height(), 2047);
    }

    #[test]
    fn test_rejects_bad_config() {
        let mut config = HeapConfig::default();
        config.stride_align = 12;
        assert_eq!(config.validate(), Err(Error::InvalidParameter));

        let mut config = HeapConfig::default();
        config.pool_size = ByteSize::ZERO;
        assert_eq!(config.validate(), Err(Error::InvalidParameter));

        let mut config = HeapConfig::default();
        config.promote_interval = 0;
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
    }
}
