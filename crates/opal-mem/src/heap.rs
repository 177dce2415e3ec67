//! # Off-Screen Heap
//!
//! Sub-allocator over the adapter's fixed off-screen memory pool.
//!
//! Allocation is first-fit over the free list. When the search fails, the
//! least-recently-allocated evictable surface is demoted to system memory
//! and the search retries, until it succeeds or eviction is exhausted.
//! Two running counters (free bytes, evictable bytes) short-circuit
//! requests that could never succeed without walking any list.
//!
//! The heap has a single logical owner; the caller serializes all entry
//! points per adapter instance.

use alloc::vec::Vec;

use opal_core::{
    AllocError, ByteSize, CopyEngine, DevAddr, Error, RegionHandle, Result, SurfaceHandle,
};

use crate::arena::{Region, RegionArena, RegionState, NIL};
use crate::cache_list::CacheList;
use crate::config::HeapConfig;
use crate::free_list::FreeList;
use crate::surface::{Surface, SurfaceStorage, SurfaceTable, SystemBitmap};

// =============================================================================
// ALLOCATION FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Flags for off-screen allocation requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Never evict this region (backs the primary surface)
        const PERMANENT = 1 << 0;
        /// Fail with `OutOfSpace` rather than evict anyone
        const ONLY_IF_ROOM = 1 << 1;
    }
}

// =============================================================================
// HEAP STATISTICS
// =============================================================================

/// Running heap statistics
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    /// Successful allocations
    pub allocs: u64,
    /// Regions returned to the free list (including evictions)
    pub frees: u64,
    /// Surfaces demoted to make room for an allocation
    pub evictions: u64,
    /// Surfaces promoted back into device memory
    pub promotions: u64,
    /// High water mark of allocated bytes
    pub peak_resident: u64,
}

// =============================================================================
// OFF-SCREEN HEAP
// =============================================================================

/// The off-screen device-memory manager.
///
/// Owns the region arena, both lists, the surface table, and the injected
/// copy engine. All byte movement between device and system memory goes
/// through the engine, never through this type directly.
#[derive(Debug)]
pub struct OffscreenHeap<E: CopyEngine> {
    config: HeapConfig,
    arena: RegionArena,
    free_list: FreeList,
    cache_list: CacheList,
    surfaces: SurfaceTable,
    engine: E,
    free_bytes: u64,
    evictable_bytes: u64,
    stats: HeapStats,
}

impl<E: CopyEngine> OffscreenHeap<E> {
    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Create a heap over a pool of `config.pool_size` bytes.
    ///
    /// The whole pool starts as a single free region; the primary surface
    /// is carved out by the caller's first `PERMANENT` allocation.
    pub fn init(config: HeapConfig, engine: E) -> Result<Self> {
        config.validate()?;

        let mut arena = RegionArena::with_capacity(32);
        let mut free_list = FreeList::new();
        let whole = arena.acquire(Region::free_span(DevAddr::ZERO, config.pool_size));
        free_list.insert_free(&mut arena, whole.index());

        log::info!(
            "off-screen heap: {:?} pool, {} bpp, stride align {}",
            config.pool_size,
            config.bytes_per_pixel,
            config.stride_align
        );

        Ok(Self {
            free_bytes: config.pool_size.as_bytes(),
            evictable_bytes: 0,
            arena,
            free_list,
            cache_list: CacheList::new(),
            surfaces: SurfaceTable::new(),
            engine,
            stats: HeapStats::default(),
            config,
        })
    }

    /// Tear the heap down, returning the copy engine to the caller.
    pub fn teardown(self) -> E {
        log::info!(
            "heap teardown: {} allocs, {} frees, {} evictions, {} promotions",
            self.stats.allocs,
            self.stats.frees,
            self.stats.evictions,
            self.stats.promotions
        );
        self.engine
    }

    // =========================================================================
    // ALLOCATION
    // =========================================================================

    /// Allocate an off-screen region for a `width` x `height` bitmap.
    ///
    /// Evicts least-recently-allocated surfaces as needed unless
    /// `ONLY_IF_ROOM` is set. The returned region has no owning surface;
    /// ownerless regions are never chosen for eviction.
    pub fn allocate(&mut self, width: u32, height: u32, flags: AllocFlags) -> Result<RegionHandle> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter);
        }
        let (stride, size) = self.layout(width, height)?;
        if width <= self.config.min_width && height <= self.config.min_height {
            return Err(AllocError::NotWorthCaching.into());
        }

        // Requests beyond everything free plus everything evictable can
        // never succeed; fail without walking any list.
        if size.as_bytes() > self.free_bytes + self.evictable_bytes {
            return Err(AllocError::OutOfSpace.into());
        }
        if flags.contains(AllocFlags::ONLY_IF_ROOM) && size.as_bytes() > self.free_bytes {
            return Err(AllocError::OutOfSpace.into());
        }

        loop {
            if let Some(fit) = self.free_list.find_first_fit(&self.arena, size) {
                let index = self.free_list.take_exact_or_split(&mut self.arena, fit, size);
                let state = if flags.contains(AllocFlags::PERMANENT) {
                    RegionState::Permanent
                } else {
                    RegionState::Resident
                };
                {
                    let region = self.arena.at_mut(index);
                    region.width = width;
                    region.height = height;
                    region.stride = stride;
                    region.state = state;
                    region.owner = None;
                    region.pin_count = 0;
                }
                self.cache_list.insert_head(&mut self.arena, index);
                self.free_bytes -= size.as_bytes();
                self.stats.allocs += 1;
                let resident = self.config.pool_size.as_bytes() - self.free_bytes;
                if resident > self.stats.peak_resident {
                    self.stats.peak_resident = resident;
                }

                let handle = self.arena.handle_of(index);
                log::debug!(
                    "allocated {}x{} at {:?} ({:?})",
                    width,
                    height,
                    self.arena.at(index).base,
                    size
                );
                self.maybe_validate();
                return Ok(handle);
            }

            if flags.contains(AllocFlags::ONLY_IF_ROOM) {
                return Err(AllocError::OutOfSpace.into());
            }
            let victim = match self.cache_list.oldest_evictable(&self.arena) {
                Some(victim) => victim,
                None => return Err(AllocError::OutOfSpace.into()),
            };
            self.evict(victim)?;
        }
    }

    /// Return a region to the free list, coalescing with its neighbors.
    ///
    /// The handle must not belong to a surface; device-resident surfaces
    /// are released through [`Self::destroy_surface`] or demoted.
    pub fn free(&mut self, handle: RegionHandle) -> Result<()> {
        {
            let region = self.arena.get(handle)?;
            if region.state == RegionState::Free {
                return Err(Error::InvalidParameter);
            }
        }
        let size = self.release_to_free_list(handle.index());
        self.after_free();
        log::debug!("freed {} bytes back to the pool", size);
        self.maybe_validate();
        Ok(())
    }

    /// Stride and rounded byte size for a request, or `TooLarge`.
    fn layout(&self, width: u32, height: u32) -> Result<(u32, ByteSize)> {
        let stride = self.raw_stride(width);
        if stride > self.config.max_stride() as u64 || height > self.config.max_height() {
            return Err(AllocError::TooLarge.into());
        }
        let size = stride * height as u64;
        if size > self.config.pool_size.as_bytes() {
            return Err(AllocError::TooLarge.into());
        }
        Ok((stride as u32, ByteSize::from_bytes(size)))
    }

    fn raw_stride(&self, width: u32) -> u64 {
        let align = self.config.stride_align as u64;
        (width as u64 * self.config.bytes_per_pixel as u64 + align - 1) & !(align - 1)
    }

    // =========================================================================
    // EVICTION AND DEMOTION
    // =========================================================================

    fn evict(&mut self, index: u32) -> Result<()> {
        let owner = match self.arena.at(index).owner {
            Some(owner) => owner,
            None => return Err(Error::InvalidParameter),
        };
        log::debug!("evicting oldest surface {:?} to system memory", owner);
        self.demote_index(index, owner)?;
        self.stats.evictions += 1;
        Ok(())
    }

    /// Demote a device-resident surface to a system-memory bitmap.
    ///
    /// No-op if the surface is already system-resident. The primary
    /// (permanent) surface cannot be demoted.
    pub fn demote(&mut self, surface: SurfaceHandle) -> Result<()> {
        let region = match &self.surfaces.get(surface)?.storage {
            SurfaceStorage::Device(region) => *region,
            SurfaceStorage::System(_) => return Ok(()),
        };
        if self.arena.get(region)?.state == RegionState::Permanent {
            return Err(Error::InvalidParameter);
        }
        self.demote_index(region.index(), surface)
    }

    /// Copy a region's bytes out to a fresh system bitmap, retarget the
    /// owning surface, then reclaim the device span.
    ///
    /// The surface is retargeted before the span is reclaimed, so there
    /// is never a moment where it claims device residency over freed
    /// memory.
    fn demote_index(&mut self, index: u32, owner: SurfaceHandle) -> Result<()> {
        let (base, size, stride, height) = {
            let region = self.arena.at(index);
            (
                region.base,
                region.size.as_bytes(),
                region.stride,
                region.height,
            )
        };

        let mut pixels = Vec::new();
        pixels.resize(size as usize, 0u8);

        self.engine.wait_idle()?;
        self.engine
            .device_to_system(base, stride, &mut pixels, stride, stride, height)?;

        {
            let surface = self.surfaces.get_mut(owner)?;
            surface.storage = SurfaceStorage::System(SystemBitmap { pixels, stride });
        }
        self.release_to_free_list(index);
        self.after_free();
        self.maybe_validate();
        Ok(())
    }

    /// Unlink a region from the cache list and merge it into the free
    /// list, keeping both running counters in step. Returns the size.
    fn release_to_free_list(&mut self, index: u32) -> u64 {
        self.cache_list.remove(&mut self.arena, index);
        let (size, counted_evictable) = {
            let region = self.arena.at(index);
            (
                region.size.as_bytes(),
                region.state == RegionState::Resident && region.owner.is_some(),
            )
        };
        if counted_evictable {
            self.evictable_bytes -= size;
        }
        {
            let region = self.arena.at_mut(index);
            region.state = RegionState::Free;
            region.owner = None;
            region.pin_count = 0;
            region.width = 0;
            region.height = 0;
            region.stride = 0;
        }
        self.free_bytes += size;
        self.free_list.insert_free(&mut self.arena, index);
        size
    }

    /// Bookkeeping shared by every path that frees device memory.
    fn after_free(&mut self) {
        self.stats.frees += 1;
        // Space became available: rearm every system-resident surface's
        // promotion countdown.
        self.surfaces.reset_countdowns(self.config.promote_interval);
    }

    // =========================================================================
    // SURFACES
    // =========================================================================

    /// Create a bitmap surface, cached in device memory when possible.
    ///
    /// If the off-screen allocation fails for any reason the surface is
    /// created over a system-memory bitmap instead; an `OutOfSpace`
    /// failure leaves it eligible for later promotion, the permanent
    /// rejections (`TooLarge`, `NotWorthCaching`) do not.
    pub fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        flags: AllocFlags,
    ) -> Result<SurfaceHandle> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter);
        }
        match self.allocate(width, height, flags) {
            Ok(region) => {
                let (stride, size) = {
                    let record = self.arena.at(region.index());
                    (record.stride, record.size.as_bytes())
                };
                let surface = self
                    .surfaces
                    .insert(Surface::device(width, height, stride, region));
                self.arena.get_mut(region)?.owner = Some(surface);
                if !flags.contains(AllocFlags::PERMANENT) {
                    self.evictable_bytes += size;
                }
                log::debug!("surface {:?} cached in device memory", surface);
                self.maybe_validate();
                Ok(surface)
            }
            Err(Error::Alloc(kind)) => {
                let promotable = kind == AllocError::OutOfSpace;
                let stride = self.raw_stride(width);
                if stride > u32::MAX as u64 {
                    return Err(Error::InvalidParameter);
                }
                let mut pixels = Vec::new();
                pixels.resize((stride * height as u64) as usize, 0u8);
                let surface = self.surfaces.insert(Surface::system(
                    width,
                    height,
                    stride as u32,
                    pixels,
                    promotable,
                    self.config.promote_interval,
                ));
                log::debug!("surface {:?} held in system memory ({})", surface, kind);
                Ok(surface)
            }
            Err(e) => Err(e),
        }
    }

    /// Destroy a surface, releasing whichever backing store it holds.
    pub fn destroy_surface(&mut self, surface: SurfaceHandle) -> Result<()> {
        let record = self.surfaces.remove(surface)?;
        if let SurfaceStorage::Device(region) = record.storage {
            self.free(region)?;
        }
        log::debug!("surface {:?} destroyed", surface);
        Ok(())
    }

    /// Promotion check for a system-resident surface.
    ///
    /// Each check decrements the surface's countdown; an allocation is
    /// attempted only when it reaches zero, bounding how often the search
    /// runs for a surface that rarely gets drawn. `OutOfSpace` rearms the
    /// countdown and the surface stays in system memory.
    pub fn maybe_promote(&mut self, surface: SurfaceHandle) -> Result<Option<RegionHandle>> {
        {
            let record = self.surfaces.get_mut(surface)?;
            if record.is_device_resident() || !record.promotable {
                return Ok(None);
            }
            if record.countdown > 0 {
                record.countdown -= 1;
            }
            if record.countdown > 0 {
                return Ok(None);
            }
        }
        let (width, height) = {
            let record = self.surfaces.get(surface)?;
            (record.width, record.height)
        };

        let region = match self.allocate(width, height, AllocFlags::empty()) {
            Ok(region) => region,
            Err(Error::Alloc(AllocError::OutOfSpace)) => {
                self.surfaces.get_mut(surface)?.countdown = self.config.promote_interval;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let (base, stride, size) = {
            let record = self.arena.get(region)?;
            (record.base, record.stride, record.size.as_bytes())
        };

        let copied = {
            let record = self.surfaces.get(surface)?;
            match &record.storage {
                SurfaceStorage::System(bitmap) => {
                    debug_assert_eq!(bitmap.stride, stride);
                    self.engine.wait_idle().and_then(|()| {
                        self.engine.system_to_device(
                            &bitmap.pixels,
                            bitmap.stride,
                            base,
                            stride,
                            stride,
                            record.height,
                        )
                    })
                }
                SurfaceStorage::Device(_) => Err(Error::InvalidParameter),
            }
        };
        if let Err(e) = copied {
            // Undo the allocation; the surface keeps its system copy.
            self.free(region)?;
            return Err(e);
        }

        self.surfaces.get_mut(surface)?.storage = SurfaceStorage::Device(region);
        self.arena.get_mut(region)?.owner = Some(surface);
        self.evictable_bytes += size;
        self.stats.promotions += 1;
        log::debug!("promoted {:?} into device memory at {:?}", surface, base);
        self.maybe_validate();
        Ok(Some(region))
    }

    /// Demote every owned, non-permanent surface to system memory.
    ///
    /// Used when the device is about to lose its memory contents, e.g.
    /// across a mode change. Permanent regions stay; resident regions
    /// with no owning surface cannot be demoted and are left behind with
    /// a warning.
    pub fn flush_all_to_system_memory(&mut self) -> Result<()> {
        let mut demoted = 0u32;
        loop {
            let mut candidate = None;
            let mut cur = self.cache_list.head();
            while cur != NIL {
                let region = self.arena.at(cur);
                if region.state == RegionState::Resident {
                    if let Some(owner) = region.owner {
                        candidate = Some((cur, owner));
                        break;
                    }
                }
                cur = region.next;
            }
            let Some((index, owner)) = candidate else { break };
            self.demote_index(index, owner)?;
            demoted += 1;
        }

        let mut cur = self.cache_list.head();
        while cur != NIL {
            let region = self.arena.at(cur);
            if region.state == RegionState::Resident {
                log::warn!(
                    "resident region at {:?} has no surface to demote into",
                    region.base
                );
            }
            cur = region.next;
        }

        log::info!("flushed {} surfaces to system memory", demoted);
        self.maybe_validate();
        Ok(())
    }

    // =========================================================================
    // PINNING
    // =========================================================================

    /// Hold a region in place while a draw operation targets it.
    pub fn pin(&mut self, region: RegionHandle) -> Result<()> {
        let record = self.arena.get_mut(region)?;
        if record.state == RegionState::Free {
            return Err(Error::InvalidParameter);
        }
        record.pin_count += 1;
        Ok(())
    }

    /// Release one pin on a region.
    pub fn unpin(&mut self, region: RegionHandle) -> Result<()> {
        let record = self.arena.get_mut(region)?;
        debug_assert!(record.pin_count > 0, "unpin without matching pin");
        record.pin_count = record.pin_count.saturating_sub(1);
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Bytes currently on the free list.
    pub fn free_bytes(&self) -> ByteSize {
        ByteSize::from_bytes(self.free_bytes)
    }

    /// Bytes held by surfaces eviction could reclaim.
    pub fn evictable_bytes(&self) -> ByteSize {
        ByteSize::from_bytes(self.evictable_bytes)
    }

    /// Largest single free region.
    pub fn largest_free(&self) -> ByteSize {
        self.free_list.largest(&self.arena)
    }

    /// Number of live region records (free and allocated).
    pub fn region_count(&self) -> u32 {
        self.arena.live_count()
    }

    /// Number of live surfaces.
    pub fn surface_count(&self) -> u32 {
        self.surfaces.len()
    }

    /// Running statistics.
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// The configuration the heap was initialized with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Read-only view of a region.
    pub fn region(&self, handle: RegionHandle) -> Result<&Region> {
        self.arena.get(handle)
    }

    /// Read-only view of a surface.
    pub fn surface(&self, handle: SurfaceHandle) -> Result<&Surface> {
        self.surfaces.get(handle)
    }

    /// The injected copy engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutable access to the copy engine.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Walk both lists and assert every heap invariant.
    ///
    /// Panics on violation; a violation is a bug in this component or its
    /// caller, never an environmental condition.
    #[cfg(any(test, feature = "validation"))]
    pub fn validate_invariants(&self) {
        let mut spans: Vec<(u64, u64)> = Vec::new();
        let mut free_spans: Vec<(u64, u64)> = Vec::new();
        let mut total = 0u64;
        let mut free_total = 0u64;
        let mut evictable_total = 0u64;

        for index in self.free_list.indices(&self.arena) {
            let region = self.arena.at(index);
            assert_eq!(region.state, RegionState::Free);
            assert!(region.owner.is_none());
            let span = (region.base.raw(), region.size.as_bytes());
            spans.push(span);
            free_spans.push(span);
            total += span.1;
            free_total += span.1;
        }
        for index in self.cache_list.indices(&self.arena) {
            let region = self.arena.at(index);
            assert_ne!(region.state, RegionState::Free);
            spans.push((region.base.raw(), region.size.as_bytes()));
            total += region.size.as_bytes();
            if region.state == RegionState::Resident && region.owner.is_some() {
                evictable_total += region.size.as_bytes();
            }
        }

        assert_eq!(
            total,
            self.config.pool_size.as_bytes(),
            "regions must cover the pool exactly"
        );
        assert_eq!(free_total, self.free_bytes, "free counter out of sync");
        assert_eq!(
            evictable_total, self.evictable_bytes,
            "evictable counter out of sync"
        );

        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping regions");
        }
        free_spans.sort_unstable();
        for pair in free_spans.windows(2) {
            assert_ne!(
                pair[0].0 + pair[0].1,
                pair[1].0,
                "unmerged adjacent free regions"
            );
        }
    }

    fn maybe_validate(&self) {
        #[cfg(feature = "validation")]
        self.validate_invariants();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::ApertureCopyEngine;

    const POOL: u64 = 1_000_000;

    fn test_config() -> HeapConfig {
        HeapConfig {
            pool_size: ByteSize::from_bytes(POOL),
            bytes_per_pixel: 1,
            stride_align: 8,
            stride_bits: 20,
            height_bits: 16,
            min_width: 8,
            min_height: 8,
            promote_interval: 3,
        }
    }

    fn heap() -> OffscreenHeap<ApertureCopyEngine> {
        OffscreenHeap::init(
            test_config(),
            ApertureCopyEngine::new(ByteSize::from_bytes(POOL)),
        )
        .unwrap()
    }

    fn device_region(
        heap: &OffscreenHeap<ApertureCopyEngine>,
        surface: SurfaceHandle,
    ) -> RegionHandle {
        match heap.surface(surface).unwrap().storage() {
            SurfaceStorage::Device(region) => *region,
            SurfaceStorage::System(_) => panic!("surface is not device resident"),
        }
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let mut config = test_config();
        config.stride_align = 12;
        let engine = ApertureCopyEngine::new(ByteSize::from_bytes(POOL));
        assert_eq!(
            OffscreenHeap::init(config, engine).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_rejects_zero_dimensions() {
        let mut heap = heap();
        assert_eq!(
            heap.allocate(0, 10, AllocFlags::empty()).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(
            heap.allocate(10, 0, AllocFlags::empty()).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_too_large_never_touches_lists() {
        let mut heap = heap();

        // Larger than the whole pool
        let err = heap.allocate(1000, 1001, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::TooLarge));

        // Stride overflows the addressing registers
        let err = heap
            .allocate(2_000_000, 10, AllocFlags::empty())
            .unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::TooLarge));

        // Height overflows the addressing registers
        let err = heap.allocate(16, 70_000, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::TooLarge));

        assert_eq!(heap.stats().allocs, 0);
        assert_eq!(heap.free_bytes().as_bytes(), POOL);
        assert_eq!(heap.region_count(), 1);
    }

    #[test]
    fn test_tiny_bitmaps_not_worth_caching() {
        let mut heap = heap();
        let err = heap.allocate(8, 8, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::NotWorthCaching));
        let err = heap.allocate(4, 4, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::NotWorthCaching));

        // A thin-but-long bitmap is still worth caching
        assert!(heap.allocate(8, 16, AllocFlags::empty()).is_ok());
    }

    #[test]
    fn test_out_of_space_without_eviction_candidates() {
        let mut heap = heap();
        heap.allocate(1000, 500, AllocFlags::empty()).unwrap();

        // Nothing is evictable (no surfaces own the region)
        let err = heap.allocate(1000, 600, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::OutOfSpace));
        assert_eq!(heap.stats().evictions, 0);
        heap.validate_invariants();
    }

    #[test]
    fn test_first_fit_reuses_freed_span() {
        let mut heap = heap();
        let a = heap.allocate(1000, 400, AllocFlags::empty()).unwrap();
        let b = heap.allocate(1000, 400, AllocFlags::empty()).unwrap();
        let a_base = heap.region(a).unwrap().base;

        heap.free(a).unwrap();
        let c = heap.allocate(1000, 400, AllocFlags::empty()).unwrap();
        assert_eq!(heap.region(c).unwrap().base, a_base);
        assert_eq!(heap.stats().evictions, 0);
        assert!(heap.region(b).is_ok());
        heap.validate_invariants();
    }

    #[test]
    fn test_evicts_least_recently_allocated_first() {
        let mut heap = heap();
        let mut surfaces = Vec::new();
        for _ in 0..5 {
            surfaces.push(heap.create_surface(1000, 200, AllocFlags::empty()).unwrap());
        }
        assert_eq!(heap.free_bytes(), ByteSize::ZERO);

        let region = heap.allocate(1000, 200, AllocFlags::empty()).unwrap();

        // The first-allocated surface was demoted and its span reused
        assert_eq!(heap.region(region).unwrap().base, DevAddr::ZERO);
        assert_eq!(heap.stats().evictions, 1);
        assert!(!heap.surface(surfaces[0]).unwrap().is_device_resident());
        for surface in &surfaces[1..] {
            assert!(heap.surface(*surface).unwrap().is_device_resident());
        }
        heap.validate_invariants();
    }

    #[test]
    fn test_eviction_never_touches_permanent() {
        let mut heap = heap();
        let primary = heap.allocate(1000, 200, AllocFlags::PERMANENT).unwrap();
        let mut surfaces = Vec::new();
        for _ in 0..4 {
            surfaces.push(heap.create_surface(1000, 200, AllocFlags::empty()).unwrap());
        }
        assert_eq!(heap.free_bytes(), ByteSize::ZERO);
        assert_eq!(heap.evictable_bytes().as_bytes(), 800_000);

        // Requires evicting every resident surface
        let big = heap.allocate(1000, 800, AllocFlags::empty()).unwrap();
        assert_eq!(heap.stats().evictions, 4);
        for surface in &surfaces {
            assert!(!heap.surface(*surface).unwrap().is_device_resident());
        }
        let primary_record = heap.region(primary).unwrap();
        assert_eq!(primary_record.state, RegionState::Permanent);

        // Nothing free, nothing evictable: the next request short-circuits
        let err = heap.allocate(1000, 1, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::OutOfSpace));
        assert_eq!(heap.stats().evictions, 4);
        assert!(heap.region(big).is_ok());
        heap.validate_invariants();
    }

    #[test]
    fn test_oversubscription_fails_without_eviction() {
        let mut heap = heap();
        heap.allocate(1000, 200, AllocFlags::PERMANENT).unwrap();
        for _ in 0..4 {
            heap.create_surface(1000, 200, AllocFlags::empty()).unwrap();
        }

        // One row more than everything free plus everything evictable
        let err = heap.allocate(1000, 801, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::OutOfSpace));
        assert_eq!(heap.stats().evictions, 0);
        heap.validate_invariants();
    }

    #[test]
    fn test_only_if_room_never_evicts() {
        let mut heap = heap();
        let first = heap.create_surface(1000, 500, AllocFlags::empty()).unwrap();
        heap.create_surface(1000, 500, AllocFlags::empty()).unwrap();

        let err = heap
            .allocate(1000, 100, AllocFlags::ONLY_IF_ROOM)
            .unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::OutOfSpace));
        assert_eq!(heap.stats().evictions, 0);

        heap.destroy_surface(first).unwrap();
        assert!(heap.allocate(1000, 100, AllocFlags::ONLY_IF_ROOM).is_ok());
        heap.validate_invariants();
    }

    #[test]
    fn test_free_coalesces_back_to_whole_pool() {
        let mut heap = heap();
        let a = heap.allocate(1000, 300, AllocFlags::empty()).unwrap();
        let b = heap.allocate(1000, 300, AllocFlags::empty()).unwrap();
        let c = heap.allocate(1000, 400, AllocFlags::empty()).unwrap();
        assert_eq!(heap.free_bytes(), ByteSize::ZERO);

        heap.free(b).unwrap();
        heap.validate_invariants();
        heap.free(a).unwrap();
        heap.validate_invariants();
        heap.free(c).unwrap();

        assert_eq!(heap.free_bytes().as_bytes(), POOL);
        assert_eq!(heap.largest_free().as_bytes(), POOL);
        assert_eq!(heap.region_count(), 1);
        heap.validate_invariants();
    }

    #[test]
    fn test_double_free_of_merged_region_is_stale() {
        let mut heap = heap();
        let a = heap.allocate(1000, 400, AllocFlags::empty()).unwrap();
        heap.free(a).unwrap();

        // The record merged into the free remainder and was recycled
        assert_eq!(heap.free(a).unwrap_err(), Error::StaleHandle);
    }

    #[test]
    fn test_double_free_of_unmerged_region_is_rejected() {
        let mut heap = heap();
        let a = heap.allocate(1000, 500, AllocFlags::empty()).unwrap();
        let b = heap.allocate(1000, 500, AllocFlags::empty()).unwrap();
        heap.free(a).unwrap();

        // No free neighbor existed, so the record survived as Free
        assert_eq!(heap.free(a).unwrap_err(), Error::InvalidParameter);
        assert!(heap.region(b).is_ok());
    }

    #[test]
    fn test_round_trip_demote_then_promote() {
        let mut heap = heap();
        let surface = heap.create_surface(64, 16, AllocFlags::empty()).unwrap();
        let region = device_region(&heap, surface);
        let (base, stride, height) = {
            let record = heap.region(region).unwrap();
            (record.base, record.stride, record.height)
        };

        // Paint a recognizable pattern through the aperture
        {
            let aperture = heap.engine_mut().aperture_mut();
            for row in 0..height {
                for col in 0..stride {
                    let offset = base.raw() + (row * stride + col) as u64;
                    aperture[offset as usize] = (row as u8) ^ (col as u8) ^ 0x5a;
                }
            }
        }

        heap.demote(surface).unwrap();
        {
            let record = heap.surface(surface).unwrap();
            let SurfaceStorage::System(bitmap) = record.storage() else {
                panic!("demotion left the surface device resident");
            };
            for row in 0..height {
                for col in 0..stride {
                    let expect = (row as u8) ^ (col as u8) ^ 0x5a;
                    assert_eq!(bitmap.pixels[(row * stride + col) as usize], expect);
                }
            }
        }
        heap.validate_invariants();

        // Wipe the aperture to prove promotion writes the bytes back
        heap.engine_mut().aperture_mut().fill(0);

        // The demotion rearmed the countdown; two checks pass first
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        let promoted = heap.maybe_promote(surface).unwrap().unwrap();

        assert!(heap.surface(surface).unwrap().is_device_resident());
        let new_base = heap.region(promoted).unwrap().base;
        let aperture = heap.engine().aperture();
        for row in 0..height {
            for col in 0..stride {
                let expect = (row as u8) ^ (col as u8) ^ 0x5a;
                let offset = new_base.raw() + (row * stride + col) as u64;
                assert_eq!(aperture[offset as usize], expect);
            }
        }
        heap.validate_invariants();
    }

    #[test]
    fn test_promotion_countdown_rearms_on_out_of_space() {
        let mut heap = heap();
        let filler = heap.allocate(1000, 1000, AllocFlags::empty()).unwrap();

        let surface = heap.create_surface(64, 16, AllocFlags::empty()).unwrap();
        assert!(!heap.surface(surface).unwrap().is_device_resident());

        // Countdown burns down to the attempt, which finds no space
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        assert_eq!(heap.stats().promotions, 0);
        assert_eq!(heap.surface(surface).unwrap().countdown(), 3);

        // Freeing space rearms the countdown; the next attempt succeeds
        heap.free(filler).unwrap();
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        assert!(heap.maybe_promote(surface).unwrap().is_none());
        assert!(heap.maybe_promote(surface).unwrap().is_some());
        assert_eq!(heap.stats().promotions, 1);
        assert!(heap.surface(surface).unwrap().is_device_resident());
        heap.validate_invariants();
    }

    #[test]
    fn test_small_surface_is_never_promoted() {
        let mut heap = heap();
        let surface = heap.create_surface(4, 4, AllocFlags::empty()).unwrap();
        assert!(!heap.surface(surface).unwrap().is_device_resident());

        for _ in 0..10 {
            assert!(heap.maybe_promote(surface).unwrap().is_none());
        }
        assert_eq!(heap.stats().promotions, 0);
        heap.destroy_surface(surface).unwrap();
    }

    #[test]
    fn test_flush_all_spares_only_permanent() {
        let mut heap = heap();
        let primary = heap
            .create_surface(1000, 100, AllocFlags::PERMANENT)
            .unwrap();
        let s1 = heap.create_surface(1000, 200, AllocFlags::empty()).unwrap();
        let s2 = heap.create_surface(1000, 300, AllocFlags::empty()).unwrap();
        let loose = heap.allocate(1000, 50, AllocFlags::empty()).unwrap();

        heap.flush_all_to_system_memory().unwrap();

        assert!(heap.surface(primary).unwrap().is_device_resident());
        assert!(!heap.surface(s1).unwrap().is_device_resident());
        assert!(!heap.surface(s2).unwrap().is_device_resident());
        assert_eq!(heap.region(loose).unwrap().state, RegionState::Resident);
        assert_eq!(heap.free_bytes().as_bytes(), 850_000);
        heap.validate_invariants();
    }

    #[test]
    fn test_pinned_surface_survives_eviction_pressure() {
        let mut heap = heap();
        let s1 = heap.create_surface(1000, 500, AllocFlags::empty()).unwrap();
        let s2 = heap.create_surface(1000, 500, AllocFlags::empty()).unwrap();
        heap.pin(device_region(&heap, s1)).unwrap();

        // s1 is older but pinned, so s2 is the victim
        heap.allocate(1000, 100, AllocFlags::empty()).unwrap();
        assert!(heap.surface(s1).unwrap().is_device_resident());
        assert!(!heap.surface(s2).unwrap().is_device_resident());

        // With every remaining candidate pinned, eviction is exhausted
        let err = heap.allocate(1000, 500, AllocFlags::empty()).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::OutOfSpace));
        assert!(heap.surface(s1).unwrap().is_device_resident());

        heap.unpin(device_region(&heap, s1)).unwrap();
        assert!(heap.allocate(1000, 500, AllocFlags::empty()).is_ok());
        assert!(!heap.surface(s1).unwrap().is_device_resident());
        heap.validate_invariants();
    }

    #[test]
    fn test_stats_track_activity() {
        let mut heap = heap();
        let a = heap.create_surface(1000, 400, AllocFlags::empty()).unwrap();
        heap.create_surface(1000, 600, AllocFlags::empty()).unwrap();
        heap.create_surface(1000, 400, AllocFlags::empty()).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.allocs, 3);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.peak_resident, POOL);
        assert!(!heap.surface(a).unwrap().is_device_resident());
    }

    #[test]
    fn test_teardown_returns_engine() {
        let heap = heap();
        let engine = heap.teardown();
        assert_eq!(engine.aperture().len() as u64, POOL);
    }
}
