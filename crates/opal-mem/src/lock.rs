//! # Locked Heap
//!
//! Optional [`spin::Mutex`] wrapper around [`OffscreenHeap`].
//!
//! The heap itself is single-threaded and expects its host to serialize
//! access. Hosts that would rather enforce that precondition with a lock
//! wrap the heap in a [`LockedHeap`] and go through [`LockedHeap::lock`].

use opal_core::CopyEngine;

use crate::heap::OffscreenHeap;

// =============================================================================
// LOCKED HEAP
// =============================================================================

/// A heap behind a spinlock, for hosts without a better serialization story.
#[derive(Debug)]
pub struct LockedHeap<E: CopyEngine> {
    inner: spin::Mutex<OffscreenHeap<E>>,
}

impl<E: CopyEngine> LockedHeap<E> {
    /// Wrap an initialized heap.
    pub const fn new(heap: OffscreenHeap<E>) -> Self {
        Self {
            inner: spin::Mutex::new(heap),
        }
    }

    /// Acquire the heap, spinning until it is available.
    pub fn lock(&self) -> spin::MutexGuard<'_, OffscreenHeap<E>> {
        self.inner.lock()
    }

    /// Unwrap the heap, consuming the lock.
    pub fn into_inner(self) -> OffscreenHeap<E> {
        self.inner.into_inner()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::copy::ApertureCopyEngine;
    use crate::heap::AllocFlags;
    use opal_core::ByteSize;

    #[test]
    fn test_operations_go_through_the_guard() {
        let config = HeapConfig::adapter_8bpp(ByteSize::from_bytes(1_000_000));
        let engine = ApertureCopyEngine::new(config.pool_size);
        let heap = OffscreenHeap::init(config, engine).unwrap();
        let locked = LockedHeap::new(heap);

        let handle = locked
            .lock()
            .allocate(100, 100, AllocFlags::empty())
            .unwrap();
        assert_eq!(locked.lock().region_count(), 1);

        locked.lock().free(handle).unwrap();
        let heap = locked.into_inner();
        assert_eq!(heap.free_bytes().as_bytes(), 1_000_000);
    }
}
