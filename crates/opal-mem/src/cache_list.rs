//! # Cache List
//!
//! Allocation-ordered list of every allocated region, used only to pick
//! eviction candidates.
//!
//! The head is the most recently allocated region; eviction scans walk
//! from the tail toward the head so the least-recently-allocated surface
//! is demoted first.

use alloc::vec::Vec;

use crate::arena::{IndexList, RegionArena, RegionState, NIL};

// =============================================================================
// CACHE LIST
// =============================================================================

/// LRU-ordered list of allocated regions.
#[derive(Debug)]
pub struct CacheList {
    list: IndexList,
}

impl CacheList {
    /// Create an empty cache list.
    pub const fn new() -> Self {
        Self {
            list: IndexList::new(),
        }
    }

    /// Number of allocated regions.
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Most recently allocated region.
    pub fn head(&self) -> u32 {
        self.list.head()
    }

    /// Least recently allocated region.
    pub fn tail(&self) -> u32 {
        self.list.tail()
    }

    /// Link a freshly allocated region in as most-recent.
    pub fn insert_head(&mut self, arena: &mut RegionArena, index: u32) {
        debug_assert_ne!(arena.at(index).state, RegionState::Free);
        self.list.push_front(arena, index);
    }

    /// Unlink a region. O(1) through its own stored neighbor indices.
    pub fn remove(&mut self, arena: &mut RegionArena, index: u32) {
        self.list.remove(arena, index);
    }

    /// Oldest region an eviction may demote, walking tail to head.
    ///
    /// Permanent regions, pinned regions, and regions with no owning
    /// surface are skipped. `None` means eviction is exhausted.
    pub fn oldest_evictable(&self, arena: &RegionArena) -> Option<u32> {
        let mut cur = self.list.tail();
        while cur != NIL {
            let region = arena.at(cur);
            if region.is_evictable() {
                return Some(cur);
            }
            cur = region.prev;
        }
        None
    }

    /// Member indices, most recent first.
    pub fn indices(&self, arena: &RegionArena) -> Vec<u32> {
        self.list.indices(arena)
    }
}

impl Default for CacheList {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
