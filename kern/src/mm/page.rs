//! Per-address-space page tables.
//!
//! Hosted, a "page table" is an ordered map from page-aligned virtual
//! address to [`Pte`]; a real port would maintain the hardware structures
//! behind the same insert/find/unmap surface. The page-table lock sits at
//! the bottom of the mm lock order, below the area and share-info mutexes.

use alloc::collections::BTreeMap;

use abi::AreaFlags;

use crate::sync::{LockRank, Spinlock};

use super::frame::FrameId;
use super::tlb;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: AreaFlags,
}

pub struct PageTable {
    inner: Spinlock<BTreeMap<usize, Pte>>,
    shootdowns: core::sync::atomic::AtomicUsize,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            inner: Spinlock::new("page_table", LockRank::PageTable, BTreeMap::new()),
            shootdowns: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Maps `page` to `pte`. Inserting a fresh translation needs no TLB
    /// shootdown; only invalidations do.
    pub(crate) fn insert(&self, page: usize, pte: Pte) {
        let prev = self.inner.lock().insert(page, pte);
        debug_assert!(prev.is_none(), "remapping a present page");
    }

    pub(crate) fn find(&self, page: usize) -> Option<Pte> {
        self.inner.lock().get(&page).copied()
    }

    /// Removes the translation for `page`, if present, and requests the
    /// shootdown the invalidation requires.
    pub(crate) fn unmap(&self, page: usize) -> Option<Pte> {
        let pte = self.inner.lock().remove(&page);
        if pte.is_some() {
            self.shootdowns
                .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            tlb::shootdown(page, 1);
        }
        pte
    }

    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().len()
    }

    /// Shootdowns this table has requested. Diagnostic.
    pub fn shootdown_count(&self) -> usize {
        self.shootdowns.load(core::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
