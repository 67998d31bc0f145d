//! Address spaces and the page-fault path.
//!
//! An address space is a set of disjoint areas, each a contiguous run of
//! pages with permission flags and a backend. Areas live in an ordered map
//! keyed by base address, giving O(log n) containing-area lookup. The
//! address-space mutex is taken before any area mutex; a backend may take
//! its share-info mutex below the area's, and the page-table spinlock sits
//! at the bottom.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;

use abi::{AreaFlags, ErrorCode};

use crate::sync::Mutex;
use crate::thread;

use super::backend::AreaBackend;
use super::frame::{FrameId, FrameTable, PAGE_SIZE};
use super::page::PageTable;

/// Access mode that caused a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PfAccess {
    Read,
    Write,
    Exec,
}

/// Result of the page-fault handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PfOutcome {
    /// The fault was serviced (or was spurious); retry the access.
    Ok,
    /// The fault happened inside a kernel copy of user memory and could
    /// not be serviced; the copy must back out and report failure instead
    /// of killing anyone.
    Defer,
    /// Unserviceable. A faulting user task is killed; a kernel fault
    /// panics.
    Fault,
}

pub struct AddressSpace {
    areas: Mutex<BTreeMap<usize, Arc<AsArea>>>,
    pub page_table: PageTable,
}

pub struct AsArea {
    base: usize,
    inner: Mutex<AreaInner>,
}

pub(super) struct AreaInner {
    pub(super) flags: AreaFlags,
    pub(super) pages: usize,
    /// Pages that have been faulted in, for resize/destroy/share
    /// bookkeeping.
    pub(super) used_space: BTreeSet<usize>,
    pub(super) sh_info: Option<Arc<ShareInfo>>,
    pub(super) backend: AreaBackend,
}

/// Frame map shared by every address space that maps one shared area.
pub(super) struct ShareInfo {
    pub(super) inner: Mutex<ShareInner>,
}

pub(super) struct ShareInner {
    /// Number of areas attached to this map.
    pub(super) refs: usize,
    /// Area-relative page offset to pinned frame.
    pub(super) pagemap: BTreeMap<usize, FrameId>,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            areas: Mutex::new("as_areas", BTreeMap::new()),
            page_table: PageTable::new(),
        })
    }

    /// Creates an anonymous area of `size` bytes at `base`.
    pub fn area_create(
        &self,
        base: usize,
        size: usize,
        flags: AreaFlags,
    ) -> Result<(), ErrorCode> {
        if flags.contains(AreaFlags::DEVICE) {
            // No device-window backend in this tree.
            return Err(ErrorCode::NotSup);
        }
        let mut areas = self.areas.lock();
        check_insert(&areas, base, size)?;
        areas.insert(
            base,
            Arc::new(AsArea {
                base,
                inner: Mutex::new(
                    "as_area",
                    AreaInner {
                        flags,
                        pages: size / PAGE_SIZE,
                        used_space: BTreeSet::new(),
                        sh_info: None,
                        backend: AreaBackend::Anon,
                    },
                ),
            }),
        );
        Ok(())
    }

    /// Grows or shrinks the area based at `base`. Shrinking evicts the
    /// pages past the new end; shared areas cannot be resized.
    pub fn area_resize(
        &self,
        frames: &FrameTable,
        base: usize,
        new_size: usize,
    ) -> Result<(), ErrorCode> {
        if new_size == 0 || new_size % PAGE_SIZE != 0 {
            return Err(ErrorCode::Inval);
        }
        let areas = self.areas.lock();
        let area = Arc::clone(areas.get(&base).ok_or(ErrorCode::NoEnt)?);
        let mut ai = area.inner.lock();
        if ai.sh_info.is_some() {
            return Err(ErrorCode::NotSup);
        }
        let new_pages = new_size / PAGE_SIZE;
        if new_pages > ai.pages {
            if let Some((&next_base, _)) = areas.range(base + 1..).next() {
                if next_base < base + new_size {
                    return Err(ErrorCode::Overlap);
                }
            }
        } else {
            let cut: Vec<usize> = ai
                .used_space
                .range(base + new_pages * PAGE_SIZE..)
                .copied()
                .collect();
            for page in cut {
                if let Some(pte) = self.page_table.unmap(page) {
                    let be = ai.backend;
                    be.frame_free(frames, page, pte.frame);
                }
                ai.used_space.remove(&page);
            }
        }
        ai.pages = new_pages;
        Ok(())
    }

    /// Destroys the area based at `base`, unmapping and releasing every
    /// present page and detaching from the share map if the area was
    /// shared.
    pub fn area_destroy(&self, frames: &FrameTable, base: usize) -> Result<(), ErrorCode> {
        let mut areas = self.areas.lock();
        let area = areas.remove(&base).ok_or(ErrorCode::NoEnt)?;
        let mut ai = area.inner.lock();
        let pages: Vec<usize> = ai.used_space.iter().copied().collect();
        for page in pages {
            if let Some(pte) = self.page_table.unmap(page) {
                let be = ai.backend;
                be.frame_free(frames, page, pte.frame);
            }
        }
        ai.used_space.clear();
        if let Some(sh) = ai.sh_info.take() {
            detach_share(frames, &sh);
        }
        Ok(())
    }

    /// Tears down every area. Used when the owning task dies.
    pub(crate) fn destroy_all(&self, frames: &FrameTable) {
        loop {
            let base = match self.areas.lock().keys().next() {
                Some(&b) => b,
                None => break,
            };
            // The map cannot grow behind our back: the owner is gone.
            let _ = self.area_destroy(frames, base);
        }
    }

    /// Services a fault at virtual address `va` with access mode `access`.
    pub fn page_fault(&self, frames: &FrameTable, va: usize, access: PfAccess) -> PfOutcome {
        let page = va & !(PAGE_SIZE - 1);
        let areas = self.areas.lock();
        let area = match find_area(&areas, va) {
            Some(a) => a,
            None => return miss(),
        };
        let mut ai = area.inner.lock();
        if !access_ok(ai.flags, access) {
            return miss();
        }
        if self.page_table.find(page).is_some() {
            // Spurious: another thread resolved it first.
            return PfOutcome::Ok;
        }
        let be = ai.backend;
        match be.page_fault(frames, &self.page_table, area.base, &mut ai, page) {
            Ok(()) => PfOutcome::Ok,
            Err(_) => miss(),
        }
    }

    /// Looks up the flags of the area containing `va`. Diagnostic.
    pub fn area_flags_at(&self, va: usize) -> Option<AreaFlags> {
        let areas = self.areas.lock();
        find_area(&areas, va).map(|a| a.inner.lock().flags)
    }

    /// Size in bytes of the area based at `base`.
    pub fn area_size(&self, base: usize) -> Option<usize> {
        let areas = self.areas.lock();
        let area = areas.get(&base)?;
        let size = area.inner.lock().pages * PAGE_SIZE;
        Some(size)
    }
}

/// Shares the area based at `src_base` of `src` into `dst` at `dst_base`.
///
/// On first share the area's present pages are snapshotted into a fresh
/// share map with their frames pinned; subsequent sharers attach to the
/// same map. The new area's flags are the source's, optionally restricted
/// by `flags_mask`. Returns the destination base.
pub fn area_share(
    frames: &FrameTable,
    src: &AddressSpace,
    src_base: usize,
    dst: &AddressSpace,
    dst_base: usize,
    flags_mask: AreaFlags,
) -> Result<usize, ErrorCode> {
    if core::ptr::eq(src, dst) {
        return Err(ErrorCode::Inval);
    }
    // Two address-space locks: take them in address order.
    let src_first = (src as *const AddressSpace) < (dst as *const AddressSpace);
    let (src_areas, mut dst_areas) = if src_first {
        let a = src.areas.lock();
        let b = dst.areas.lock();
        (a, b)
    } else {
        let b = dst.areas.lock();
        let a = src.areas.lock();
        (a, b)
    };

    let src_area = Arc::clone(src_areas.get(&src_base).ok_or(ErrorCode::NoEnt)?);
    let mut sai = src_area.inner.lock();
    let size = sai.pages * PAGE_SIZE;
    check_insert(&dst_areas, dst_base, size)?;

    let sh = match &sai.sh_info {
        Some(sh) => Arc::clone(sh),
        None => {
            let sh = Arc::new(ShareInfo {
                inner: Mutex::new(
                    "share_info",
                    ShareInner {
                        refs: 1,
                        pagemap: BTreeMap::new(),
                    },
                ),
            });
            {
                let mut s = sh.inner.lock();
                let be = sai.backend;
                be.share(frames, &src.page_table, src_base, &sai, &mut s.pagemap);
            }
            sai.sh_info = Some(Arc::clone(&sh));
            sh
        }
    };
    sh.inner.lock().refs += 1;

    let flags = if flags_mask.is_empty() {
        sai.flags
    } else {
        sai.flags & flags_mask
    };
    dst_areas.insert(
        dst_base,
        Arc::new(AsArea {
            base: dst_base,
            inner: Mutex::new(
                "as_area",
                AreaInner {
                    flags,
                    pages: sai.pages,
                    used_space: BTreeSet::new(),
                    sh_info: Some(sh),
                    backend: sai.backend,
                },
            ),
        }),
    );
    Ok(dst_base)
}

fn detach_share(frames: &FrameTable, sh: &ShareInfo) {
    let mut s = sh.inner.lock();
    s.refs -= 1;
    if s.refs == 0 {
        let pins: Vec<FrameId> = s.pagemap.values().copied().collect();
        s.pagemap.clear();
        for f in pins {
            frames.release(f);
        }
    }
}

fn find_area(areas: &BTreeMap<usize, Arc<AsArea>>, va: usize) -> Option<Arc<AsArea>> {
    let (_, a) = areas.range(..=va).next_back()?;
    let pages = a.inner.lock().pages;
    if va < a.base + pages * PAGE_SIZE {
        Some(Arc::clone(a))
    } else {
        None
    }
}

fn access_ok(flags: AreaFlags, access: PfAccess) -> bool {
    match access {
        PfAccess::Read => flags.contains(AreaFlags::READ),
        PfAccess::Write => flags.contains(AreaFlags::WRITE),
        PfAccess::Exec => flags.contains(AreaFlags::EXEC),
    }
}

fn check_insert(
    areas: &BTreeMap<usize, Arc<AsArea>>,
    base: usize,
    size: usize,
) -> Result<(), ErrorCode> {
    if base % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
        return Err(ErrorCode::Inval);
    }
    let end = base.checked_add(size).ok_or(ErrorCode::Inval)?;
    if let Some((_, prev)) = areas.range(..=base).next_back() {
        let prev_pages = prev.inner.lock().pages;
        if prev.base + prev_pages * PAGE_SIZE > base {
            return Err(ErrorCode::Overlap);
        }
    }
    if let Some((&next_base, _)) = areas.range(base..).next() {
        if next_base < end {
            return Err(ErrorCode::Overlap);
        }
    }
    Ok(())
}

fn miss() -> PfOutcome {
    if thread::current().in_uspace_copy() {
        PfOutcome::Defer
    } else {
        PfOutcome::Fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: usize = 0x4000_0000;

    fn rw() -> AreaFlags {
        AreaFlags::READ | AreaFlags::WRITE | AreaFlags::ANON
    }

    #[test]
    fn overlapping_create_is_refused() {
        let a = AddressSpace::new();
        a.area_create(V, 4 * PAGE_SIZE, rw()).unwrap();
        assert_eq!(
            a.area_create(V + 2 * PAGE_SIZE, 4 * PAGE_SIZE, rw()),
            Err(ErrorCode::Overlap)
        );
        assert_eq!(
            a.area_create(V - PAGE_SIZE, 2 * PAGE_SIZE, rw()),
            Err(ErrorCode::Overlap)
        );
        a.area_create(V + 4 * PAGE_SIZE, PAGE_SIZE, rw()).unwrap();
    }

    #[test]
    fn fault_outside_any_area_is_fatal() {
        let frames = FrameTable::new(8);
        let a = AddressSpace::new();
        assert_eq!(a.page_fault(&frames, 0x1000, PfAccess::Read), PfOutcome::Fault);
    }

    #[test]
    fn fault_with_bad_access_is_fatal() {
        let frames = FrameTable::new(8);
        let a = AddressSpace::new();
        a.area_create(V, PAGE_SIZE, AreaFlags::READ | AreaFlags::ANON)
            .unwrap();
        assert_eq!(a.page_fault(&frames, V, PfAccess::Write), PfOutcome::Fault);
        assert_eq!(a.page_fault(&frames, V, PfAccess::Read), PfOutcome::Ok);
    }

    #[test]
    fn spurious_fault_is_ok() {
        let frames = FrameTable::new(8);
        let a = AddressSpace::new();
        a.area_create(V, PAGE_SIZE, rw()).unwrap();
        assert_eq!(a.page_fault(&frames, V + 17, PfAccess::Read), PfOutcome::Ok);
        assert_eq!(a.page_fault(&frames, V + 17, PfAccess::Read), PfOutcome::Ok);
        assert_eq!(frames.allocated(), 1);
    }

    #[test]
    fn shrink_returns_frames() {
        let frames = FrameTable::new(8);
        let a = AddressSpace::new();
        a.area_create(V, 3 * PAGE_SIZE, rw()).unwrap();
        for i in 0..3 {
            assert_eq!(
                a.page_fault(&frames, V + i * PAGE_SIZE, PfAccess::Write),
                PfOutcome::Ok
            );
        }
        assert_eq!(frames.allocated(), 3);
        a.area_resize(&frames, V, PAGE_SIZE).unwrap();
        assert_eq!(frames.allocated(), 1);
        assert_eq!(a.page_table.mapped_pages(), 1);
    }
}
