//! Area backends.
//!
//! A backend is the policy that services faults in an address-space area:
//! where frames come from, what sharing means, and how frames are given
//! back. Each backend implements the same three capabilities; the area
//! holds the tagged variant. Only the anonymous backend lives in this
//! tree; file-mapped and device-window backends would slot in beside it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use abi::ErrorCode;

use super::addrspace::AreaInner;
use super::frame::{FrameId, FrameTable};
use super::page::{PageTable, Pte};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum AreaBackend {
    /// Demand-allocated, zero-filled memory; copy-on-share via the
    /// share-info page map.
    Anon,
}

impl AreaBackend {
    /// Services a fault at `page` (already page-aligned, already known to
    /// be inside the area and permitted). The area lock is held; the
    /// share-info lock is taken below it.
    pub(super) fn page_fault(
        self,
        frames: &FrameTable,
        pt: &PageTable,
        base: usize,
        area: &mut AreaInner,
        page: usize,
    ) -> Result<(), ErrorCode> {
        match self {
            AreaBackend::Anon => anon_page_fault(frames, pt, base, area, page),
        }
    }

    /// Gives back one mapping's reference to `frame`. Shared frames
    /// survive until the last reference (including the share-map pin)
    /// goes.
    pub(super) fn frame_free(self, frames: &FrameTable, _page: usize, frame: FrameId) {
        match self {
            AreaBackend::Anon => {
                frames.release(frame);
            }
        }
    }

    /// Snapshots every present page of the area into `pagemap`, pinning
    /// each frame. After this, faults in any sharing address space consult
    /// the map first.
    pub(super) fn share(
        self,
        frames: &FrameTable,
        pt: &PageTable,
        base: usize,
        area: &AreaInner,
        pagemap: &mut BTreeMap<usize, FrameId>,
    ) {
        match self {
            AreaBackend::Anon => anon_share(frames, pt, base, area, pagemap),
        }
    }
}

fn anon_page_fault(
    frames: &FrameTable,
    pt: &PageTable,
    base: usize,
    area: &mut AreaInner,
    page: usize,
) -> Result<(), ErrorCode> {
    let frame = match area.sh_info.as_ref().map(Arc::clone) {
        Some(sh) => {
            // Shared area: the frame may already be recorded in the share
            // map. Even a shared area can carry a not-yet-allocated page,
            // in which case the allocation goes into the map so every
            // sharer finds it.
            let mut s = sh.inner.lock();
            match s.pagemap.get(&(page - base)).copied() {
                Some(f) => {
                    frames.add_ref(f);
                    f
                }
                None => {
                    let f = frames.alloc_zeroed()?;
                    // The allocation's reference becomes the map's pin;
                    // the mapping takes its own.
                    s.pagemap.insert(page - base, f);
                    frames.add_ref(f);
                    f
                }
            }
        }
        None => frames.alloc_zeroed()?,
    };

    // Fresh insertion: no TLB shootdown needed.
    pt.insert(
        page,
        Pte {
            frame,
            flags: area.flags,
        },
    );
    if !area.used_space.insert(page) {
        panic!("used space: page {:#x} already tracked", page);
    }
    Ok(())
}

fn anon_share(
    frames: &FrameTable,
    pt: &PageTable,
    base: usize,
    area: &AreaInner,
    pagemap: &mut BTreeMap<usize, FrameId>,
) {
    for &page in &area.used_space {
        let pte = pt.find(page).expect("used page lost its mapping");
        pagemap.insert(page - base, pte.frame);
        frames.add_ref(pte.frame);
    }
}
