//! Kernel access to user memory.
//!
//! Copies between kernel buffers and a task's address space go through the
//! page tables, faulting pages in through the normal backend path as they
//! are touched. While a copy is in progress the thread is marked, so an
//! unserviceable fault surfaces as [`PfOutcome::Defer`] and the copy backs
//! out with an error instead of anyone getting killed; the syscall layer
//! encodes that error into the reply.

use abi::{AreaFlags, ErrorCode};

use crate::mm::{AddressSpace, FrameTable, PfAccess, PfOutcome, PAGE_SIZE};
use crate::thread;

/// Marks the current thread as copying user memory for the duration of the
/// borrow; the page-fault path turns refusals into `Defer` while this is
/// set.
struct CopyCtx;

impl CopyCtx {
    fn enter() -> Self {
        thread::current().set_in_uspace_copy(true);
        CopyCtx
    }
}

impl Drop for CopyCtx {
    fn drop(&mut self) {
        thread::current().set_in_uspace_copy(false);
    }
}

/// Copies `dst.len()` bytes out of `space` starting at `src_va`.
pub fn copy_from_uspace(
    frames: &FrameTable,
    space: &AddressSpace,
    src_va: usize,
    dst: &mut [u8],
) -> Result<(), ErrorCode> {
    let _ctx = CopyCtx::enter();
    let mut va = src_va;
    let mut done = 0;
    while done < dst.len() {
        let page = va & !(PAGE_SIZE - 1);
        let offset = va - page;
        let n = (PAGE_SIZE - offset).min(dst.len() - done);
        match space.page_table.find(page) {
            Some(pte) => {
                if !pte.flags.contains(AreaFlags::READ) {
                    return Err(ErrorCode::Inval);
                }
                frames.read(pte.frame, offset, &mut dst[done..done + n]);
                va += n;
                done += n;
            }
            None => match space.page_fault(frames, va, PfAccess::Read) {
                PfOutcome::Ok => continue,
                PfOutcome::Defer | PfOutcome::Fault => return Err(ErrorCode::Inval),
            },
        }
    }
    Ok(())
}

/// Copies `src` into `space` starting at `dst_va`.
pub fn copy_to_uspace(
    frames: &FrameTable,
    space: &AddressSpace,
    src: &[u8],
    dst_va: usize,
) -> Result<(), ErrorCode> {
    let _ctx = CopyCtx::enter();
    let mut va = dst_va;
    let mut done = 0;
    while done < src.len() {
        let page = va & !(PAGE_SIZE - 1);
        let offset = va - page;
        let n = (PAGE_SIZE - offset).min(src.len() - done);
        match space.page_table.find(page) {
            Some(pte) => {
                if !pte.flags.contains(AreaFlags::WRITE) {
                    return Err(ErrorCode::Inval);
                }
                frames.write(pte.frame, offset, &src[done..done + n]);
                va += n;
                done += n;
            }
            None => match space.page_fault(frames, va, PfAccess::Write) {
                PfOutcome::Ok => continue,
                PfOutcome::Defer | PfOutcome::Fault => return Err(ErrorCode::Inval),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: usize = 0x5000_0000;

    #[test]
    fn round_trip_through_anonymous_area() {
        let frames = FrameTable::new(8);
        let space = AddressSpace::new();
        space
            .area_create(
                V,
                2 * PAGE_SIZE,
                AreaFlags::READ | AreaFlags::WRITE | AreaFlags::ANON,
            )
            .unwrap();

        // Straddle the page boundary on purpose.
        let msg = b"crossing the page boundary";
        let at = V + PAGE_SIZE - 7;
        copy_to_uspace(&frames, &space, msg, at).unwrap();

        let mut back = [0u8; 26];
        copy_from_uspace(&frames, &space, at, &mut back).unwrap();
        assert_eq!(&back, msg);
        assert_eq!(frames.allocated(), 2);
    }

    #[test]
    fn unmapped_destination_fails_without_killing() {
        let frames = FrameTable::new(8);
        let space = AddressSpace::new();
        assert_eq!(
            copy_to_uspace(&frames, &space, b"x", 0x1000),
            Err(ErrorCode::Inval)
        );
    }

    #[test]
    fn first_read_is_zero_filled() {
        let frames = FrameTable::new(8);
        let space = AddressSpace::new();
        space
            .area_create(V, PAGE_SIZE, AreaFlags::READ | AreaFlags::ANON)
            .unwrap();
        let mut buf = [0xEEu8; 32];
        copy_from_uspace(&frames, &space, V + 40, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
    }
}
