//! Address-space and page-fault scenarios.

mod common;

use abi::{AreaFlags, ErrorCode, SysMethod};
use common::{fixture, msg, ok_reply, recv};
use kern::interrupt::{exc_dispatch, ExcContext};
use kern::mm::{PfAccess, PAGE_SIZE};
use kern::{console, syscalls, task, umem};

fn rw() -> AreaFlags {
    AreaFlags::READ | AreaFlags::WRITE | AreaFlags::ANON
}

#[test]
fn anonymous_pages_read_as_zero_and_charge_frames() {
    // E5: three pages, each zero on first touch, three frames after.
    let f = fixture();
    let k = &f.k;
    const V: usize = 0x4000_0000;
    syscalls::as_area_create(k, f.a, V, 3 * PAGE_SIZE, rw()).unwrap();
    let space = task::addrspace_of(k, f.a).unwrap();

    let before = k.frames.allocated();
    for i in 0..3 {
        let mut byte = [0xA5u8];
        umem::copy_from_uspace(&k.frames, &space, V + i * PAGE_SIZE, &mut byte).unwrap();
        assert_eq!(byte[0], 0);
    }
    assert_eq!(k.frames.allocated(), before + 3);
}

#[test]
fn share_then_write_is_seen_by_every_sharer() {
    // E6: write in one sharer, read in the other; destroying the writer's
    // area must not free the frame.
    let f = fixture();
    let k = &f.k;
    const VA: usize = 0x4100_0000;
    const VB: usize = 0x5100_0000;
    syscalls::as_area_create(k, f.a, VA, PAGE_SIZE, rw()).unwrap();
    let a_space = task::addrspace_of(k, f.a).unwrap();
    let b_space = task::addrspace_of(k, f.b).unwrap();

    // Touch the page so the share map has something to pin.
    umem::copy_to_uspace(&k.frames, &a_space, &[0u8], VA).unwrap();
    let b_id = task::current_id(k, f.b);
    syscalls::as_area_share(k, f.a, VA, b_id, VB, AreaFlags::empty()).unwrap();

    umem::copy_to_uspace(&k.frames, &a_space, &[0xBE], VA + 16).unwrap();
    let mut got = [0u8];
    umem::copy_from_uspace(&k.frames, &b_space, VB + 16, &mut got).unwrap();
    assert_eq!(got[0], 0xBE);

    let frames_before = k.frames.allocated();
    syscalls::as_area_destroy(k, f.a, VA).unwrap();
    // Still mapped in b and pinned by the share map.
    assert_eq!(k.frames.allocated(), frames_before);
    let mut still = [0u8];
    umem::copy_from_uspace(&k.frames, &b_space, VB + 16, &mut still).unwrap();
    assert_eq!(still[0], 0xBE);
}

#[test]
fn share_propagates_pages_faulted_in_after_the_share() {
    let f = fixture();
    let k = &f.k;
    const VA: usize = 0x4200_0000;
    const VB: usize = 0x5200_0000;
    syscalls::as_area_create(k, f.a, VA, 2 * PAGE_SIZE, rw()).unwrap();
    let a_space = task::addrspace_of(k, f.a).unwrap();
    let b_space = task::addrspace_of(k, f.b).unwrap();

    let b_id = task::current_id(k, f.b);
    syscalls::as_area_share(k, f.a, VA, b_id, VB, AreaFlags::empty()).unwrap();

    // Page two did not exist at share time; it must still end up shared.
    umem::copy_to_uspace(&k.frames, &b_space, b"late", VB + PAGE_SIZE + 8).unwrap();
    let mut got = [0u8; 4];
    umem::copy_from_uspace(&k.frames, &a_space, VA + PAGE_SIZE + 8, &mut got).unwrap();
    assert_eq!(&got, b"late");
}

#[test]
fn share_handshake_over_ipc() {
    // The kernel-mediated flavor of E6: SHARE_OUT fills the size at send
    // time and performs the mapping when the recipient accepts.
    let f = fixture();
    let k = &f.k;
    const VA: usize = 0x4300_0000;
    const VB: usize = 0x5300_0000;
    syscalls::as_area_create(k, f.a, VA, 2 * PAGE_SIZE, rw()).unwrap();
    let a_space = task::addrspace_of(k, f.a).unwrap();
    let b_space = task::addrspace_of(k, f.b).unwrap();
    umem::copy_to_uspace(&k.frames, &a_space, &[0x77], VA + 5).unwrap();

    let pending = syscalls::ipc_call_async(
        k,
        f.a,
        f.a_to_b,
        msg(SysMethod::ShareOut as usize, [VA, 0, rw().bits() as usize, 0, 0]),
    )
    .unwrap();
    let r = recv(k, f.b);
    assert_eq!(r.msg.arg(2), 2 * PAGE_SIZE);
    let mut accept = ok_reply();
    accept.set_arg(1, VB);
    syscalls::ipc_answer(k, f.b, r.id, accept).unwrap();

    let rep = recv(k, f.a);
    assert_eq!(rep.id, pending);
    assert_eq!(rep.msg.arg(2), VB);

    let mut got = [0u8];
    umem::copy_from_uspace(&k.frames, &b_space, VB + 5, &mut got).unwrap();
    assert_eq!(got[0], 0x77);
    k.assert_quiescent();
}

#[test]
fn overlapping_area_is_refused() {
    let f = fixture();
    let k = &f.k;
    const V: usize = 0x4400_0000;
    syscalls::as_area_create(k, f.a, V, 4 * PAGE_SIZE, rw()).unwrap();
    let e = syscalls::as_area_create(k, f.a, V + PAGE_SIZE, PAGE_SIZE, rw()).unwrap_err();
    assert_eq!(e, kern::err::UserError::Recoverable(ErrorCode::Overlap));
}

#[test]
fn shared_area_refuses_resize() {
    let f = fixture();
    let k = &f.k;
    const VA: usize = 0x4500_0000;
    const VB: usize = 0x5500_0000;
    syscalls::as_area_create(k, f.a, VA, PAGE_SIZE, rw()).unwrap();
    let b_id = task::current_id(k, f.b);
    syscalls::as_area_share(k, f.a, VA, b_id, VB, AreaFlags::empty()).unwrap();
    let e = syscalls::as_area_resize(k, f.a, VA, 2 * PAGE_SIZE).unwrap_err();
    assert_eq!(e, kern::err::UserError::Recoverable(ErrorCode::NotSup));
}

#[test]
fn fault_servicing_skips_tlb_shootdown() {
    let f = fixture();
    let k = &f.k;
    const V: usize = 0x4600_0000;
    syscalls::as_area_create(k, f.a, V, 8 * PAGE_SIZE, rw()).unwrap();
    let space = task::addrspace_of(k, f.a).unwrap();

    assert_eq!(space.page_table.shootdown_count(), 0);
    for i in 0..8 {
        umem::copy_to_uspace(&k.frames, &space, &[1], V + i * PAGE_SIZE).unwrap();
    }
    assert_eq!(space.page_table.shootdown_count(), 0);
    // Invalidation, on the other hand, must shoot down.
    syscalls::as_area_destroy(k, f.a, V).unwrap();
    assert_eq!(space.page_table.shootdown_count(), 8);
}

#[test]
fn unserviceable_user_fault_kills_the_task() {
    let f = fixture();
    let k = &f.k;
    let victim = task::create(k).unwrap();
    let ctx = ExcContext {
        addr: 0xdead_0000,
        access: PfAccess::Write,
        task: Some(victim.index()),
        user: true,
    };
    exc_dispatch(k, kern::arch::EXC_PF, &ctx);
    assert!(!task::status(k, victim.index()).alive);
    let events = k.drain_fault_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].task, victim);
}

#[test]
fn serviceable_fault_through_the_vector_maps_the_page() {
    let f = fixture();
    let k = &f.k;
    const V: usize = 0x4700_0000;
    syscalls::as_area_create(k, f.a, V, PAGE_SIZE, rw()).unwrap();
    let ctx = ExcContext {
        addr: V + 123,
        access: PfAccess::Write,
        task: Some(f.a),
        user: true,
    };
    exc_dispatch(k, kern::arch::EXC_PF, &ctx);
    assert!(task::status(k, f.a).alive);
    let space = task::addrspace_of(k, f.a).unwrap();
    assert_eq!(space.page_table.mapped_pages(), 1);
}

#[test]
fn console_enumerates_the_exception_vector() {
    let f = fixture();
    let out = console::execute(&f.k, "exc").unwrap();
    assert!(out.contains("pf"));
    assert!(out.contains("page fault"));
    assert_eq!(
        console::execute(&f.k, "bogus"),
        Err(ErrorCode::NotSup)
    );
    let help = console::execute(&f.k, "help").unwrap();
    assert!(help.contains("exc"));
}
