//! Lock acquisition order.
//!
//! Every spinlock in the kernel belongs to one of the classes below, and
//! locks must be acquired in nondecreasing class order: task list before
//! task, task before thread, answerbox before phone, and so on down to the
//! leaf diagnostics locks. Two locks of the *same* class may only be held
//! together when taken in address order (the answer path does this for the
//! two answerboxes involved).
//!
//! Debug builds keep a per-thread stack of held locks and assert the order
//! on every acquisition; release builds compile all of this away.

/// Lock classes, least-deeply-nested first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    TaskList = 1,
    Task,
    Thread,
    Answerbox,
    Phone,
    WaitQueue,
    CallSlab,
    PageTable,
    FrameTable,
    Exception,
    Console,
}

#[cfg(all(debug_assertions, not(target_os = "none")))]
mod held {
    use super::LockRank;

    std::thread_local! {
        static HELD: std::cell::RefCell<Vec<(LockRank, usize)>> =
            std::cell::RefCell::new(Vec::new());
    }

    pub fn note_acquire(rank: LockRank, addr: usize) {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(&(top_rank, top_addr)) = h.last() {
                assert!(
                    rank > top_rank || (rank == top_rank && addr > top_addr),
                    "lock order violation: acquiring {:?} while holding {:?}",
                    rank,
                    top_rank,
                );
            }
            h.push((rank, addr));
        });
    }

    pub fn note_release(rank: LockRank, addr: usize) {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            let pos = h
                .iter()
                .rposition(|&e| e == (rank, addr))
                .expect("releasing a lock this thread does not hold");
            h.remove(pos);
        });
    }

    pub fn assert_sleepable() {
        HELD.with(|h| {
            let h = h.borrow();
            assert!(
                h.is_empty(),
                "blocking while holding spinlock of rank {:?}",
                h.last().map(|e| e.0),
            );
        });
    }
}

#[cfg(all(debug_assertions, not(target_os = "none")))]
pub(crate) use self::held::{assert_sleepable, note_acquire, note_release};

#[cfg(not(all(debug_assertions, not(target_os = "none"))))]
mod held_stub {
    use super::LockRank;

    #[inline(always)]
    pub fn note_acquire(_rank: LockRank, _addr: usize) {}

    #[inline(always)]
    pub fn note_release(_rank: LockRank, _addr: usize) {}

    #[inline(always)]
    pub fn assert_sleepable() {}
}

#[cfg(not(all(debug_assertions, not(target_os = "none"))))]
pub(crate) use self::held_stub::{assert_sleepable, note_acquire, note_release};
