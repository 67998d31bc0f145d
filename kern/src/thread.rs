//! Kernel thread identity.
//!
//! A thread is the schedulable unit; it is bound to at most one task for
//! its whole life. The kernel only needs a thin identity per thread: a
//! parker (the scheduler's block/unblock contract), an interrupt flag for
//! sleep cancellation, and a marker telling the page-fault path that the
//! thread is currently inside a kernel copy of user memory.
//!
//! Hosted, every OS thread that enters the kernel gets an identity lazily;
//! binding to a task is explicit and feeds the task's thread count.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

/// Sentinel for a thread not bound to any task.
const NO_TASK: usize = usize::MAX;

pub struct Thread {
    id: usize,
    task: AtomicUsize,
    interrupted: AtomicBool,
    in_uspace_copy: AtomicBool,
    parker: arch::Parker,
}

impl Thread {
    fn new() -> Arc<Self> {
        Arc::new(Thread {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            task: AtomicUsize::new(NO_TASK),
            interrupted: AtomicBool::new(false),
            in_uspace_copy: AtomicBool::new(false),
            parker: arch::Parker::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Index of the task this thread is bound to, if any.
    pub fn task(&self) -> Option<usize> {
        match self.task.load(Ordering::Relaxed) {
            NO_TASK => None,
            t => Some(t),
        }
    }

    pub(crate) fn bind(&self, task: usize) {
        self.task.store(task, Ordering::Relaxed);
    }

    pub(crate) fn unbind(&self) {
        self.task.store(NO_TASK, Ordering::Relaxed);
    }

    /// Requests cancellation of this thread's current or next interruptible
    /// sleep. Sticky until a sleep observes it.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        self.parker.unpark();
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn parker(&self) -> &arch::Parker {
        &self.parker
    }

    pub(crate) fn unpark(&self) {
        self.parker.unpark();
    }

    pub(crate) fn set_in_uspace_copy(&self, v: bool) {
        self.in_uspace_copy.store(v, Ordering::Relaxed);
    }

    pub(crate) fn in_uspace_copy(&self) -> bool {
        self.in_uspace_copy.load(Ordering::Relaxed)
    }
}

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Thread>>> =
        std::cell::RefCell::new(None);
}

/// Returns the executing thread's kernel identity, creating it on first
/// use.
#[cfg(not(target_os = "none"))]
pub fn current() -> Arc<Thread> {
    CURRENT.with(|c| {
        let mut c = c.borrow_mut();
        if c.is_none() {
            *c = Some(Thread::new());
        }
        c.as_ref().map(Arc::clone).expect("just initialized")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_per_thread() {
        let a = current();
        let b = current();
        assert_eq!(a.id(), b.id());

        let other = std::thread::spawn(|| current().id()).join().unwrap();
        assert_ne!(a.id(), other);
    }

    #[test]
    fn interrupt_flag_is_sticky_until_taken() {
        let t = current();
        t.interrupt();
        assert!(t.take_interrupt());
        assert!(!t.take_interrupt());
    }
}
