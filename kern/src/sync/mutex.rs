//! Sleeping synchronization, built on the wait queue.
//!
//! The counting [`Semaphore`] is the primitive; [`Mutex`] is a binary
//! semaphore with a guard. These block the calling thread, so they must
//! never be taken while a spinlock is held (the wait queue asserts this in
//! debug builds) and never from interrupt context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicIsize, Ordering};

use super::waitq::{SleepFlags, WaitQueue, WakeupPolicy};

pub struct Semaphore {
    count: AtomicIsize,
    wq: WaitQueue,
}

impl Semaphore {
    pub const fn new(name: &'static str, count: isize) -> Self {
        Self {
            count: AtomicIsize::new(count),
            wq: WaitQueue::new(name),
        }
    }

    pub fn down(&self) {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        if old <= 0 {
            // The missed-wakeup counter makes the up() race harmless.
            self.wq.sleep(None, SleepFlags::empty());
        }
    }

    pub fn up(&self) {
        let old = self.count.fetch_add(1, Ordering::AcqRel);
        if old < 0 {
            self.wq.wakeup(WakeupPolicy::First);
        }
    }

    /// Takes the semaphore only if that does not require sleeping.
    pub fn try_down(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur <= 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(c) => cur = c,
            }
        }
    }
}

/// Mutual exclusion that sleeps instead of spinning. Used by the
/// address-space layer, where critical sections allocate frames and may
/// themselves block.
pub struct Mutex<T> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            sem: Semaphore::new(name, 1),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.sem.down();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.sem.try_down() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.sem.up();
    }
}
