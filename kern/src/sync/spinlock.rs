//! Spinlocks, with and without IRQ discipline.
//!
//! The plain [`Spinlock`] is a test-and-test-and-set lock with a pause hint
//! on the contended path. Debug builds add two diagnostics: a per-call
//! probe counter that logs a warning (naming the lock and the call site)
//! when a lock has been spun on for suspiciously long, and an owner check
//! that makes releasing a lock from the wrong CPU fatal. The probe is
//! purely diagnostic; it never resolves anything.
//!
//! [`IrqSpinlock`] layers interrupt discipline on top: acquiring disables
//! interrupts on this CPU, and dropping the guard restores whatever state
//! was captured. The [`IrqGuard::pass`] and [`IrqGuard::exchange`] methods
//! move ownership between locks without re-enabling interrupts in between,
//! so "interrupts stay off while any lock in the chain is held" holds
//! across handoffs by construction.

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;

use super::ordering::{self, LockRank};

/// Spin iterations after which the debug probe complains.
pub const DEADLOCK_THRESHOLD: u64 = 10_000_000;

pub struct Spinlock<T> {
    name: &'static str,
    rank: LockRank,
    locked: AtomicBool,
    /// CPU id plus one of the current holder; zero when unheld. Maintained
    /// for the release check, so only meaningful in debug builds.
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, rank: LockRank, value: T) -> Self {
        Self {
            name,
            rank,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[track_caller]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let caller = Location::caller();
        let mut probe: u64 = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch::spin_hint();
                if cfg!(debug_assertions) {
                    probe += 1;
                    if probe > DEADLOCK_THRESHOLD {
                        probe = 0;
                        log::warn!(
                            "deadlock probe: spinning on {} from {}",
                            self.name,
                            caller,
                        );
                    }
                }
            }
        }
        self.acquired()
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(self.acquired())
        } else {
            None
        }
    }

    fn acquired(&self) -> SpinGuard<'_, T> {
        self.owner.store(arch::cpu_id() + 1, Ordering::Relaxed);
        ordering::note_acquire(self.rank, self.addr());
        SpinGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for SpinGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            let me = arch::cpu_id() + 1;
            let owner = self.lock.owner.load(Ordering::Relaxed);
            if owner != me {
                panic!(
                    "spinlock {}: released on cpu{} but held by cpu{}",
                    self.lock.name,
                    me - 1,
                    owner.wrapping_sub(1),
                );
            }
        }
        self.lock.owner.store(0, Ordering::Relaxed);
        ordering::note_release(self.lock.rank, self.lock.addr());
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A spinlock that additionally disables interrupts while held.
pub struct IrqSpinlock<T> {
    inner: Spinlock<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(name: &'static str, rank: LockRank, value: T) -> Self {
        Self {
            inner: Spinlock::new(name, rank, value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    #[track_caller]
    pub fn lock(&self) -> IrqGuard<'_, T> {
        let irq_state = arch::interrupts_disable();
        IrqGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            irq_state,
        }
    }

    pub fn try_lock(&self) -> Option<IrqGuard<'_, T>> {
        let irq_state = arch::interrupts_disable();
        match self.inner.try_lock() {
            Some(g) => Some(IrqGuard {
                guard: ManuallyDrop::new(g),
                irq_state,
            }),
            None => {
                arch::interrupts_restore(irq_state);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct IrqGuard<'a, T> {
    guard: ManuallyDrop<SpinGuard<'a, T>>,
    irq_state: bool,
}

impl<'a, T> IrqGuard<'a, T> {
    /// Releases this lock and acquires `next` without re-enabling
    /// interrupts in between. The interrupt state captured by the original
    /// acquisition travels with the returned guard.
    #[track_caller]
    pub fn pass<'b, U>(mut self, next: &'b IrqSpinlock<U>) -> IrqGuard<'b, U> {
        let irq_state = self.irq_state;
        unsafe { ManuallyDrop::drop(&mut self.guard) }
        core::mem::forget(self);
        IrqGuard {
            guard: ManuallyDrop::new(next.inner.lock()),
            irq_state,
        }
    }

    /// Acquires `next` hand-over-hand while still holding this lock, then
    /// releases this one. Interrupts stay disabled throughout. When `next`
    /// is of the same lock class, it must follow this lock in address
    /// order.
    #[track_caller]
    pub fn exchange<'b, U>(mut self, next: &'b IrqSpinlock<U>) -> IrqGuard<'b, U> {
        let irq_state = self.irq_state;
        let g = next.inner.lock();
        unsafe { ManuallyDrop::drop(&mut self.guard) }
        core::mem::forget(self);
        IrqGuard {
            guard: ManuallyDrop::new(g),
            irq_state,
        }
    }
}

impl<'a, T> Deref for IrqGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for IrqGuard<'a, T> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.guard) }
        arch::interrupts_restore(self.irq_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_under_contention() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 10_000;

        let lock = Arc::new(Spinlock::new("test_counter", LockRank::Console, 0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), THREADS * ROUNDS);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new("test_try", LockRank::Console, ());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn irq_guard_restores_state() {
        let lock = IrqSpinlock::new("test_irq", LockRank::Console, ());
        assert!(crate::arch::interrupts_enabled());
        let g = lock.lock();
        assert!(!crate::arch::interrupts_enabled());
        drop(g);
        assert!(crate::arch::interrupts_enabled());
    }

    #[test]
    fn pass_keeps_interrupts_disabled() {
        let a = IrqSpinlock::new("test_pass_a", LockRank::Answerbox, 1u32);
        let b = IrqSpinlock::new("test_pass_b", LockRank::Phone, 2u32);
        let ga = a.lock();
        assert!(!crate::arch::interrupts_enabled());
        let gb = ga.pass(&b);
        // Interrupts never came back on between the two locks.
        assert!(!crate::arch::interrupts_enabled());
        assert!(!a.is_locked());
        assert_eq!(*gb, 2);
        drop(gb);
        assert!(crate::arch::interrupts_enabled());
    }

    #[test]
    fn exchange_is_hand_over_hand() {
        let a = IrqSpinlock::new("test_exch_a", LockRank::Answerbox, ());
        let b = IrqSpinlock::new("test_exch_b", LockRank::Phone, ());
        let ga = a.lock();
        let gb = ga.exchange(&b);
        assert!(!a.is_locked());
        assert!(b.is_locked());
        drop(gb);
        assert!(crate::arch::interrupts_enabled());
    }
}
