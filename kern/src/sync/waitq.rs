//! Wait queues.
//!
//! A wait queue is a FIFO of blocked threads plus a counter of wakeups that
//! arrived while nobody was sleeping, so a wakeup issued before the sleep
//! is never lost. Threads released from the same queue become runnable in
//! the order they slept.
//!
//! Missed-wakeup policy: `wakeup(First)` on an empty queue increments the
//! counter; `wakeup(All)` releases every queued sleeper and then leaves the
//! counter at no less than one, so one late sleeper also passes through.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::thread::{self, Thread};

use super::ordering::{self, LockRank};
use super::spinlock::IrqSpinlock;

bitflags::bitflags! {
    pub struct SleepFlags: u32 {
        /// Return `WouldBlock` instead of sleeping when no wakeup is
        /// available.
        const NON_BLOCKING = 1 << 0;
        /// Allow the sleep to be cancelled by `Thread::interrupt`.
        const INTERRUPTIBLE = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SleepOutcome {
    /// A wakeup was consumed.
    Ok,
    /// Nothing available and `NON_BLOCKING` was set.
    WouldBlock,
    /// The timeout elapsed first.
    TimedOut,
    /// The sleep was cancelled.
    Interrupted,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeupPolicy {
    /// Release the longest sleeper, or bank the wakeup if none.
    First,
    /// Release every queued sleeper.
    All,
}

struct Sleeper {
    thread: Arc<Thread>,
    /// Set under the queue lock when a wakeup is assigned to this sleeper.
    /// A granted sleeper always reports `Ok`, even if cancellation or a
    /// timeout raced in; the wakeup must not be lost.
    granted: AtomicBool,
}

pub struct WaitQueue {
    inner: IrqSpinlock<WaitQueueInner>,
}

struct WaitQueueInner {
    missed_wakeups: usize,
    sleepers: VecDeque<Arc<Sleeper>>,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            inner: IrqSpinlock::new(
                name,
                LockRank::WaitQueue,
                WaitQueueInner {
                    missed_wakeups: 0,
                    sleepers: VecDeque::new(),
                },
            ),
        }
    }

    /// Blocks the calling thread until a wakeup is available.
    ///
    /// `timeout` is in kernel ticks; `None` sleeps indefinitely. Returns
    /// [`SleepOutcome::Ok`] when a wakeup was consumed, including one that
    /// was banked before this call.
    pub fn sleep(&self, timeout: Option<u64>, flags: SleepFlags) -> SleepOutcome {
        let me = thread::current();
        let sleeper;
        {
            let mut q = self.inner.lock();
            if q.missed_wakeups > 0 {
                q.missed_wakeups -= 1;
                return SleepOutcome::Ok;
            }
            if flags.contains(SleepFlags::NON_BLOCKING) {
                return SleepOutcome::WouldBlock;
            }
            if flags.contains(SleepFlags::INTERRUPTIBLE) && me.take_interrupt() {
                return SleepOutcome::Interrupted;
            }
            sleeper = Arc::new(Sleeper {
                thread: Arc::clone(&me),
                granted: AtomicBool::new(false),
            });
            q.sleepers.push_back(Arc::clone(&sleeper));
        }

        let deadline = timeout.map(|t| arch::now().offset(t));
        loop {
            ordering::assert_sleepable();
            match deadline {
                Some(d) => {
                    let now = arch::now();
                    if now < d {
                        me.parker()
                            .park_timeout(arch::ticks_to_duration(now.until(d)));
                    }
                }
                None => me.parker().park(),
            }

            let mut q = self.inner.lock();
            if sleeper.granted.load(Ordering::Relaxed) {
                return SleepOutcome::Ok;
            }
            if flags.contains(SleepFlags::INTERRUPTIBLE) && me.take_interrupt() {
                Self::remove_sleeper(&mut q, &sleeper);
                return SleepOutcome::Interrupted;
            }
            if let Some(d) = deadline {
                if arch::now() >= d {
                    Self::remove_sleeper(&mut q, &sleeper);
                    return SleepOutcome::TimedOut;
                }
            }
            // Spurious wakeup (e.g. a stale park token); go around.
        }
    }

    fn remove_sleeper(q: &mut WaitQueueInner, sleeper: &Arc<Sleeper>) {
        if let Some(pos) = q.sleepers.iter().position(|s| Arc::ptr_eq(s, sleeper)) {
            q.sleepers.remove(pos);
        }
    }

    pub fn wakeup(&self, policy: WakeupPolicy) {
        let mut q = self.inner.lock();
        match policy {
            WakeupPolicy::First => match q.sleepers.pop_front() {
                Some(s) => Self::release(&s),
                None => q.missed_wakeups += 1,
            },
            WakeupPolicy::All => {
                while let Some(s) = q.sleepers.pop_front() {
                    Self::release(&s);
                }
                if q.missed_wakeups == 0 {
                    q.missed_wakeups = 1;
                }
            }
        }
    }

    fn release(s: &Sleeper) {
        s.granted.store(true, Ordering::Relaxed);
        s.thread.unpark();
    }

    /// Number of banked wakeups. Diagnostic.
    pub fn missed_wakeups(&self) -> usize {
        self.inner.lock().missed_wakeups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn banked_wakeup_is_not_lost() {
        let q = WaitQueue::new("test_wq_banked");
        q.wakeup(WakeupPolicy::First);
        assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
    }

    #[test]
    fn non_blocking_reports_would_block() {
        let q = WaitQueue::new("test_wq_nb");
        assert_eq!(
            q.sleep(None, SleepFlags::NON_BLOCKING),
            SleepOutcome::WouldBlock
        );
    }

    #[test]
    fn timed_sleep_expires() {
        let q = WaitQueue::new("test_wq_timeout");
        assert_eq!(q.sleep(Some(20), SleepFlags::empty()), SleepOutcome::TimedOut);
    }

    #[test]
    fn sleepers_wake_in_fifo_order() {
        let q = StdArc::new(WaitQueue::new("test_wq_fifo"));
        let order = StdArc::new(crate::sync::Spinlock::new(
            "test_wq_order",
            LockRank::Console,
            Vec::new(),
        ));

        let mut handles = Vec::new();
        for i in 0..4 {
            let q = StdArc::clone(&q);
            let order = StdArc::clone(&order);
            handles.push(std::thread::spawn(move || {
                // Stagger arrival so queue order is deterministic.
                std::thread::sleep(std::time::Duration::from_millis(25 * i as u64));
                assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
                order.lock().push(i);
            }));
        }
        std::thread::sleep(std::time::Duration::from_millis(300));
        for _ in 0..4 {
            q.wakeup(WakeupPolicy::First);
            std::thread::sleep(std::time::Duration::from_millis(30));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn wakeup_all_leaves_one_pass_through() {
        let q = WaitQueue::new("test_wq_all");
        q.wakeup(WakeupPolicy::All);
        assert_eq!(q.missed_wakeups(), 1);
        assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
        assert_eq!(q.missed_wakeups(), 0);
    }

    #[test]
    fn interrupt_cancels_sleep() {
        let q = StdArc::new(WaitQueue::new("test_wq_intr"));
        let (tx, rx) = std::sync::mpsc::channel();
        let qq = StdArc::clone(&q);
        let h = std::thread::spawn(move || {
            tx.send(crate::thread::current()).unwrap();
            qq.sleep(None, SleepFlags::INTERRUPTIBLE)
        });
        let t = rx.recv().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        t.interrupt();
        assert_eq!(h.join().unwrap(), SleepOutcome::Interrupted);
    }
}
