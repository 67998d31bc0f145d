//! Kernel synchronization primitives.
//!
//! Spinlocks (with the IRQ-disabling variant) are the only primitives that
//! may be taken from interrupt context; everything that can block is built
//! on the wait queue. The global acquisition order between lock classes is
//! declared in [`ordering::LockRank`] and checked in debug builds.

pub mod mutex;
pub mod ordering;
pub mod spinlock;
pub mod waitq;

pub use self::mutex::{Mutex, MutexGuard, Semaphore};
pub use self::ordering::LockRank;
pub use self::spinlock::{IrqGuard, IrqSpinlock, SpinGuard, Spinlock};
pub use self::waitq::{SleepFlags, SleepOutcome, WaitQueue, WakeupPolicy};
