//! Hosted platform support.
//!
//! Backs the architecture contract with ordinary OS facilities so the
//! kernel can run, and be tested, as a normal process: "interrupt state" is
//! a per-thread flag, "CPUs" are OS threads, the kernel clock is the host
//! monotonic clock in millisecond ticks, and thread blocking is condvar
//! parking.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::cell::Cell;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Instant;

use crate::time::Timestamp;

/// Nominal page-fault vector of the hosted platform.
pub const EXC_PF: usize = 14;

std::thread_local! {
    static IRQ_ENABLED: Cell<bool> = Cell::new(true);
    static CPU_ID: Cell<usize> = Cell::new(usize::MAX);
}

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Returns a stable identifier for the executing CPU. Hosted, each OS
/// thread counts as its own CPU.
pub fn cpu_id() -> usize {
    CPU_ID.with(|c| {
        if c.get() == usize::MAX {
            c.set(NEXT_CPU.fetch_add(1, Ordering::Relaxed));
        }
        c.get()
    })
}

pub fn interrupts_enabled() -> bool {
    IRQ_ENABLED.with(|f| f.get())
}

/// Disables interrupt delivery on this CPU, returning the previous state
/// for a later `interrupts_restore`.
pub fn interrupts_disable() -> bool {
    IRQ_ENABLED.with(|f| f.replace(false))
}

pub fn interrupts_enable() {
    IRQ_ENABLED.with(|f| f.set(true));
}

pub fn interrupts_restore(enabled: bool) {
    IRQ_ENABLED.with(|f| f.set(enabled));
}

/// Pause hint for contended spin loops.
#[inline(always)]
pub fn spin_hint() {
    core::hint::spin_loop();
}

static BOOT_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Current kernel time. One tick is one millisecond of host time.
pub fn now() -> Timestamp {
    let boot = BOOT_INSTANT.get_or_init(Instant::now);
    Timestamp::from(boot.elapsed().as_millis() as u64)
}

pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_millis(ticks)
}

/// One thread's blocking primitive: the scheduler contract's
/// "make not runnable" / "make runnable" pair, with a token so a wakeup
/// that beats the sleep is not lost.
pub struct Parker {
    token: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Blocks until unparked. Consumes the pending token if one exists.
    pub fn park(&self) {
        let mut token = self.token.lock().unwrap();
        while !*token {
            token = self.cv.wait(token).unwrap();
        }
        *token = false;
    }

    /// Blocks until unparked or until `timeout` elapses. Returns `true` if
    /// a wakeup was consumed, `false` on timeout.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut token = self.token.lock().unwrap();
        while !*token {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (t, _) = self.cv.wait_timeout(token, deadline - now).unwrap();
            token = t;
        }
        *token = false;
        true
    }

    pub fn unpark(&self) {
        let mut token = self.token.lock().unwrap();
        *token = true;
        self.cv.notify_one();
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}
