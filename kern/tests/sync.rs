//! Concurrency properties of the synchronization primitives, driven with
//! real OS threads against the hosted platform.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kern::sync::{
    IrqSpinlock, LockRank, Mutex, SleepFlags, SleepOutcome, Spinlock, WaitQueue, WakeupPolicy,
};

#[test]
fn spinlock_mutual_exclusion() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50_000;

    let lock = Arc::new(Spinlock::new("stress_counter", LockRank::Console, 0usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
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
fn irq_spinlock_mutual_exclusion() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 20_000;

    let lock = Arc::new(IrqSpinlock::new(
        "stress_irq_counter",
        LockRank::Console,
        0usize,
    ));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
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
fn no_lost_wakeup_under_contention() {
    // Every wakeup that happens-before a sleep must let that sleep pass.
    const ROUNDS: usize = 200;

    let q = Arc::new(WaitQueue::new("stress_wq"));
    let passed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..ROUNDS {
        q.wakeup(WakeupPolicy::First);
    }
    for _ in 0..ROUNDS {
        let q = Arc::clone(&q);
        let passed = Arc::clone(&passed);
        handles.push(thread::spawn(move || {
            assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
            passed.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(passed.load(Ordering::Relaxed), ROUNDS);
    assert_eq!(q.missed_wakeups(), 0);
}

#[test]
fn wakeup_all_releases_every_sleeper() {
    const SLEEPERS: usize = 6;

    let q = Arc::new(WaitQueue::new("stress_wq_all"));
    let woken = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..SLEEPERS {
        let q = Arc::clone(&q);
        let woken = Arc::clone(&woken);
        handles.push(thread::spawn(move || {
            assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
            woken.fetch_add(1, Ordering::Relaxed);
        }));
    }
    // Let everyone get queued.
    thread::sleep(Duration::from_millis(200));
    q.wakeup(WakeupPolicy::All);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::Relaxed), SLEEPERS);
    // The pass-through token lets one late sleeper straight through.
    assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
}

#[test]
fn timed_sleep_wakes_up_if_signaled_in_time() {
    let q = Arc::new(WaitQueue::new("stress_wq_timed"));
    let qq = Arc::clone(&q);
    let h = thread::spawn(move || qq.sleep(Some(5_000), SleepFlags::empty()));
    thread::sleep(Duration::from_millis(100));
    q.wakeup(WakeupPolicy::First);
    assert_eq!(h.join().unwrap(), SleepOutcome::Ok);
}

#[test]
fn mutex_excludes_across_threads() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 5_000;

    let m = Arc::new(Mutex::new("stress_mutex", Vec::new()));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for i in 0..ROUNDS {
                    let mut v = m.lock();
                    v.push(t * ROUNDS + i);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(m.lock().len(), THREADS * ROUNDS);
}

#[test]
fn guard_handoff_spans_queues_without_enabling_interrupts() {
    // Chained handoff: ownership moves a -> b -> c with interrupts held
    // off for the whole chain.
    let a = IrqSpinlock::new("chain_a", LockRank::Answerbox, 'a');
    let b = IrqSpinlock::new("chain_b", LockRank::Phone, 'b');
    let c = IrqSpinlock::new("chain_c", LockRank::WaitQueue, 'c');

    let ga = a.lock();
    let gb = ga.pass(&b);
    assert!(!kern::arch::interrupts_enabled());
    let gc = gb.exchange(&c);
    assert!(!kern::arch::interrupts_enabled());
    assert!(!a.is_locked());
    assert!(!b.is_locked());
    assert_eq!(*gc, 'c');
    drop(gc);
    assert!(kern::arch::interrupts_enabled());
}
