//! TLB shootdown interface.
//!
//! Only invalidations of existing translations need a shootdown; fresh
//! insertions during a fault skip it. Hosted there is no TLB, so this is
//! bookkeeping over the port contract; the counter lets tests confirm that
//! fault servicing stays shootdown-free.

use core::sync::atomic::{AtomicUsize, Ordering};

static SHOOTDOWNS: AtomicUsize = AtomicUsize::new(0);

pub fn shootdown(_page: usize, _count: usize) {
    SHOOTDOWNS.fetch_add(1, Ordering::Relaxed);
}

pub fn shootdown_count() -> usize {
    SHOOTDOWNS.load(Ordering::Relaxed)
}
