//! Exception table and dispatch.
//!
//! Every vector has a named entry with a dispatch counter, so the console
//! can enumerate what has fired and how often. An unhandled exception from
//! user mode kills the task (and emits the fault event); from kernel mode
//! it panics.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use abi::{FaultInfo, FaultSource};

use crate::mm::{PfAccess, PfOutcome};
use crate::startup::Kernel;
use crate::sync::{LockRank, Spinlock};
use crate::task;

/// Number of entries in the exception vector.
pub const IVT_ITEMS: usize = 64;

/// State handed to an exception handler.
#[derive(Copy, Clone, Debug)]
pub struct ExcContext {
    /// Faulting address, where the vector reports one.
    pub addr: usize,
    pub access: PfAccess,
    /// Index of the interrupted task, if the trap came from user mode.
    pub task: Option<usize>,
    pub user: bool,
}

pub type ExcHandler = fn(&Kernel, &ExcContext) -> bool;

struct ExcEntry {
    name: &'static str,
    desc: &'static str,
    count: u64,
    handler: Option<ExcHandler>,
}

pub struct ExcTable {
    entries: Spinlock<Vec<ExcEntry>>,
}

impl ExcTable {
    pub(crate) fn new() -> Self {
        let mut entries = Vec::with_capacity(IVT_ITEMS);
        for _ in 0..IVT_ITEMS {
            entries.push(ExcEntry {
                name: "undef",
                desc: "undefined",
                count: 0,
                handler: None,
            });
        }
        Self {
            entries: Spinlock::new("exc_table", LockRank::Exception, entries),
        }
    }

    /// Installs a handler for vector `n`, returning the previous one.
    pub fn register(
        &self,
        n: usize,
        name: &'static str,
        desc: &'static str,
        handler: ExcHandler,
    ) -> Option<ExcHandler> {
        let mut e = self.entries.lock();
        let entry = &mut e[n];
        let prev = entry.handler.take();
        entry.name = name;
        entry.desc = desc;
        entry.handler = Some(handler);
        prev
    }

    fn take_for_dispatch(&self, n: usize) -> Option<ExcHandler> {
        let mut e = self.entries.lock();
        let entry = &mut e[n];
        entry.count += 1;
        entry.handler
    }

    /// Formats the vector for the console: one line per entry that has a
    /// handler or has ever fired.
    pub fn format(&self) -> String {
        let e = self.entries.lock();
        let mut out = String::new();
        let _ = writeln!(out, "exc   name        count  description");
        for (n, entry) in e.iter().enumerate() {
            if entry.handler.is_none() && entry.count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{:<5} {:<10} {:>6}  {}",
                n, entry.name, entry.count, entry.desc,
            );
        }
        out
    }
}

/// Routes exception `n` to its handler. Unhandled or unserviceable user
/// traps kill the task; kernel traps panic.
pub fn exc_dispatch(k: &Kernel, n: usize, ctx: &ExcContext) {
    let handler = k.exc.take_for_dispatch(n);
    let handled = match handler {
        Some(h) => h(k, ctx),
        None => false,
    };
    if handled {
        return;
    }
    if ctx.user {
        if let Some(idx) = ctx.task {
            task::kill(
                k,
                idx,
                FaultInfo::MemoryAccess {
                    address: Some(ctx.addr),
                    source: FaultSource::User,
                },
            );
            return;
        }
    }
    panic!("unhandled exception {} at {:#x}", n, ctx.addr);
}

/// Page-fault servicing, wired into the vector at boot.
fn pf_handler(k: &Kernel, ctx: &ExcContext) -> bool {
    let idx = match ctx.task {
        Some(idx) => idx,
        None => return false,
    };
    let space = match task::addrspace_of(k, idx) {
        Ok(s) => s,
        Err(_) => return false,
    };
    match space.page_fault(&k.frames, ctx.addr, ctx.access) {
        PfOutcome::Ok => true,
        // Defer never reaches dispatch: copies observe it synchronously.
        PfOutcome::Defer | PfOutcome::Fault => false,
    }
}

pub(crate) fn register_builtin(exc: &ExcTable) {
    exc.register(crate::arch::EXC_PF, "pf", "page fault", pf_handler);
}
