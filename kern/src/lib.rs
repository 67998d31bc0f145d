//! Microkernel IPC core.
//!
//! This crate implements the message-passing heart of the system: phones,
//! answerboxes and calls, the synchronization primitives they stand on
//! (spinlocks with IRQ discipline, wait queues, sleeping mutexes), and the
//! address-space layer that services page faults through pluggable area
//! backends. Everything else in the system is a client of this core, talking
//! to it through the syscall surface in [`syscalls`].
//!
//! # Design principles
//!
//! This implementation uses *really naive algorithms*. This is deliberate.
//! The intent is:
//!
//! 1. To use safe Rust for as much as possible.
//! 2. To use easily understood and debugged algorithms.
//! 3. To revisit these decisions if they become performance problems.
//!
//! Kernel objects live in fixed arenas sized at boot; cross-references
//! between them are indices plus generation counters, so a stale reference
//! is detected instead of dereferenced. Every queue a call can sit on is
//! owned by exactly one lock, and a call is on exactly one queue at any
//! time; `Kernel::audit_calls` can check that partition at runtime.
//!
//! The crate builds two ways, selected in [`arch`]: hosted (the kernel runs
//! as a normal process with OS threads standing in for kernel threads, which
//! is how the test suite drives it) and bare-metal, where a port supplies
//! the same architecture contract.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod arch;

pub mod console;
pub mod err;
pub mod interrupt;
pub mod ipc;
pub mod mm;
pub mod startup;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod thread;
pub mod time;
pub mod umem;

pub use crate::startup::{Kernel, KernelConfig};
