//! Tasks: the unit of isolation.
//!
//! A task is an address space, a phone table, one answerbox, and a count
//! of bound threads. Tasks live in a fixed table; a slot's generation
//! number is bumped when the task dies, so stale [`TaskId`]s held by peers
//! are detected rather than followed.
//!
//! Teardown is where most of the IPC protocol's edge cases land: a dying
//! task hangs up every phone it holds, marks every inbound phone hung up,
//! and answers everything still queued at its box with `Hangup` so blocked
//! senders learn the peer is gone.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{ErrorCode, FaultInfo, Generation, TaskId, TaskStatus, UsageError, MAX_PHONES};

use crate::err::UserError;
use crate::ipc::{self, BoxId, Phone, PhoneState};
use crate::mm::AddressSpace;
use crate::startup::Kernel;
use crate::sync::{IrqSpinlock, LockRank};
use crate::thread;

pub struct Task {
    pub(crate) inner: IrqSpinlock<TaskInner>,
    pub(crate) phones: [Phone; MAX_PHONES],
    /// Unanswered asynchronous calls in flight, bounded by
    /// `MAX_ASYNC_CALLS`.
    pub(crate) async_in_flight: AtomicUsize,
}

pub(crate) struct TaskInner {
    pub alive: bool,
    pub generation: Generation,
    pub threads: usize,
    pub answerbox: Option<BoxId>,
    pub addrspace: Option<Arc<AddressSpace>>,
    pub last_fault: Option<FaultInfo>,
}

impl Task {
    pub(crate) fn empty() -> Self {
        Task {
            inner: IrqSpinlock::new(
                "task",
                LockRank::Task,
                TaskInner {
                    alive: false,
                    generation: Generation::default(),
                    threads: 0,
                    answerbox: None,
                    addrspace: None,
                    last_fault: None,
                },
            ),
            phones: core::array::from_fn(|_| Phone::new()),
            async_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn phone_state(&self, idx: usize) -> PhoneState {
        self.phones[idx].state()
    }
}

/// Creates a task in a free slot. Its answerbox is allocated, its address
/// space is fresh, and phone 0 is wired to the naming service if one has
/// been registered.
pub fn create(k: &Kernel) -> Result<TaskId, ErrorCode> {
    let idx = {
        let mut tl = k.task_list.lock();
        tl.free.pop().ok_or(ErrorCode::Limit)?
    };
    let task = k.task(idx);
    let id = {
        let t = task.inner.lock();
        TaskId::for_index_and_gen(idx, t.generation)
    };
    let box_id = match k.boxes.alloc(id) {
        Ok(b) => b,
        Err(e) => {
            k.task_list.lock().free.push(idx);
            return Err(e);
        }
    };
    {
        let mut t = task.inner.lock();
        t.alive = true;
        t.threads = 0;
        t.answerbox = Some(box_id);
        t.addrspace = Some(AddressSpace::new());
        t.last_fault = None;
    }
    task.async_in_flight.store(0, Ordering::Relaxed);

    if let Some(ns) = k.naming_service() {
        if let Ok(p) = ipc::phone_alloc(k, idx) {
            debug_assert_eq!(p, abi::PHONE_NS);
            if ipc::phone_connect(k, id, p, ns).is_err() {
                ipc::phone_dealloc(k, id, p);
            }
        }
    }
    log::info!("task {:?} created", id);
    Ok(id)
}

/// The ID currently naming slot `idx`.
pub fn current_id(k: &Kernel, idx: usize) -> TaskId {
    let t = k.task(idx).inner.lock();
    TaskId::for_index_and_gen(idx, t.generation)
}

/// Resolves a user-provided task ID to a slot index. Out-of-range IDs are
/// a usage fault; stale ones are recoverable.
pub fn check_task_id(k: &Kernel, id: TaskId) -> Result<usize, UserError> {
    if id.index() >= k.task_count() {
        return Err(UsageError::TaskOutOfRange.into());
    }
    check_index(k, id).map_err(UserError::Recoverable)
}

/// Like [`check_task_id`] but for kernel-internal references, where a
/// stale ID just means the peer is gone.
pub(crate) fn check_index(k: &Kernel, id: TaskId) -> Result<usize, ErrorCode> {
    if id.index() >= k.task_count() {
        return Err(ErrorCode::NoEnt);
    }
    let t = k.task(id.index()).inner.lock();
    if t.alive && t.generation == id.generation() {
        Ok(id.index())
    } else {
        Err(ErrorCode::NoEnt)
    }
}

pub fn status(k: &Kernel, idx: usize) -> TaskStatus {
    let t = k.task(idx).inner.lock();
    TaskStatus {
        alive: t.alive,
        generation: t.generation,
        threads: t.threads,
        fault: t.last_fault,
    }
}

pub(crate) fn answerbox_of(k: &Kernel, idx: usize) -> Result<BoxId, ErrorCode> {
    let t = k.task(idx).inner.lock();
    t.answerbox.ok_or(ErrorCode::NoEnt)
}

pub fn addrspace_of(k: &Kernel, idx: usize) -> Result<Arc<AddressSpace>, ErrorCode> {
    let t = k.task(idx).inner.lock();
    t.addrspace.as_ref().map(Arc::clone).ok_or(ErrorCode::NoEnt)
}

/// Binds the calling thread to task `idx`.
pub fn attach_current_thread(k: &Kernel, idx: usize) -> Result<(), ErrorCode> {
    let th = thread::current();
    let mut t = k.task(idx).inner.lock();
    if !t.alive {
        return Err(ErrorCode::NoEnt);
    }
    t.threads += 1;
    th.bind(idx);
    Ok(())
}

/// Unbinds the calling thread. The task is destroyed when its last thread
/// leaves.
pub fn detach_current_thread(k: &Kernel) {
    let th = thread::current();
    let idx = match th.task() {
        Some(i) => i,
        None => return,
    };
    th.unbind();
    let last = {
        let mut t = k.task(idx).inner.lock();
        if !t.alive {
            return;
        }
        t.threads -= 1;
        t.threads == 0
    };
    if last {
        destroy(k, idx);
    }
}

/// Kills a task for a fault: records it, emits the monitor event, and
/// tears the task down.
pub fn kill(k: &Kernel, idx: usize, fault: FaultInfo) {
    let id = {
        let mut t = k.task(idx).inner.lock();
        if !t.alive {
            return;
        }
        t.last_fault = Some(fault);
        TaskId::for_index_and_gen(idx, t.generation)
    };
    log::error!("task {:?} killed: {:?}", id, fault);
    k.push_fault_event(id, fault);
    destroy(k, idx);
}

/// Tears a task down: every outbound phone is hung up (with
/// notification), every inbound phone is marked hung up, everything still
/// queued at the box is answered `Hangup`, the address space is reclaimed,
/// and the slot is recycled under a new generation.
pub fn destroy(k: &Kernel, idx: usize) {
    let (box_id, aspace, id) = {
        let mut t = k.task(idx).inner.lock();
        if !t.alive {
            return;
        }
        t.alive = false;
        let id = TaskId::for_index_and_gen(idx, t.generation);
        t.generation = t.generation.next();
        (t.answerbox.take(), t.addrspace.take(), id)
    };

    for p in 0..MAX_PHONES {
        // Free and connecting slots report Inval; that's fine here.
        let _ = ipc::hangup_phone(k, id, p, true);
    }

    if let Some(bid) = box_id {
        let abox = k.boxes.slot(bid);
        let (inbound, pending, replies) = match abox.lock_if(bid) {
            Some(mut b) => {
                b.open = false;
                let inbound = core::mem::take(&mut b.connected_phones);
                let mut pending: Vec<_> = b.incoming.drain(..).collect();
                pending.extend(b.dispatched.drain(..));
                let replies: Vec<_> = b.answers.drain(..).collect();
                (inbound, pending, replies)
            }
            None => (Vec::new(), Vec::new(), Vec::new()),
        };

        for r in inbound {
            if check_index(k, r.task).is_err() {
                continue;
            }
            let holder = k.task(r.task.index());
            let mut p = holder.phones[r.phone].inner.lock();
            if p.state == PhoneState::Connected(bid) {
                p.state = PhoneState::Hungup;
            }
        }

        for c in pending {
            ipc::sysipc::cleanup_stash_on_refusal(k, c);
            k.calls
                .with(c, |cd| cd.msg.set_retval(ErrorCode::Hangup.as_retval()));
            ipc::route_loose_answer(k, c);
        }
        for c in replies {
            k.calls.free(c);
        }
        k.boxes.free(&k.calls, bid);
    }

    if let Some(aspace) = aspace {
        aspace.destroy_all(&k.frames);
    }

    k.task_list.lock().free.push(idx);
    log::info!("task {:?} destroyed", id);
}
