//! IPC objects and mechanics: calls, phones, answerboxes.
//!
//! Lock ordering: first the answerbox, then the phone. The two answerboxes
//! touched by an answer are taken in address order. Call-slot locks nest
//! below box and phone locks; wait-queue wakeups happen after the box lock
//! is released where possible.
//!
//! This module owns the objects and the list mechanics: allocation,
//! enqueueing, the atomic moves between queues. The protocol built on top
//! (system methods, the syscall semantics) lives in [`sysipc`].

pub mod sysipc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use abi::{CallFlags, CallId, ErrorCode, RawMessage, SysMethod, TaskId, WaitFlags};

use crate::startup::Kernel;
use crate::sync::{IrqGuard, IrqSpinlock, LockRank, SleepFlags, SleepOutcome, Spinlock, WaitQueue, WakeupPolicy};

/// Names a particular incarnation of an answerbox slot. Kernel-internal;
/// never crosses the syscall boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BoxId(u32);

impl BoxId {
    const INDEX_BITS: u32 = 16;
    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    fn for_index_and_gen(index: usize, gen: u16) -> Self {
        BoxId((index as u32 & Self::INDEX_MASK) | ((gen as u32) << Self::INDEX_BITS))
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    pub(crate) fn generation(self) -> u16 {
        (self.0 >> Self::INDEX_BITS) as u16
    }
}

/// An inbound edge recorded in an answerbox: which task's phone table, and
/// which slot in it, points here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhoneRef {
    pub task: TaskId,
    pub phone: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhoneState {
    Free,
    /// Allocated, destination not settled yet.
    Connecting,
    Connected(BoxId),
    /// Torn down from the far side; the holder frees the slot.
    Hungup,
}

pub struct Phone {
    pub(crate) inner: IrqSpinlock<PhoneInner>,
}

pub(crate) struct PhoneInner {
    pub state: PhoneState,
}

impl Phone {
    pub(crate) fn new() -> Self {
        Phone {
            inner: IrqSpinlock::new(
                "phone",
                LockRank::Phone,
                PhoneInner {
                    state: PhoneState::Free,
                },
            ),
        }
    }

    pub fn state(&self) -> PhoneState {
        self.inner.lock().state
    }
}

/// The rendezvous object messages land in: one per task, plus transient
/// private ones backing synchronous calls.
pub struct Answerbox {
    pub(crate) inner: IrqSpinlock<BoxInner>,
    pub(crate) wq: WaitQueue,
}

pub(crate) struct BoxInner {
    pub gen: u16,
    pub active: bool,
    /// Accepting new calls. Cleared during teardown.
    pub open: bool,
    pub owner: TaskId,
    pub incoming: VecDeque<CallId>,
    pub dispatched: Vec<CallId>,
    pub answers: VecDeque<CallId>,
    pub connected_phones: Vec<PhoneRef>,
}

impl Answerbox {
    fn empty() -> Self {
        Answerbox {
            inner: IrqSpinlock::new(
                "answerbox",
                LockRank::Answerbox,
                BoxInner {
                    gen: 0,
                    active: false,
                    open: false,
                    owner: TaskId(0),
                    incoming: VecDeque::new(),
                    dispatched: Vec::new(),
                    answers: VecDeque::new(),
                    connected_phones: Vec::new(),
                },
            ),
            wq: WaitQueue::new("answerbox_wq"),
        }
    }

    /// Locks the box and verifies `id` still names this incarnation.
    pub(crate) fn lock_if(&self, id: BoxId) -> Option<IrqGuard<'_, BoxInner>> {
        let g = self.inner.lock();
        if g.active && g.gen == id.generation() {
            Some(g)
        } else {
            None
        }
    }
}

pub struct BoxTable {
    slots: Box<[Answerbox]>,
    free: Spinlock<Vec<usize>>,
}

impl BoxTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Answerbox::empty());
        }
        let free = (0..capacity).rev().collect();
        BoxTable {
            slots: slots.into_boxed_slice(),
            free: Spinlock::new("box_free", LockRank::CallSlab, free),
        }
    }

    pub(crate) fn slot(&self, id: BoxId) -> &Answerbox {
        &self.slots[id.index()]
    }

    pub(crate) fn slot_by_index(&self, idx: usize) -> &Answerbox {
        &self.slots[idx]
    }

    pub(crate) fn alloc(&self, owner: TaskId) -> Result<BoxId, ErrorCode> {
        let idx = self.free.lock().pop().ok_or(ErrorCode::NoMem)?;
        let abox = &self.slots[idx];
        let mut b = abox.inner.lock();
        debug_assert!(!b.active, "free list handed out a live answerbox");
        b.active = true;
        b.open = true;
        b.owner = owner;
        Ok(BoxId::for_index_and_gen(idx, b.gen))
    }

    /// Retires a box. Any calls still queued here are freed; blocked
    /// receivers are flushed and will observe the stale generation.
    pub(crate) fn free(&self, calls: &CallSlab, id: BoxId) {
        let abox = self.slot(id);
        let leftovers = {
            let mut b = match abox.lock_if(id) {
                Some(b) => b,
                None => return,
            };
            b.active = false;
            b.open = false;
            b.gen = b.gen.wrapping_add(1);
            let mut left: Vec<CallId> = Vec::new();
            left.extend(b.incoming.drain(..));
            left.extend(b.dispatched.drain(..));
            left.extend(b.answers.drain(..));
            b.connected_phones.clear();
            left
        };
        for c in leftovers {
            calls.free(c);
        }
        abox.wq.wakeup(WakeupPolicy::All);
        self.free.lock().push(id.index());
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Per-system-method state the kernel carries inside a call between the
/// request and answer phases of a handshake.
#[derive(Clone, Debug)]
pub(crate) enum SysStash {
    None,
    /// A phone allocated (or named) during the request, to be connected or
    /// torn down depending on the answer.
    NewPhone(PhoneRef),
    /// Source of an area transfer, resolved at send time.
    SrcArea { task: TaskId, base: usize },
    /// Destination buffer in the caller's address space for data flowing
    /// back with the answer.
    DstBuf { va: usize, len: usize },
    /// Answerbox of the third party in a connection-authorization
    /// handshake.
    ThirdParty(BoxId),
}

pub(crate) struct CallData {
    gen: u16,
    busy: bool,
    pub flags: CallFlags,
    pub msg: RawMessage,
    /// Method word of the original request; survives the reply overwriting
    /// `msg` and any forward rewriting the live method.
    pub req_method: usize,
    pub sender: TaskId,
    pub caller_box: Option<BoxId>,
    pub phone: Option<PhoneRef>,
    /// Kernel staging buffer for the bulk-transfer methods.
    pub buffer: Option<Vec<u8>>,
    pub stash: SysStash,
}

pub struct CallSlot {
    data: Spinlock<CallData>,
}

/// Fixed arena of call records, the slab the sender allocates from.
pub struct CallSlab {
    slots: Box<[CallSlot]>,
    free: Spinlock<Vec<usize>>,
}

impl CallSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(CallSlot {
                data: Spinlock::new(
                    "call",
                    LockRank::CallSlab,
                    CallData {
                        gen: 0,
                        busy: false,
                        flags: CallFlags::empty(),
                        msg: RawMessage::default(),
                        req_method: 0,
                        sender: TaskId(0),
                        caller_box: None,
                        phone: None,
                        buffer: None,
                        stash: SysStash::None,
                    },
                ),
            });
        }
        let free = (0..capacity).rev().collect();
        CallSlab {
            slots: slots.into_boxed_slice(),
            free: Spinlock::new("call_free", LockRank::CallSlab, free),
        }
    }

    pub(crate) fn alloc(
        &self,
        sender: TaskId,
        caller_box: Option<BoxId>,
        phone: Option<PhoneRef>,
        flags: CallFlags,
        msg: RawMessage,
    ) -> Result<CallId, ErrorCode> {
        let idx = self.free.lock().pop().ok_or(ErrorCode::NoMem)?;
        let mut d = self.slots[idx].data.lock();
        debug_assert!(!d.busy, "free list handed out a live call");
        d.busy = true;
        d.flags = flags;
        d.msg = msg;
        d.req_method = msg.method;
        d.sender = sender;
        d.caller_box = caller_box;
        d.phone = phone;
        d.buffer = None;
        d.stash = SysStash::None;
        Ok(CallId::for_index_and_gen(idx, d.gen))
    }

    /// Runs `f` on the call record named by `id`, or returns `None` if the
    /// id is stale.
    pub(crate) fn with<R>(&self, id: CallId, f: impl FnOnce(&mut CallData) -> R) -> Option<R> {
        let slot = self.slots.get(id.index())?;
        let mut d = slot.data.lock();
        if d.busy && d.gen == id.generation() {
            Some(f(&mut d))
        } else {
            None
        }
    }

    pub(crate) fn free(&self, id: CallId) {
        {
            let slot = match self.slots.get(id.index()) {
                Some(s) => s,
                None => return,
            };
            let mut d = slot.data.lock();
            if !d.busy || d.gen != id.generation() {
                return;
            }
            if d.flags.contains(CallFlags::STATIC_ALLOC) {
                // Storage owned elsewhere; just detach the payload.
                d.buffer = None;
                d.stash = SysStash::None;
                return;
            }
            d.busy = false;
            d.gen = d.gen.wrapping_add(1);
            d.buffer = None;
            d.stash = SysStash::None;
        }
        self.free.lock().push(id.index());
    }

    /// Number of live call records.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.data.lock().busy)
            .count()
    }
}

/// What a receive produced.
#[derive(Copy, Clone, Debug)]
pub struct Received {
    pub id: CallId,
    pub msg: RawMessage,
    /// Reply (`true`) or request (`false`).
    pub answered: bool,
    pub sender: TaskId,
}

#[derive(Copy, Clone, Debug)]
pub enum WaitOutcome {
    Call(Received),
    WouldBlock,
    TimedOut,
    Interrupted,
}

/// Allocates a call record addressed back to `caller_box`.
pub(crate) fn call_alloc(
    k: &Kernel,
    sender: TaskId,
    caller_box: Option<BoxId>,
    phone: Option<PhoneRef>,
    flags: CallFlags,
    msg: RawMessage,
) -> Result<CallId, ErrorCode> {
    k.calls.alloc(sender, caller_box, phone, flags, msg)
}

/// Appends `call` to the incoming queue of `target` and wakes one
/// receiver. Calls sent through one phone arrive in send order because the
/// enqueue happens before the send returns.
pub(crate) fn send_call(k: &Kernel, target: BoxId, call: CallId) -> Result<(), ErrorCode> {
    let abox = k.boxes.slot(target);
    {
        let mut b = abox.lock_if(target).ok_or(ErrorCode::Hangup)?;
        if !b.open {
            return Err(ErrorCode::Hangup);
        }
        b.incoming.push_back(call);
    }
    abox.wq.wakeup(WakeupPolicy::First);
    Ok(())
}

pub(crate) fn remove_dispatched(b: &mut BoxInner, call: CallId) -> Result<(), ErrorCode> {
    match b.dispatched.iter().position(|&c| c == call) {
        Some(pos) => {
            b.dispatched.remove(pos);
            Ok(())
        }
        // Lost a race with another answer or with teardown.
        None => Err(ErrorCode::Inval),
    }
}

/// Moves an answered call from `from`'s dispatched set to its caller's
/// answers queue (or frees it, if nobody is listening), waking the caller.
/// The reply payload must already be stored in the call.
pub(crate) fn route_answer(k: &Kernel, from: BoxId, call: CallId) -> Result<(), ErrorCode> {
    let (caller_box, discard) = k
        .calls
        .with(call, |c| {
            (c.caller_box, c.flags.contains(CallFlags::DISCARD_ANSWER))
        })
        .ok_or(ErrorCode::Inval)?;

    let from_box = k.boxes.slot(from);
    let dest = if discard { None } else { caller_box };

    match dest {
        None => {
            {
                let mut fb = from_box.lock_if(from).ok_or(ErrorCode::NoEnt)?;
                remove_dispatched(&mut fb, call)?;
                k.calls.with(call, |c| c.flags.insert(CallFlags::ANSWERED));
            }
            k.calls.free(call);
            Ok(())
        }
        Some(to) if to == from => {
            {
                let mut fb = from_box.lock_if(from).ok_or(ErrorCode::NoEnt)?;
                remove_dispatched(&mut fb, call)?;
                k.calls.with(call, |c| c.flags.insert(CallFlags::ANSWERED));
                fb.answers.push_back(call);
            }
            from_box.wq.wakeup(WakeupPolicy::First);
            Ok(())
        }
        Some(to) => {
            let to_box = k.boxes.slot(to);
            let from_first =
                (from_box as *const Answerbox) < (to_box as *const Answerbox);
            let (fg, tg) = if from_first {
                let f = from_box.lock_if(from);
                let t = to_box.lock_if(to);
                (f, t)
            } else {
                let t = to_box.lock_if(to);
                let f = from_box.lock_if(from);
                (f, t)
            };
            let mut fb = fg.ok_or(ErrorCode::NoEnt)?;
            remove_dispatched(&mut fb, call)?;
            k.calls.with(call, |c| c.flags.insert(CallFlags::ANSWERED));
            match tg {
                Some(mut tb) if tb.open => {
                    tb.answers.push_back(call);
                    drop(tb);
                    drop(fb);
                    to_box.wq.wakeup(WakeupPolicy::First);
                }
                _ => {
                    // The caller is gone; a late reply is dropped
                    // silently.
                    drop(fb);
                    k.calls.free(call);
                }
            }
            Ok(())
        }
    }
}

/// Routes a call that is currently on no list to its caller's answers
/// queue as a reply, or frees it if nobody is listening. Used when a box
/// is being flushed and the dispatched entry has already been drained.
pub(crate) fn route_loose_answer(k: &Kernel, call: CallId) {
    let dest = k.calls.with(call, |c| {
        c.flags.insert(CallFlags::ANSWERED);
        if c.flags.contains(CallFlags::DISCARD_ANSWER) {
            None
        } else {
            c.caller_box
        }
    });
    match dest {
        Some(Some(to)) => {
            let tb = k.boxes.slot(to);
            let delivered = match tb.lock_if(to) {
                Some(mut g) => {
                    if g.open {
                        g.answers.push_back(call);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if delivered {
                tb.wq.wakeup(WakeupPolicy::First);
            } else {
                k.calls.free(call);
            }
        }
        _ => k.calls.free(call),
    }
}

/// Pops one call from `box_id`, replies first. A popped request moves to
/// the dispatched set, transferring the obligation to answer to the
/// receiver.
pub(crate) fn wait_one(
    k: &Kernel,
    box_id: BoxId,
    flags: WaitFlags,
    timeout: Option<u64>,
) -> Result<WaitOutcome, ErrorCode> {
    let abox = k.boxes.slot(box_id);
    let mut sflags = SleepFlags::empty();
    if flags.contains(WaitFlags::NON_BLOCKING) {
        sflags |= SleepFlags::NON_BLOCKING;
    }
    if flags.contains(WaitFlags::INTERRUPTIBLE) {
        sflags |= SleepFlags::INTERRUPTIBLE;
    }
    loop {
        match abox.wq.sleep(timeout, sflags) {
            SleepOutcome::Ok => {}
            SleepOutcome::WouldBlock => return Ok(WaitOutcome::WouldBlock),
            SleepOutcome::TimedOut => return Ok(WaitOutcome::TimedOut),
            SleepOutcome::Interrupted => return Ok(WaitOutcome::Interrupted),
        }
        let popped = {
            let mut b = abox.lock_if(box_id).ok_or(ErrorCode::NoEnt)?;
            if let Some(id) = b.answers.pop_front() {
                Some((id, true))
            } else if let Some(id) = b.incoming.pop_front() {
                b.dispatched.push(id);
                Some((id, false))
            } else {
                // Consumed a token that raced with another receiver.
                None
            }
        };
        if let Some((id, answered)) = popped {
            let (msg, sender) = k
                .calls
                .with(id, |c| (c.msg, c.sender))
                .ok_or(ErrorCode::NoEnt)?;
            return Ok(WaitOutcome::Call(Received {
                id,
                msg,
                answered,
                sender,
            }));
        }
    }
}

/// Reserves a phone slot in `task_idx`'s table. The scan runs under the
/// task lock so concurrent allocations cannot double-book a slot.
pub(crate) fn phone_alloc(k: &Kernel, task_idx: usize) -> Result<usize, ErrorCode> {
    let task = k.task(task_idx);
    let t = task.inner.lock();
    if !t.alive {
        return Err(ErrorCode::NoEnt);
    }
    for i in 0..abi::MAX_PHONES {
        let mut p = task.phones[i].inner.lock();
        if p.state == PhoneState::Free {
            p.state = PhoneState::Connecting;
            return Ok(i);
        }
    }
    Err(ErrorCode::Limit)
}

/// Connects an allocated phone to `target`, registering the inbound edge
/// in the box so teardown can find it.
pub(crate) fn phone_connect(
    k: &Kernel,
    holder: TaskId,
    phone_idx: usize,
    target: BoxId,
) -> Result<(), ErrorCode> {
    let tbox = k.boxes.slot(target);
    let mut b = tbox.lock_if(target).ok_or(ErrorCode::Hangup)?;
    if !b.open {
        return Err(ErrorCode::Hangup);
    }
    b.connected_phones.push(PhoneRef {
        task: holder,
        phone: phone_idx,
    });
    let task = k.task(holder.index());
    let mut p = task.phones[phone_idx].inner.lock();
    p.state = PhoneState::Connected(target);
    Ok(())
}

/// Returns a phone slot to `Free`, deregistering it from its box if it got
/// as far as `Connected`.
pub(crate) fn phone_dealloc(k: &Kernel, holder: TaskId, phone_idx: usize) {
    let task = k.task(holder.index());
    let state = task.phones[phone_idx].inner.lock().state;
    if let PhoneState::Connected(b) = state {
        if let Some(mut bg) = k.boxes.slot(b).lock_if(b) {
            bg.connected_phones
                .retain(|r| !(r.task == holder && r.phone == phone_idx));
        }
    }
    task.phones[phone_idx].inner.lock().state = PhoneState::Free;
}

/// Hangs up a phone held by `holder`. When `notify` is set and the far box
/// is still listening, a method-zero call is synthesized so the callee
/// observes the teardown.
pub(crate) fn hangup_phone(
    k: &Kernel,
    holder: TaskId,
    phone_idx: usize,
    notify: bool,
) -> Result<(), ErrorCode> {
    let task = k.task(holder.index());
    let phone = &task.phones[phone_idx];
    let target = {
        let mut p = phone.inner.lock();
        match p.state {
            PhoneState::Connected(b) => {
                p.state = PhoneState::Hungup;
                Some(b)
            }
            // Far side already tore the connection down; just reap the
            // slot.
            PhoneState::Hungup => None,
            PhoneState::Free | PhoneState::Connecting => return Err(ErrorCode::Inval),
        }
    };
    if let Some(b) = target {
        let notify_open = {
            match k.boxes.slot(b).lock_if(b) {
                Some(mut bg) => {
                    bg.connected_phones
                        .retain(|r| !(r.task == holder && r.phone == phone_idx));
                    bg.open
                }
                None => false,
            }
        };
        if notify && notify_open {
            let msg = RawMessage::new(SysMethod::PhoneHungup as usize, [0; 5]);
            if let Ok(call) = call_alloc(
                k,
                holder,
                None,
                None,
                CallFlags::DISCARD_ANSWER,
                msg,
            ) {
                if send_call(k, b, call).is_err() {
                    k.calls.free(call);
                }
            }
        }
    }
    phone.inner.lock().state = PhoneState::Free;
    Ok(())
}
