//! IPC syscall semantics and the system-method protocol.
//!
//! The object mechanics live in the parent module; this one implements
//! what the methods *mean*. System methods get kernel processing at up to
//! four points in a call's life:
//!
//! - request preprocessing, in the caller's context, before the call is
//!   enqueued (allocate handshake phones, stage outgoing data);
//! - request processing, in the receiver's context, as the call is handed
//!   to userspace (allocate the reverse phone of a callback connection);
//! - answer preprocessing, in the answerer's context, before the reply is
//!   routed (connect or tear down handshake phones, move bulk data,
//!   perform area shares);
//! - answer processing, in the original caller's context, as the reply is
//!   picked up (land bulk data in the caller's memory, reveal the new
//!   phone descriptor).

use core::convert::TryFrom;

use abi::{
    AreaFlags, CallFlags, CallId, DebugOp, ErrorCode, FaultInfo, PhoneHash, RawMessage,
    SysMethod, TaskStatus, UsageError, WaitFlags, DATA_XFER_LIMIT, LAST_SYSTEM_METHOD,
    MAX_ASYNC_CALLS, MAX_PHONES, METHOD_PING,
};

use crate::err::UserError;
use crate::mm;
use crate::startup::Kernel;
use crate::sync::WakeupPolicy;
use crate::task;
use crate::umem;

use super::{
    call_alloc, hangup_phone, phone_alloc, phone_connect, phone_dealloc, route_answer,
    route_loose_answer, send_call, wait_one, BoxId, PhoneRef, PhoneState, SysStash, WaitOutcome,
};

use core::sync::atomic::Ordering;

/// Failure modes of the asynchronous send.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AsyncSendError {
    /// The send can never succeed; the caller's callback should fire with
    /// the carried code.
    Fatal(ErrorCode),
    /// The caller's async window is full; queue locally and retry after
    /// draining replies.
    Temporary,
}

/// Resolves a phone descriptor of `caller` to the box it points at.
fn phone_target(k: &Kernel, caller: usize, phone: usize) -> Result<BoxId, ErrorCode> {
    if phone >= MAX_PHONES {
        return Err(ErrorCode::NoEnt);
    }
    match k.task(caller).phones[phone].state() {
        PhoneState::Connected(b) => Ok(b),
        PhoneState::Hungup => Err(ErrorCode::Hangup),
        PhoneState::Free | PhoneState::Connecting => Err(ErrorCode::NoEnt),
    }
}

/// Sends an asynchronous call on `phone`. The returned ID keys the
/// caller's async table; the reply arrives at the task answerbox.
pub fn sys_ipc_call_async(
    k: &Kernel,
    caller: usize,
    phone: usize,
    msg: RawMessage,
) -> Result<CallId, AsyncSendError> {
    let target = phone_target(k, caller, phone).map_err(AsyncSendError::Fatal)?;
    let caller_id = task::current_id(k, caller);
    let task = k.task(caller);

    let prev = task.async_in_flight.fetch_add(1, Ordering::AcqRel);
    if prev >= MAX_ASYNC_CALLS {
        task.async_in_flight.fetch_sub(1, Ordering::AcqRel);
        return Err(AsyncSendError::Temporary);
    }
    let undo = |e: ErrorCode| {
        task.async_in_flight.fetch_sub(1, Ordering::AcqRel);
        AsyncSendError::Fatal(e)
    };

    let my_box = match task::answerbox_of(k, caller) {
        Ok(b) => b,
        Err(e) => return Err(undo(e)),
    };
    let call = match call_alloc(
        k,
        caller_id,
        Some(my_box),
        Some(PhoneRef {
            task: caller_id,
            phone,
        }),
        CallFlags::empty(),
        msg,
    ) {
        Ok(c) => c,
        Err(e) => return Err(undo(e)),
    };
    if let Err(e) = send_request(k, caller, target, call) {
        k.calls.free(call);
        return Err(undo(e));
    }
    Ok(call)
}

/// Sends a call and blocks for its reply on a private answerbox. Errors
/// from the peer surface in the reply slot of the returned message.
pub fn sys_ipc_call_sync(
    k: &Kernel,
    caller: usize,
    phone: usize,
    msg: RawMessage,
) -> Result<RawMessage, UserError> {
    let target = phone_target(k, caller, phone).map_err(UserError::Recoverable)?;
    let caller_id = task::current_id(k, caller);

    let sync_box = k.boxes.alloc(caller_id).map_err(UserError::Recoverable)?;
    let call = match call_alloc(
        k,
        caller_id,
        Some(sync_box),
        Some(PhoneRef {
            task: caller_id,
            phone,
        }),
        CallFlags::empty(),
        msg,
    ) {
        Ok(c) => c,
        Err(e) => {
            k.boxes.free(&k.calls, sync_box);
            return Err(e.into());
        }
    };
    if let Err(e) = send_request(k, caller, target, call) {
        k.calls.free(call);
        k.boxes.free(&k.calls, sync_box);
        return Err(e.into());
    }

    loop {
        match wait_one(k, sync_box, WaitFlags::INTERRUPTIBLE, None) {
            Ok(WaitOutcome::Call(mut r)) => {
                debug_assert!(r.answered, "request arrived at a private sync box");
                let _ = process_answer(k, caller, r.id, &mut r.msg);
                k.calls.free(r.id);
                k.boxes.free(&k.calls, sync_box);
                return Ok(r.msg);
            }
            Ok(WaitOutcome::Interrupted) => {
                // The reply, whenever it comes, will find a stale box and
                // be dropped.
                k.boxes.free(&k.calls, sync_box);
                return Err(ErrorCode::Intr.into());
            }
            Ok(WaitOutcome::WouldBlock) | Ok(WaitOutcome::TimedOut) => continue,
            Err(e) => {
                k.boxes.free(&k.calls, sync_box);
                return Err(e.into());
            }
        }
    }
}

/// Transmits the reply for a call this task holds dispatched. Answering a
/// call the task does not hold is a protocol violation.
pub fn sys_ipc_answer(
    k: &Kernel,
    caller: usize,
    call_id: CallId,
    msg: RawMessage,
) -> Result<(), UserError> {
    let my_box = task::answerbox_of(k, caller).map_err(UserError::Recoverable)?;

    if k.calls.with(call_id, |_| ()).is_none() {
        // Already answered and recycled, or never existed.
        return Err(ErrorCode::Inval.into());
    }
    let held = {
        let abox = k.boxes.slot(my_box);
        match abox.lock_if(my_box) {
            Some(b) => b.dispatched.contains(&call_id),
            None => false,
        }
    };
    if !held {
        return Err(UserError::Unrecoverable(FaultInfo::BadReply));
    }

    let mut answer = msg;
    answer_preprocess(k, caller, call_id, &mut answer).map_err(UserError::Recoverable)?;
    k.calls
        .with(call_id, |c| c.msg = answer)
        .ok_or(UserError::Recoverable(ErrorCode::Inval))?;
    route_answer(k, my_box, call_id).map_err(UserError::Recoverable)
}

/// Passes the obligation to answer a dispatched call on to another task.
/// The original sender and arguments travel with it; user calls may have
/// their method rewritten.
pub fn sys_ipc_forward(
    k: &Kernel,
    caller: usize,
    call_id: CallId,
    new_phone: usize,
    new_method: usize,
) -> Result<(), UserError> {
    let my_box = task::answerbox_of(k, caller).map_err(UserError::Recoverable)?;

    let answered = match k.calls.with(call_id, |c| c.flags.contains(CallFlags::ANSWERED)) {
        Some(a) => a,
        None => return Err(ErrorCode::Inval.into()),
    };
    if answered {
        return Err(ErrorCode::Inval.into());
    }
    let held = {
        let abox = k.boxes.slot(my_box);
        match abox.lock_if(my_box) {
            Some(b) => b.dispatched.contains(&call_id),
            None => false,
        }
    };
    if !held {
        return Err(UserError::Unrecoverable(FaultInfo::BadReply));
    }

    let target = phone_target(k, caller, new_phone).map_err(UserError::Recoverable)?;

    let from_box = k.boxes.slot(my_box);
    let to_box = k.boxes.slot(target);

    let rewrite = |c: &mut super::CallData| {
        if c.req_method > LAST_SYSTEM_METHOD {
            c.msg.method = new_method;
        }
        c.flags.insert(CallFlags::FORWARDED);
    };
    // A user call must not be disguised as a system method.
    let user_call = k
        .calls
        .with(call_id, |c| c.req_method > LAST_SYSTEM_METHOD)
        .unwrap_or(false);
    if user_call && new_method <= LAST_SYSTEM_METHOD {
        return Err(ErrorCode::Inval.into());
    }

    if my_box == target {
        let mut fb = from_box
            .lock_if(my_box)
            .ok_or(UserError::Recoverable(ErrorCode::NoEnt))?;
        super::remove_dispatched(&mut fb, call_id).map_err(UserError::Recoverable)?;
        k.calls.with(call_id, rewrite);
        fb.incoming.push_back(call_id);
        drop(fb);
        from_box.wq.wakeup(WakeupPolicy::First);
        return Ok(());
    }

    let from_first = (from_box as *const super::Answerbox) < (to_box as *const super::Answerbox);
    let (fg, tg) = if from_first {
        let f = from_box.lock_if(my_box);
        let t = to_box.lock_if(target);
        (f, t)
    } else {
        let t = to_box.lock_if(target);
        let f = from_box.lock_if(my_box);
        (f, t)
    };
    let mut fb = fg.ok_or(UserError::Recoverable(ErrorCode::NoEnt))?;
    let mut tb = match tg {
        Some(t) if t.open => t,
        // Callee died under us; leave the call dispatched so the caller
        // can still answer it.
        _ => return Err(ErrorCode::Hangup.into()),
    };
    super::remove_dispatched(&mut fb, call_id).map_err(UserError::Recoverable)?;
    k.calls.with(call_id, rewrite);
    tb.incoming.push_back(call_id);
    drop(tb);
    drop(fb);
    to_box.wq.wakeup(WakeupPolicy::First);
    Ok(())
}

/// Receives from the task answerbox: replies first, then requests. Kernel
/// processing runs as calls are handed over; requests the kernel must
/// refuse (for example a callback connection that cannot get a phone) are
/// answered on the task's behalf and never surface.
pub fn sys_ipc_wait(
    k: &Kernel,
    caller: usize,
    flags: WaitFlags,
    timeout: Option<u64>,
) -> Result<WaitOutcome, UserError> {
    let my_box = task::answerbox_of(k, caller).map_err(UserError::Recoverable)?;
    loop {
        match wait_one(k, my_box, flags, timeout).map_err(UserError::Recoverable)? {
            WaitOutcome::Call(mut r) => {
                if r.answered {
                    let _ = process_answer(k, caller, r.id, &mut r.msg);
                    let _ = k.task(caller).async_in_flight.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                        |v| v.checked_sub(1),
                    );
                    k.calls.free(r.id);
                    return Ok(WaitOutcome::Call(r));
                }
                match request_process(k, caller, r.id) {
                    Ok(msg) => {
                        r.msg = msg;
                        return Ok(WaitOutcome::Call(r));
                    }
                    Err(code) => {
                        k.calls
                            .with(r.id, |c| c.msg.set_retval(code.as_retval()));
                        let _ = route_answer(k, my_box, r.id);
                        continue;
                    }
                }
            }
            other => return Ok(other),
        }
    }
}

/// Hangs up a phone. The callee observes a synthesized method-zero call.
pub fn sys_ipc_hangup(k: &Kernel, caller: usize, phone: usize) -> Result<(), UserError> {
    if phone >= MAX_PHONES {
        return Err(UsageError::PhoneOutOfRange.into());
    }
    let caller_id = task::current_id(k, caller);
    hangup_phone(k, caller_id, phone, true).map_err(UserError::Recoverable)
}

/// Common send tail: kernel fast paths, request preprocessing, enqueue.
fn send_request(k: &Kernel, caller: usize, target: BoxId, call: CallId) -> Result<(), ErrorCode> {
    let method = k
        .calls
        .with(call, |c| c.msg.method)
        .ok_or(ErrorCode::Inval)?;

    if method == METHOD_PING {
        // Liveness probe: answered by the kernel, argument words echoed.
        k.calls.with(call, |c| c.msg.set_retval(abi::EOK));
        route_loose_answer(k, call);
        return Ok(());
    }
    if method == SysMethod::Debug as usize {
        return debug_request(k, target, call);
    }

    request_preprocess(k, caller, target, call)?;
    if let Err(e) = send_call(k, target, call) {
        cleanup_stash_on_refusal(k, call);
        return Err(e);
    }
    Ok(())
}

/// Marshals a kernel record into a call's staging buffer the same way any
/// other bulk payload travels.
fn serialize_response<T: serde::Serialize>(buf: &mut [u8], val: &T) -> Result<usize, ErrorCode> {
    ssmarshal::serialize(buf, val).map_err(|_| ErrorCode::Inval)
}

/// Debugger operations are serviced by the kernel against the target box's
/// owner and fast-answered.
fn debug_request(k: &Kernel, target: BoxId, call: CallId) -> Result<(), ErrorCode> {
    let msg = k.calls.with(call, |c| c.msg).ok_or(ErrorCode::Inval)?;
    let op = DebugOp::try_from(msg.arg(1)).map_err(|_| ErrorCode::Inval)?;
    match op {
        DebugOp::TaskState => {
            let owner = {
                let abox = k.boxes.slot(target);
                abox.lock_if(target).ok_or(ErrorCode::Hangup)?.owner
            };
            let idx = task::check_index(k, owner)?;
            let status: TaskStatus = task::status(k, idx);
            let mut buf = [0u8; 64];
            let len = serialize_response(&mut buf, &status)?;
            k.calls.with(call, |c| {
                c.buffer = Some(buf[..len].to_vec());
                c.stash = SysStash::DstBuf {
                    va: msg.arg(2),
                    len: msg.arg(3),
                };
                c.msg.set_retval(abi::EOK);
                c.msg.set_arg(3, len);
            });
            route_loose_answer(k, call);
            Ok(())
        }
    }
}

/// System-method work done in the caller's context before the call leaves.
fn request_preprocess(
    k: &Kernel,
    caller: usize,
    target: BoxId,
    call: CallId,
) -> Result<(), ErrorCode> {
    let msg = k.calls.with(call, |c| c.msg).ok_or(ErrorCode::Inval)?;
    let caller_id = task::current_id(k, caller);

    let m = match SysMethod::try_from(msg.method) {
        Ok(m) => m,
        Err(()) => return Ok(()),
    };
    match m {
        SysMethod::PhoneHungup | SysMethod::ConnectToMe | SysMethod::ShareIn => Ok(()),
        SysMethod::Debug => Ok(()),
        SysMethod::ConnectionClone => {
            let cloned_target = phone_target(k, caller, msg.arg(1))?;
            let callee = {
                let abox = k.boxes.slot(target);
                abox.lock_if(target).ok_or(ErrorCode::Hangup)?.owner
            };
            let callee_idx = task::check_index(k, callee)?;
            let new = phone_alloc(k, callee_idx)?;
            if let Err(e) = phone_connect(k, callee, new, cloned_target) {
                phone_dealloc(k, callee, new);
                return Err(e);
            }
            k.calls.with(call, |c| {
                c.msg.set_arg(1, new);
                c.stash = SysStash::NewPhone(PhoneRef {
                    task: callee,
                    phone: new,
                });
            });
            Ok(())
        }
        SysMethod::CloneEstablish => {
            if let Some(Some(p)) = k.calls.with(call, |c| c.phone) {
                k.calls.with(call, |c| {
                    c.msg.set_arg(5, PhoneHash::compose(p.task, p.phone).0)
                });
            }
            Ok(())
        }
        SysMethod::ConnectMeTo => {
            let new = phone_alloc(k, caller)?;
            let r = PhoneRef {
                task: caller_id,
                phone: new,
            };
            k.calls.with(call, |c| {
                c.stash = SysStash::NewPhone(r);
                c.msg.set_arg(5, PhoneHash::compose(r.task, r.phone).0);
            });
            Ok(())
        }
        SysMethod::ShareOut => {
            let space = task::addrspace_of(k, caller)?;
            let size = space.area_size(msg.arg(1)).ok_or(ErrorCode::NoEnt)?;
            k.calls.with(call, |c| {
                c.msg.set_arg(2, size);
                c.stash = SysStash::SrcArea {
                    task: caller_id,
                    base: msg.arg(1),
                };
            });
            Ok(())
        }
        SysMethod::DataWrite => {
            let len = msg.arg(2);
            if len > DATA_XFER_LIMIT {
                return Err(ErrorCode::Limit);
            }
            let mut buf = alloc::vec![0u8; len];
            let space = task::addrspace_of(k, caller)?;
            umem::copy_from_uspace(&k.frames, &space, msg.arg(1), &mut buf)?;
            k.calls.with(call, |c| c.buffer = Some(buf));
            Ok(())
        }
        SysMethod::DataRead => {
            let len = msg.arg(2);
            if len > DATA_XFER_LIMIT {
                return Err(ErrorCode::Limit);
            }
            k.calls.with(call, |c| {
                c.stash = SysStash::DstBuf {
                    va: msg.arg(1),
                    len,
                };
            });
            Ok(())
        }
        SysMethod::StateChangeAuthorize => {
            let third = phone_target(k, caller, msg.arg(5))?;
            k.calls.with(call, |c| {
                c.stash = SysStash::ThirdParty(third);
                c.msg
                    .set_arg(5, PhoneHash::compose(caller_id, msg.arg(5)).0);
            });
            Ok(())
        }
    }
}

/// System-method work done in the receiver's context as a request is
/// handed to userspace. An error here makes the kernel refuse the call on
/// the receiver's behalf.
fn request_process(k: &Kernel, receiver: usize, call: CallId) -> Result<RawMessage, ErrorCode> {
    let (msg, sender) = k
        .calls
        .with(call, |c| (c.msg, c.sender))
        .ok_or(ErrorCode::Inval)?;
    match SysMethod::try_from(msg.method) {
        Ok(SysMethod::ConnectToMe) => {
            let receiver_id = task::current_id(k, receiver);
            let sender_idx = task::check_index(k, sender)?;
            let sender_box = task::answerbox_of(k, sender_idx)?;
            let new = phone_alloc(k, receiver)?;
            if let Err(e) = phone_connect(k, receiver_id, new, sender_box) {
                phone_dealloc(k, receiver_id, new);
                return Err(e);
            }
            k.calls
                .with(call, |c| {
                    c.msg.set_arg(5, new);
                    c.stash = SysStash::NewPhone(PhoneRef {
                        task: receiver_id,
                        phone: new,
                    });
                    c.msg
                })
                .ok_or(ErrorCode::Inval)
        }
        _ => Ok(msg),
    }
}

/// System-method work done in the answerer's context before the reply is
/// routed. Handshake resources are committed on success and torn down on
/// refusal; failures here rewrite the reply slot rather than aborting the
/// answer.
fn answer_preprocess(
    k: &Kernel,
    answerer: usize,
    call: CallId,
    answer: &mut RawMessage,
) -> Result<(), ErrorCode> {
    let (method, stash, sender) = k
        .calls
        .with(call, |c| (c.req_method, c.stash.clone(), c.sender))
        .ok_or(ErrorCode::Inval)?;
    let accepted = ErrorCode::from_retval(answer.retval()).is_ok();

    let m = match SysMethod::try_from(method) {
        Ok(m) => m,
        Err(()) => return Ok(()),
    };
    match m {
        SysMethod::PhoneHungup | SysMethod::CloneEstablish | SysMethod::Debug => {}
        SysMethod::ConnectionClone | SysMethod::ConnectToMe => {
            if !accepted {
                if let SysStash::NewPhone(r) = stash {
                    if task::check_index(k, r.task).is_ok() {
                        phone_dealloc(k, r.task, r.phone);
                    }
                }
            }
        }
        SysMethod::ConnectMeTo => {
            if let SysStash::NewPhone(r) = stash {
                if !accepted {
                    if task::check_index(k, r.task).is_ok() {
                        phone_dealloc(k, r.task, r.phone);
                    }
                } else {
                    match task::answerbox_of(k, answerer) {
                        Ok(my_box) => {
                            if phone_connect(k, r.task, r.phone, my_box).is_err() {
                                if task::check_index(k, r.task).is_ok() {
                                    phone_dealloc(k, r.task, r.phone);
                                }
                                answer.set_retval(ErrorCode::Hangup.as_retval());
                            }
                        }
                        Err(e) => answer.set_retval(e.as_retval()),
                    }
                }
            }
        }
        SysMethod::ShareOut => {
            if accepted {
                if let SysStash::SrcArea { task: src, base } = stash {
                    let shared = task::check_index(k, src)
                        .and_then(|src_idx| {
                            let src_as = task::addrspace_of(k, src_idx)?;
                            let dst_as = task::addrspace_of(k, answerer)?;
                            mm::area_share(
                                &k.frames,
                                &src_as,
                                base,
                                &dst_as,
                                answer.arg(1),
                                AreaFlags::empty(),
                            )
                        });
                    match shared {
                        Ok(b) => answer.set_arg(2, b),
                        Err(e) => answer.set_retval(e.as_retval()),
                    }
                }
            }
        }
        SysMethod::ShareIn => {
            if accepted {
                let shared = task::check_index(k, sender).and_then(|caller_idx| {
                    let src_as = task::addrspace_of(k, answerer)?;
                    let dst_as = task::addrspace_of(k, caller_idx)?;
                    mm::area_share(
                        &k.frames,
                        &src_as,
                        answer.arg(1),
                        &dst_as,
                        answer.arg(3),
                        AreaFlags::empty(),
                    )
                });
                match shared {
                    Ok(b) => answer.set_arg(4, b),
                    Err(e) => answer.set_retval(e.as_retval()),
                }
            }
        }
        SysMethod::DataWrite => {
            if accepted {
                let buf = k
                    .calls
                    .with(call, |c| c.buffer.take())
                    .ok_or(ErrorCode::Inval)?;
                if let Some(buf) = buf {
                    // The recipient may shorten the transfer but never
                    // lengthen it.
                    let n = answer.arg(2).min(buf.len());
                    match task::addrspace_of(k, answerer).and_then(|dst| {
                        umem::copy_to_uspace(&k.frames, &dst, &buf[..n], answer.arg(1))
                    }) {
                        Ok(()) => answer.set_arg(2, n),
                        Err(e) => answer.set_retval(e.as_retval()),
                    }
                }
            }
        }
        SysMethod::DataRead => {
            if accepted {
                if let SysStash::DstBuf { len, .. } = stash {
                    let n = answer.arg(2).min(len);
                    let mut buf = alloc::vec![0u8; n];
                    match task::addrspace_of(k, answerer).and_then(|src| {
                        umem::copy_from_uspace(&k.frames, &src, answer.arg(1), &mut buf)
                    }) {
                        Ok(()) => {
                            k.calls.with(call, |c| c.buffer = Some(buf));
                            answer.set_arg(2, n);
                        }
                        Err(e) => answer.set_retval(e.as_retval()),
                    }
                }
            }
        }
        SysMethod::StateChangeAuthorize => {
            if accepted {
                if let SysStash::ThirdParty(third) = stash {
                    match phone_alloc(k, answerer) {
                        Ok(p) => {
                            let me = task::current_id(k, answerer);
                            if phone_connect(k, me, p, third).is_err() {
                                phone_dealloc(k, me, p);
                                answer.set_retval(ErrorCode::Hangup.as_retval());
                            } else {
                                answer.set_arg(1, p);
                            }
                        }
                        Err(e) => answer.set_retval(e.as_retval()),
                    }
                }
            }
        }
    }
    Ok(())
}

/// System-method work done in the original caller's context as the reply
/// is picked up.
fn process_answer(
    k: &Kernel,
    caller: usize,
    call: CallId,
    msg: &mut RawMessage,
) -> Result<(), ErrorCode> {
    let (method, stash, buffer) = k
        .calls
        .with(call, |c| (c.req_method, c.stash.clone(), c.buffer.take()))
        .ok_or(ErrorCode::Inval)?;
    let accepted = ErrorCode::from_retval(msg.retval()).is_ok();

    match SysMethod::try_from(method) {
        Ok(SysMethod::DataRead) | Ok(SysMethod::Debug) => {
            if accepted {
                if let (SysStash::DstBuf { va, len }, Some(buf)) = (stash, buffer) {
                    let n = buf.len().min(len);
                    let copied = task::addrspace_of(k, caller).and_then(|space| {
                        umem::copy_to_uspace(&k.frames, &space, &buf[..n], va)
                    });
                    if copied.is_err() {
                        msg.set_retval(ErrorCode::Inval.as_retval());
                    }
                }
            }
        }
        Ok(SysMethod::ConnectMeTo) => {
            if accepted {
                if let SysStash::NewPhone(r) = stash {
                    msg.set_arg(5, r.phone);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Undoes the request-side effects of a system-method handshake whose
/// answer will never be delivered normally (send failure or callee
/// death). Shared with task teardown.
pub(crate) fn cleanup_stash_on_refusal(k: &Kernel, call: CallId) {
    let stash = match k
        .calls
        .with(call, |c| core::mem::replace(&mut c.stash, SysStash::None))
    {
        Some(s) => s,
        None => return,
    };
    if let SysStash::NewPhone(r) = stash {
        if task::check_index(k, r.task).is_ok() {
            phone_dealloc(k, r.task, r.phone);
        }
    }
}
