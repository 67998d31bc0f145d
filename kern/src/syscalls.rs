//! The syscall surface.
//!
//! Thin, uniform wrappers over the ipc and mm internals. Each takes the
//! calling task's table index explicitly (the port's trap entry resolves
//! the current task before landing here) and applies the kill-on-
//! unrecoverable-error policy in one place.

use abi::{AreaFlags, CallId, RawMessage, TaskId, WaitFlags};

use crate::err::UserError;
use crate::ipc::sysipc::{self, AsyncSendError};
use crate::ipc::WaitOutcome;
use crate::mm;
use crate::startup::Kernel;
use crate::task;

fn finish<T>(k: &Kernel, caller: usize, r: Result<T, UserError>) -> Result<T, UserError> {
    if let Err(UserError::Unrecoverable(f)) = &r {
        task::kill(k, caller, *f);
    }
    r
}

pub fn ipc_call_sync(
    k: &Kernel,
    caller: usize,
    phone: usize,
    msg: RawMessage,
) -> Result<RawMessage, UserError> {
    finish(k, caller, sysipc::sys_ipc_call_sync(k, caller, phone, msg))
}

pub fn ipc_call_async(
    k: &Kernel,
    caller: usize,
    phone: usize,
    msg: RawMessage,
) -> Result<CallId, AsyncSendError> {
    sysipc::sys_ipc_call_async(k, caller, phone, msg)
}

pub fn ipc_answer(
    k: &Kernel,
    caller: usize,
    call_id: CallId,
    msg: RawMessage,
) -> Result<(), UserError> {
    finish(k, caller, sysipc::sys_ipc_answer(k, caller, call_id, msg))
}

pub fn ipc_forward(
    k: &Kernel,
    caller: usize,
    call_id: CallId,
    new_phone: usize,
    new_method: usize,
) -> Result<(), UserError> {
    finish(
        k,
        caller,
        sysipc::sys_ipc_forward(k, caller, call_id, new_phone, new_method),
    )
}

pub fn ipc_wait(
    k: &Kernel,
    caller: usize,
    flags: WaitFlags,
    timeout: Option<u64>,
) -> Result<WaitOutcome, UserError> {
    finish(k, caller, sysipc::sys_ipc_wait(k, caller, flags, timeout))
}

pub fn ipc_hangup(k: &Kernel, caller: usize, phone: usize) -> Result<(), UserError> {
    finish(k, caller, sysipc::sys_ipc_hangup(k, caller, phone))
}

pub fn as_area_create(
    k: &Kernel,
    caller: usize,
    base: usize,
    size: usize,
    flags: AreaFlags,
) -> Result<(), UserError> {
    let space = task::addrspace_of(k, caller).map_err(UserError::Recoverable)?;
    space
        .area_create(base, size, flags)
        .map_err(UserError::Recoverable)
}

pub fn as_area_resize(
    k: &Kernel,
    caller: usize,
    base: usize,
    new_size: usize,
) -> Result<(), UserError> {
    let space = task::addrspace_of(k, caller).map_err(UserError::Recoverable)?;
    space
        .area_resize(&k.frames, base, new_size)
        .map_err(UserError::Recoverable)
}

pub fn as_area_destroy(k: &Kernel, caller: usize, base: usize) -> Result<(), UserError> {
    let space = task::addrspace_of(k, caller).map_err(UserError::Recoverable)?;
    space
        .area_destroy(&k.frames, base)
        .map_err(UserError::Recoverable)
}

/// Maps the area based at `base` of the calling task into `target`'s
/// address space at `dst_base`. The checked path for unrelated tasks is
/// the share handshake over IPC; this direct form backs it.
pub fn as_area_share(
    k: &Kernel,
    caller: usize,
    base: usize,
    target: TaskId,
    dst_base: usize,
    flags_mask: AreaFlags,
) -> Result<usize, UserError> {
    let r = (|| {
        let target_idx = task::check_task_id(k, target)?;
        let src = task::addrspace_of(k, caller).map_err(UserError::Recoverable)?;
        let dst = task::addrspace_of(k, target_idx).map_err(UserError::Recoverable)?;
        mm::area_share(&k.frames, &src, base, &dst, dst_base, flags_mask)
            .map_err(UserError::Recoverable)
    })();
    finish(k, caller, r)
}
