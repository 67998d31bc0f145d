//! Task-side IPC support.
//!
//! Wraps the raw syscall surface with the machinery a real client needs:
//! a per-task port for synchronous calls, and an async engine that tracks
//! outstanding calls by ID, queues sends the kernel refused with
//! `Temporary`, retries them on the next event-loop tick, and
//! demultiplexes incoming replies into futures or callbacks. A reply that
//! matches no outstanding call is dropped silently; this is normal after a
//! cancelled call races its answer.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use abi::{CallId, ErrorCode, RawMessage, WaitFlags};
use kern::err::UserError;
use kern::ipc::sysipc::AsyncSendError;
use kern::ipc::{Received, WaitOutcome};
use kern::{syscalls, Kernel};

/// One task's view of the syscall surface.
pub struct TaskPort {
    kernel: Arc<Kernel>,
    task: usize,
}

impl TaskPort {
    pub fn new(kernel: Arc<Kernel>, task: usize) -> Self {
        Self { kernel, task }
    }

    pub fn task_index(&self) -> usize {
        self.task
    }

    /// Synchronous call: blocks for the reply. Peer-side errors come back
    /// in the reply slot; decode with [`ErrorCode::from_retval`].
    pub fn call_sync(&self, phone: usize, msg: RawMessage) -> Result<RawMessage, UserError> {
        syscalls::ipc_call_sync(&self.kernel, self.task, phone, msg)
    }

    pub fn call_async(&self, phone: usize, msg: RawMessage) -> Result<CallId, AsyncSendError> {
        syscalls::ipc_call_async(&self.kernel, self.task, phone, msg)
    }

    pub fn answer(&self, call: CallId, msg: RawMessage) -> Result<(), UserError> {
        syscalls::ipc_answer(&self.kernel, self.task, call, msg)
    }

    pub fn forward(
        &self,
        call: CallId,
        new_phone: usize,
        new_method: usize,
    ) -> Result<(), UserError> {
        syscalls::ipc_forward(&self.kernel, self.task, call, new_phone, new_method)
    }

    pub fn wait(&self, flags: WaitFlags, timeout: Option<u64>) -> Result<WaitOutcome, UserError> {
        syscalls::ipc_wait(&self.kernel, self.task, flags, timeout)
    }

    pub fn hangup(&self, phone: usize) -> Result<(), UserError> {
        syscalls::ipc_hangup(&self.kernel, self.task, phone)
    }
}

/// How an async reply is delivered to the client.
enum Pending {
    Future(Arc<ReplyState>),
    Callback(Box<dyn FnOnce(Result<RawMessage, ErrorCode>) + Send>),
}

struct QueuedSend {
    phone: usize,
    msg: RawMessage,
    completion: Pending,
}

struct ReplyState {
    inner: Mutex<ReplyInner>,
}

struct ReplyInner {
    result: Option<Result<RawMessage, ErrorCode>>,
    waker: Option<Waker>,
}

/// Completion handle for an asynchronous call, keyed by its call ID.
pub struct ReplyFuture {
    state: Arc<ReplyState>,
}

impl ReplyFuture {
    /// Non-blocking probe for executors of the do-it-yourself kind.
    pub fn try_take(&self) -> Option<Result<RawMessage, ErrorCode>> {
        self.state.inner.lock().unwrap().result.take()
    }
}

impl Future for ReplyFuture {
    type Output = Result<RawMessage, ErrorCode>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.state.inner.lock().unwrap();
        match inner.result.take() {
            Some(r) => Poll::Ready(r),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

fn complete(p: Pending, result: Result<RawMessage, ErrorCode>) {
    match p {
        Pending::Future(state) => {
            let waker = {
                let mut inner = state.inner.lock().unwrap();
                inner.result = Some(result);
                inner.waker.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
        }
        Pending::Callback(cb) => cb(result),
    }
}

/// The async engine: one per event-loop thread.
pub struct AsyncIpc {
    port: TaskPort,
    outstanding: HashMap<CallId, Pending>,
    queued: VecDeque<QueuedSend>,
}

impl AsyncIpc {
    pub fn new(port: TaskPort) -> Self {
        Self {
            port,
            outstanding: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    pub fn port(&self) -> &TaskPort {
        &self.port
    }

    /// Sends asynchronously, returning a future for the reply. A send the
    /// kernel refuses outright completes the future immediately with the
    /// no-route error; a `Temporary` refusal queues the send for the next
    /// tick.
    pub fn call_async(&mut self, phone: usize, msg: RawMessage) -> ReplyFuture {
        let state = Arc::new(ReplyState {
            inner: Mutex::new(ReplyInner {
                result: None,
                waker: None,
            }),
        });
        self.submit(phone, msg, Pending::Future(Arc::clone(&state)));
        ReplyFuture { state }
    }

    /// Callback flavor of [`call_async`](Self::call_async).
    pub fn call_async_with(
        &mut self,
        phone: usize,
        msg: RawMessage,
        cb: impl FnOnce(Result<RawMessage, ErrorCode>) + Send + 'static,
    ) {
        self.submit(phone, msg, Pending::Callback(Box::new(cb)));
    }

    fn submit(&mut self, phone: usize, msg: RawMessage, completion: Pending) {
        match self.port.call_async(phone, msg) {
            Ok(id) => {
                self.outstanding.insert(id, completion);
            }
            Err(AsyncSendError::Temporary) => {
                self.queued.push_back(QueuedSend {
                    phone,
                    msg,
                    completion,
                });
            }
            Err(AsyncSendError::Fatal(code)) => complete(completion, Err(code)),
        }
    }

    /// Number of sends parked waiting for the async window to reopen.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Retries queued sends until one is again refused with `Temporary`.
    fn retry_queued(&mut self) {
        while let Some(q) = self.queued.pop_front() {
            match self.port.call_async(q.phone, q.msg) {
                Ok(id) => {
                    self.outstanding.insert(id, q.completion);
                }
                Err(AsyncSendError::Temporary) => {
                    self.queued.push_front(q);
                    break;
                }
                Err(AsyncSendError::Fatal(code)) => complete(q.completion, Err(code)),
            }
        }
    }

    fn handle_reply(&mut self, r: Received) {
        match self.outstanding.remove(&r.id) {
            Some(p) => {
                let result = match ErrorCode::from_retval(r.msg.retval()) {
                    Ok(_) => Ok(r.msg),
                    Err(e) => Err(e),
                };
                complete(p, result);
            }
            None => {
                log::debug!("dropping reply for unknown call {:?}", r.id);
            }
        }
    }

    /// One event-loop tick: retry queued sends, then wait. Replies are
    /// dispatched internally; the first request (or flow-control outcome)
    /// is returned to the caller.
    pub fn wait_for_call(
        &mut self,
        flags: WaitFlags,
        timeout: Option<u64>,
    ) -> Result<WaitOutcome, UserError> {
        loop {
            self.retry_queued();
            match self.port.wait(flags, timeout)? {
                WaitOutcome::Call(r) if r.answered => {
                    self.handle_reply(r);
                    continue;
                }
                other => return Ok(other),
            }
        }
    }
}
