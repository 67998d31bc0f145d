//! The task-side async engine: queueing, retry, demultiplexing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use abi::{ErrorCode, RawMessage, WaitFlags, EOK, FIRST_USER_METHOD, MAX_ASYNC_CALLS, PHONE_NS};
use kern::ipc::WaitOutcome;
use kern::{syscalls, task, Kernel, KernelConfig};
use userlib::{AsyncIpc, TaskPort};

/// Server task plus a client whose phone 0 points at it.
fn client_server() -> (Arc<Kernel>, usize, usize) {
    let k = Kernel::boot(KernelConfig::default());
    let server = task::create(&k).unwrap();
    k.set_naming_service(server).unwrap();
    let client = task::create(&k).unwrap().index();
    (k, client, server.index())
}

fn user_msg(tag: usize) -> RawMessage {
    RawMessage::new(FIRST_USER_METHOD, [tag, 0, 0, 0, 0])
}

fn serve_pending(k: &Kernel, server: usize) -> usize {
    let mut served = 0;
    loop {
        match syscalls::ipc_wait(k, server, WaitFlags::NON_BLOCKING, None).unwrap() {
            WaitOutcome::Call(r) => {
                let mut reply = RawMessage::default();
                reply.set_retval(EOK);
                reply.set_arg(1, r.msg.arg(1) + 1);
                syscalls::ipc_answer(k, server, r.id, reply).unwrap();
                served += 1;
            }
            _ => return served,
        }
    }
}

#[test]
fn overflow_sends_are_queued_and_retried() {
    let (k, client, server) = client_server();
    let mut ipc = AsyncIpc::new(TaskPort::new(Arc::clone(&k), client));

    const TOTAL: usize = 6;
    let futures: Vec<_> = (0..TOTAL)
        .map(|i| ipc.call_async(PHONE_NS, user_msg(i)))
        .collect();
    // The async window holds four; the rest park locally.
    assert_eq!(ipc.queued_len(), TOTAL - MAX_ASYNC_CALLS);

    let mut served = serve_pending(&k, server);
    // Drain replies; this also retries the parked sends.
    while served < TOTAL {
        let _ = ipc
            .wait_for_call(WaitFlags::NON_BLOCKING, None)
            .unwrap();
        served += serve_pending(&k, server);
    }
    let _ = ipc.wait_for_call(WaitFlags::NON_BLOCKING, None).unwrap();

    assert_eq!(ipc.queued_len(), 0);
    for (i, f) in futures.into_iter().enumerate() {
        let reply = f.try_take().expect("reply must have landed").unwrap();
        assert_eq!(reply.arg(1), i + 1);
    }
    k.assert_quiescent();
}

#[test]
fn fatal_send_completes_immediately_with_no_route() {
    let (k, client, _) = client_server();
    let mut ipc = AsyncIpc::new(TaskPort::new(Arc::clone(&k), client));
    // Phone 7 was never connected.
    let f = ipc.call_async(7, user_msg(0));
    assert_eq!(f.try_take(), Some(Err(ErrorCode::NoEnt)));
}

#[test]
fn callback_flavor_fires_on_reply() {
    let (k, client, server) = client_server();
    let mut ipc = AsyncIpc::new(TaskPort::new(Arc::clone(&k), client));

    let fired = Arc::new(AtomicBool::new(false));
    let witness = Arc::clone(&fired);
    ipc.call_async_with(PHONE_NS, user_msg(41), move |r| {
        assert_eq!(r.unwrap().arg(1), 42);
        witness.store(true, Ordering::Relaxed);
    });
    assert_eq!(serve_pending(&k, server), 1);
    let _ = ipc.wait_for_call(WaitFlags::NON_BLOCKING, None).unwrap();
    assert!(fired.load(Ordering::Relaxed));
    k.assert_quiescent();
}

#[test]
fn sync_call_round_trips_through_the_port() {
    let (k, client, server) = client_server();
    let port = TaskPort::new(Arc::clone(&k), client);

    let kk = Arc::clone(&k);
    let h = std::thread::spawn(move || {
        loop {
            match syscalls::ipc_wait(&kk, server, WaitFlags::empty(), None).unwrap() {
                WaitOutcome::Call(r) if !r.answered => {
                    let mut reply = RawMessage::default();
                    reply.set_retval(EOK);
                    reply.set_arg(1, r.msg.arg(1) * 2);
                    syscalls::ipc_answer(&kk, server, r.id, reply).unwrap();
                    return;
                }
                _ => continue,
            }
        }
    });

    let reply = port.call_sync(PHONE_NS, user_msg(21)).unwrap();
    assert_eq!(reply.retval(), EOK);
    assert_eq!(reply.arg(1), 42);
    h.join().unwrap();
    k.assert_quiescent();
}
