//! Shared scaffolding for the integration tests: a booted kernel with a
//! naming service and two connected peer tasks, plus small drivers for the
//! connection handshakes.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::sync::Arc;

use abi::{RawMessage, SysMethod, WaitFlags, EOK, MSG_ARG_COUNT, PHONE_NS};
use kern::ipc::{Received, WaitOutcome};
use kern::{syscalls, task, Kernel, KernelConfig};

pub fn msg(method: usize, args: [usize; MSG_ARG_COUNT]) -> RawMessage {
    RawMessage::new(method, args)
}

pub fn ok_reply() -> RawMessage {
    let mut m = RawMessage::default();
    m.set_retval(EOK);
    m
}

/// Blocking receive that must produce a call.
pub fn recv(k: &Kernel, t: usize) -> Received {
    match syscalls::ipc_wait(k, t, WaitFlags::empty(), None).unwrap() {
        WaitOutcome::Call(r) => r,
        other => panic!("expected a call, got {:?}", other),
    }
}

/// A kernel with a naming service and two peers; `a` holds `a_to_b`.
pub struct Fixture {
    pub k: Arc<Kernel>,
    pub ns: usize,
    pub a: usize,
    pub b: usize,
    /// Phone descriptor in `a` connected to `b`.
    pub a_to_b: usize,
    /// Phone descriptor in `ns` connected to `b`.
    pub ns_to_b: usize,
}

/// Gives the *receiver* of `via` a phone to `sender`: `sender` issues a
/// callback-connection request over `via`, `receiver` accepts it.
pub fn reverse_connect(k: &Kernel, receiver: usize, sender: usize, via: usize) -> usize {
    let pending = syscalls::ipc_call_async(
        k,
        sender,
        via,
        msg(SysMethod::ConnectToMe as usize, [0; 5]),
    )
    .unwrap();

    let r = recv(k, receiver);
    assert_eq!(r.msg.method, SysMethod::ConnectToMe as usize);
    let phone = r.msg.arg(5);
    syscalls::ipc_answer(k, receiver, r.id, ok_reply()).unwrap();

    // Drain the sender's reply.
    let rep = recv(k, sender);
    assert!(rep.answered);
    assert_eq!(rep.id, pending);
    phone
}

/// Name resolution: `a` asks the naming service for a connection, the
/// naming service forwards to `b`, `b` accepts. Returns `a`'s new phone.
pub fn connect_via_ns(k: &Kernel, a: usize, ns: usize, ns_to_b: usize, b: usize) -> usize {
    let pending = syscalls::ipc_call_async(
        k,
        a,
        PHONE_NS,
        msg(SysMethod::ConnectMeTo as usize, [0; 5]),
    )
    .unwrap();

    let r = recv(k, ns);
    assert_eq!(r.msg.method, SysMethod::ConnectMeTo as usize);
    syscalls::ipc_forward(k, ns, r.id, ns_to_b, 0).unwrap();

    let r = recv(k, b);
    assert_eq!(r.msg.method, SysMethod::ConnectMeTo as usize);
    syscalls::ipc_answer(k, b, r.id, ok_reply()).unwrap();

    let rep = recv(k, a);
    assert!(rep.answered);
    assert_eq!(rep.id, pending);
    assert_eq!(rep.msg.retval(), EOK);
    rep.msg.arg(5)
}

pub fn fixture() -> Fixture {
    let k = Kernel::boot(KernelConfig::default());
    let ns_id = task::create(&k).unwrap();
    k.set_naming_service(ns_id).unwrap();
    let ns = ns_id.index();
    let a = task::create(&k).unwrap().index();
    let b = task::create(&k).unwrap().index();
    let ns_to_b = reverse_connect(&k, ns, b, PHONE_NS);
    let a_to_b = connect_via_ns(&k, a, ns, ns_to_b, b);
    Fixture {
        k,
        ns,
        a,
        b,
        a_to_b,
        ns_to_b,
    }
}
