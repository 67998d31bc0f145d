//! Property tests: the call partition invariant under arbitrary
//! interleavings of send, receive, answer, and drain.

mod common;

use abi::{WaitFlags, FIRST_USER_METHOD, MAX_ASYNC_CALLS};
use common::{fixture, msg, ok_reply};
use kern::ipc::sysipc::AsyncSendError;
use kern::ipc::WaitOutcome;
use kern::syscalls;
use proptest::prelude::*;

#[derive(Copy, Clone, Debug)]
enum Op {
    Send,
    RecvB,
    Answer,
    DrainA,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Send),
        Just(Op::RecvB),
        Just(Op::Answer),
        Just(Op::DrainA),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn call_partition_holds_under_random_interleavings(
        ops in proptest::collection::vec(op_strategy(), 1..200)
    ) {
        let f = fixture();
        let k = &f.k;

        // Model state, kept in lockstep with the kernel's.
        let mut window = 0usize;       // unanswered-and-undrained sends
        let mut undelivered = 0usize;  // waiting in b's incoming queue
        let mut held: Vec<abi::CallId> = Vec::new();
        let mut replies = 0usize;      // waiting in a's answers queue
        let mut seq = 0usize;

        for op in ops {
            match op {
                Op::Send => {
                    let r = syscalls::ipc_call_async(
                        k, f.a, f.a_to_b,
                        msg(FIRST_USER_METHOD, [seq, 0, 0, 0, 0]),
                    );
                    if window < MAX_ASYNC_CALLS {
                        prop_assert!(r.is_ok());
                        window += 1;
                        undelivered += 1;
                        seq += 1;
                    } else {
                        prop_assert_eq!(r, Err(AsyncSendError::Temporary));
                    }
                }
                Op::RecvB => {
                    let r = syscalls::ipc_wait(k, f.b, WaitFlags::NON_BLOCKING, None).unwrap();
                    match r {
                        WaitOutcome::Call(c) => {
                            prop_assert!(undelivered > 0);
                            prop_assert!(!c.answered);
                            undelivered -= 1;
                            held.push(c.id);
                        }
                        WaitOutcome::WouldBlock => prop_assert_eq!(undelivered, 0),
                        other => prop_assert!(false, "unexpected {:?}", other),
                    }
                }
                Op::Answer => {
                    if let Some(id) = held.first().copied() {
                        held.remove(0);
                        syscalls::ipc_answer(k, f.b, id, ok_reply()).unwrap();
                        replies += 1;
                    }
                }
                Op::DrainA => {
                    let r = syscalls::ipc_wait(k, f.a, WaitFlags::NON_BLOCKING, None).unwrap();
                    match r {
                        WaitOutcome::Call(c) => {
                            prop_assert!(replies > 0);
                            prop_assert!(c.answered);
                            replies -= 1;
                            window -= 1;
                        }
                        WaitOutcome::WouldBlock => prop_assert_eq!(replies, 0),
                        other => prop_assert!(false, "unexpected {:?}", other),
                    }
                }
            }
            // A call may never appear on two lists, quiescent or not.
            prop_assert_eq!(k.audit_calls().double_listed, 0);
        }

        // Drive the system to quiescence and check the full partition.
        loop {
            match syscalls::ipc_wait(k, f.b, WaitFlags::NON_BLOCKING, None).unwrap() {
                WaitOutcome::Call(c) => held.push(c.id),
                _ => break,
            }
        }
        for id in held.drain(..) {
            syscalls::ipc_answer(k, f.b, id, ok_reply()).unwrap();
        }
        loop {
            match syscalls::ipc_wait(k, f.a, WaitFlags::NON_BLOCKING, None).unwrap() {
                WaitOutcome::Call(_) => {}
                _ => break,
            }
        }
        k.assert_quiescent();
    }

    #[test]
    fn banked_wakeups_never_get_lost(extra in 0usize..32) {
        use kern::sync::{SleepFlags, SleepOutcome, WaitQueue, WakeupPolicy};
        let q = WaitQueue::new("prop_wq");
        for _ in 0..extra {
            q.wakeup(WakeupPolicy::First);
        }
        for _ in 0..extra {
            prop_assert_eq!(q.sleep(None, SleepFlags::empty()), SleepOutcome::Ok);
        }
        prop_assert_eq!(
            q.sleep(None, SleepFlags::NON_BLOCKING),
            SleepOutcome::WouldBlock
        );
    }
}
