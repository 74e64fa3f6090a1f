// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Phone/answerbox IPC, IRQ notifications, and the syscall surface.

mod common;

use std::sync::mpsc;
use std::sync::Arc;

use abi::{
    CallFlags, CapSet, ErrorCode, IrqCmd, IrqCode, IrqOpcode, Priority,
    RawMessage, Sysnum, IPC_MAX_ASYNC_CALLS, IPC_MAX_PHONES, MSG_PHONE_HUNGUP,
    NOTIF_FIRST,
};
use common::{
    boot, join_all, spawn, user_task, user_task_with_caps, wait_until,
    PATIENCE,
};
use kern::ipc::{self, irq};
use kern::proc::task;
use kern::sync::waitq::WaitFlags;
use kern::syscalls;
use kern::umem;

/// Synchronous roundtrip: request (42, [1,2,3,4]) out, answer (7, [10,20])
/// back, payload intact in both directions.
#[test]
fn sync_roundtrip() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();
    assert_eq!(slot, 0);
    let (tx, rx) = mpsc::channel();

    let server = {
        let k2 = Arc::clone(&k);
        let r2 = Arc::clone(&r_task);
        spawn(&k, &r_task, "server", Priority(4), move || {
            let got =
                ipc::wait_for_call(&k2, &r2, None, WaitFlags::empty())
                    .unwrap();
            assert!(!got.is_answer());
            assert_eq!(got.msg.method(), 42);
            assert_eq!(
                [got.msg.arg(1), got.msg.arg(2), got.msg.arg(3), got.msg.arg(4)],
                [1, 2, 3, 4]
            );
            let mut answer = RawMessage::default();
            answer.set_retval(7);
            answer.set_arg(1, 10);
            answer.set_arg(2, 20);
            ipc::answer(&k2, &r2, got.id, answer).unwrap();
        })
    };
    let client = {
        let k2 = Arc::clone(&k);
        let s2 = Arc::clone(&s_task);
        spawn(&k, &s_task, "client", Priority(4), move || {
            let answer = ipc::call_sync(
                &k2,
                &s2,
                slot,
                RawMessage::request(42, [1, 2, 3, 4, 0]),
            )
            .unwrap();
            tx.send((answer.retval(), answer.arg(1), answer.arg(2)))
                .unwrap();
        })
    };

    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (7, 10, 20));
    join_all(&[server, client]);
    k.shutdown();
}

/// Per-phone FIFO: calls issued on one phone arrive in issue order.
#[test]
fn per_phone_fifo() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();

    let mut sent = Vec::new();
    for i in 0..IPC_MAX_ASYNC_CALLS as u64 {
        let id = ipc::call_async(
            &k,
            &s_task,
            slot,
            RawMessage::request(100 + i, [i, 0, 0, 0, 0]),
        )
        .unwrap();
        sent.push(id);
    }

    let (tx, rx) = mpsc::channel();
    let k2 = Arc::clone(&k);
    let r2 = Arc::clone(&r_task);
    let server = spawn(&k, &r_task, "server", Priority(4), move || {
        for _ in 0..IPC_MAX_ASYNC_CALLS {
            let got =
                ipc::wait_for_call(&k2, &r2, None, WaitFlags::empty()).unwrap();
            tx.send((got.id, got.msg.method())).unwrap();
        }
    });
    for (i, id) in sent.iter().enumerate() {
        let (got_id, method) = rx.recv_timeout(PATIENCE).unwrap();
        assert_eq!(got_id, *id);
        assert_eq!(method, 100 + i as u64);
    }
    join_all(&[server]);
    k.shutdown();
}

/// The per-sender pickup-queue cap: one more than the limit fails with
/// Again, and draining one slot readmits the sender.
#[test]
fn sender_flood_cap() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();

    for i in 0..IPC_MAX_ASYNC_CALLS as u64 {
        ipc::call_async(&k, &s_task, slot, RawMessage::request(1, [i; 5]))
            .unwrap();
    }
    assert_eq!(
        ipc::call_async(&k, &s_task, slot, RawMessage::request(1, [9; 5])),
        Err(ErrorCode::Again)
    );

    let (tx, rx) = mpsc::channel();
    let k2 = Arc::clone(&k);
    let r2 = Arc::clone(&r_task);
    let server = spawn(&k, &r_task, "server", Priority(4), move || {
        let got =
            ipc::wait_for_call(&k2, &r2, None, WaitFlags::empty()).unwrap();
        tx.send(got.id).unwrap();
    });
    rx.recv_timeout(PATIENCE).unwrap();
    join_all(&[server]);
    assert!(ipc::call_async(
        &k,
        &s_task,
        slot,
        RawMessage::request(1, [9; 5])
    )
    .is_ok());
    k.shutdown();
}

/// Phone table exhaustion: the slot after the last reports NoResource.
#[test]
fn phone_table_exhaustion() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    for i in 0..IPC_MAX_PHONES {
        assert_eq!(ipc::connect(&s_task, &r_task).unwrap(), i);
    }
    assert_eq!(
        ipc::connect(&s_task, &r_task),
        Err(ErrorCode::NoResource)
    );
    k.shutdown();
}

/// Hangup is idempotent, kills future calls on the phone, and delivers a
/// synthetic MSG_PHONE_HUNGUP to the peer.
#[test]
fn hangup_semantics() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();

    assert_eq!(ipc::hangup(&k, &s_task, slot), Ok(()));
    assert_eq!(ipc::hangup(&k, &s_task, slot), Ok(()), "idempotent");
    assert_eq!(
        ipc::call_async(&k, &s_task, slot, RawMessage::default()),
        Err(ErrorCode::Hangup)
    );
    // Unused slot: not a hangup-able thing.
    assert_eq!(ipc::hangup(&k, &s_task, 7), Err(ErrorCode::InvalidArgument));
    assert_eq!(
        ipc::hangup(&k, &s_task, IPC_MAX_PHONES),
        Err(ErrorCode::InvalidArgument)
    );

    let (tx, rx) = mpsc::channel();
    let k2 = Arc::clone(&k);
    let r2 = Arc::clone(&r_task);
    let server = spawn(&k, &r_task, "server", Priority(4), move || {
        let got =
            ipc::wait_for_call(&k2, &r2, None, WaitFlags::empty()).unwrap();
        tx.send((got.msg.method(), got.sender)).unwrap();
    });
    let (method, sender) = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(method, MSG_PHONE_HUNGUP);
    assert_eq!(sender, s_task.id());
    join_all(&[server]);
    k.shutdown();
}

/// Scenario: a server dies with unanswered calls; every sender-side call
/// comes back as a Hangup answer, correlation ids in issue order, scalar
/// arguments preserved.
#[test]
fn server_death_answers_hangup() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();

    let mut sent = Vec::new();
    for i in 0..3u64 {
        let id = ipc::call_async(
            &k,
            &s_task,
            slot,
            RawMessage::request(50 + i, [i, i + 1, 0, 0, 0]),
        )
        .unwrap();
        sent.push(id);
    }
    assert_eq!(r_task.answerbox.pending_calls(), 3);

    task::task_destroy(&k, &r_task);

    let (tx, rx) = mpsc::channel();
    let k2 = Arc::clone(&k);
    let s2 = Arc::clone(&s_task);
    let collector = spawn(&k, &s_task, "collector", Priority(4), move || {
        for _ in 0..3 {
            let got =
                ipc::wait_for_call(&k2, &s2, None, WaitFlags::empty()).unwrap();
            tx.send(got).unwrap();
        }
    });
    for (i, id) in sent.iter().enumerate() {
        let got = rx.recv_timeout(PATIENCE).unwrap();
        assert!(got.is_answer());
        assert_eq!(got.id, *id, "answers arrive in issue order");
        assert_eq!(
            ErrorCode::from_retword(got.msg.retval()),
            Some(ErrorCode::Hangup)
        );
        assert_eq!(got.msg.arg(1), i as u64, "args preserved in the answer");
        assert_eq!(got.msg.arg(2), i as u64 + 1);
    }
    join_all(&[collector]);

    // The dead server's phone is now detectably gone.
    assert_eq!(
        ipc::call_async(&k, &s_task, slot, RawMessage::default())
            .err()
            .is_some(),
        true
    );
    k.shutdown();
}

/// A sync caller against a dying server gets its Hangup answer delivered
/// through the call's own wait flag.
#[test]
fn sync_caller_unblocked_by_server_death() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();
    let (tx, rx) = mpsc::channel();

    let client = {
        let k2 = Arc::clone(&k);
        let s2 = Arc::clone(&s_task);
        spawn(&k, &s_task, "client", Priority(4), move || {
            let r = ipc::call_sync(
                &k2,
                &s2,
                slot,
                RawMessage::request(99, [5, 6, 7, 8, 0]),
            );
            tx.send(r).unwrap();
        })
    };
    wait_until("call parked at server", || {
        r_task.answerbox.pending_calls() == 1
    });
    task::task_destroy(&k, &r_task);

    let answer = rx.recv_timeout(PATIENCE).unwrap().unwrap();
    assert_eq!(
        ErrorCode::from_retword(answer.retval()),
        Some(ErrorCode::Hangup)
    );
    assert_eq!(answer.arg(1), 5);
    join_all(&[client]);
    k.shutdown();
}

/// Forwarding re-targets a call, preserves the sender, and marks the
/// forwarded path; the final server's answer reaches the original caller.
#[test]
fn forward_chain() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let mid_task = user_task(&k, "mid");
    let end_task = user_task(&k, "end");
    let s_slot = ipc::connect(&s_task, &mid_task).unwrap();
    let mid_slot = ipc::connect(&mid_task, &end_task).unwrap();
    let (tx, rx) = mpsc::channel();

    let middle = {
        let k2 = Arc::clone(&k);
        let m2 = Arc::clone(&mid_task);
        spawn(&k, &mid_task, "middle", Priority(4), move || {
            let got =
                ipc::wait_for_call(&k2, &m2, None, WaitFlags::empty()).unwrap();
            assert_eq!(got.msg.method(), 300);
            ipc::forward(&k2, &m2, got.id, mid_slot, 301).unwrap();
        })
    };
    let end = {
        let k2 = Arc::clone(&k);
        let e2 = Arc::clone(&end_task);
        let s_id = s_task.id();
        spawn(&k, &end_task, "end", Priority(4), move || {
            let got =
                ipc::wait_for_call(&k2, &e2, None, WaitFlags::empty()).unwrap();
            assert_eq!(got.msg.method(), 301, "method replaced by forward");
            assert_eq!(got.msg.arg(1), 77, "args preserved");
            assert_eq!(got.sender, s_id, "sender identity preserved");
            assert!(got.flags.contains(CallFlags::FORWARDED));
            let mut answer = RawMessage::default();
            answer.set_retval(0);
            answer.set_arg(1, 1234);
            ipc::answer(&k2, &e2, got.id, answer).unwrap();
        })
    };
    let client = {
        let k2 = Arc::clone(&k);
        let s2 = Arc::clone(&s_task);
        spawn(&k, &s_task, "client", Priority(4), move || {
            let answer = ipc::call_sync(
                &k2,
                &s2,
                s_slot,
                RawMessage::request(300, [77, 0, 0, 0, 0]),
            )
            .unwrap();
            tx.send((answer.retval(), answer.arg(1))).unwrap();
        })
    };

    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (0, 1234));
    join_all(&[middle, end, client]);
    k.shutdown();
}

/// The connect-me-to handshake mints a phone in the requester's table when
/// the server consents, and reports it in the answer.
#[test]
fn connect_me_to_handshake() {
    let k = boot(1);
    let s_task = user_task(&k, "S");
    let r_task = user_task(&k, "R");
    let slot = ipc::connect(&s_task, &r_task).unwrap();
    let (tx, rx) = mpsc::channel();

    let server = {
        let k2 = Arc::clone(&k);
        let r2 = Arc::clone(&r_task);
        spawn(&k, &r_task, "server", Priority(4), move || {
            let got =
                ipc::wait_for_call(&k2, &r2, None, WaitFlags::empty()).unwrap();
            assert_eq!(got.msg.method(), abi::MSG_CONNECT_ME_TO);
            ipc::answer(&k2, &r2, got.id, RawMessage::default()).unwrap();
        })
    };
    let client = {
        let k2 = Arc::clone(&k);
        let s2 = Arc::clone(&s_task);
        spawn(&k, &s_task, "client", Priority(4), move || {
            let answer = ipc::call_sync(
                &k2,
                &s2,
                slot,
                RawMessage::request(abi::MSG_CONNECT_ME_TO, [0; 5]),
            )
            .unwrap();
            assert_eq!(answer.retval(), 0);
            let new_slot = answer.arg(5) as usize;
            assert_ne!(new_slot, slot);
            // The minted phone works: use it for a second roundtrip... or
            // at least confirm the kernel wired it up.
            let id = ipc::call_async(
                &k2,
                &s2,
                new_slot,
                RawMessage::request(400, [0; 5]),
            )
            .unwrap();
            tx.send(id).unwrap();
        })
    };
    rx.recv_timeout(PATIENCE).unwrap();
    join_all(&[server, client]);
    assert_eq!(r_task.answerbox.pending_calls(), 1);
    k.shutdown();
}

/// Scenario: IRQ program `[ACCEPT]` turns interrupt 5 into exactly one
/// notification, coalesced while unclaimed, re-armed by pickup.
#[test]
fn irq_notification_delivery() {
    let k = boot(1);
    let d_task = user_task(&k, "driver");
    let code = IrqCode::from_cmds(&[IrqCmd {
        op: IrqOpcode::Accept,
        ..IrqCmd::default()
    }]);
    irq::register(&k, &d_task, 5, code, NOTIF_FIRST + 5).unwrap();

    assert!(k.irq(5));
    assert!(k.irq(5), "coalesced, but still claimed");
    assert_eq!(d_task.answerbox.pending_calls(), 1, "lossy coalescing");
    assert!(!k.irq(9), "unregistered interrupt is declined");

    let (tx, rx) = mpsc::channel();
    let k2 = Arc::clone(&k);
    let d2 = Arc::clone(&d_task);
    let driver = spawn(&k, &d_task, "driver", Priority(2), move || {
        let got =
            ipc::wait_for_call(&k2, &d2, None, WaitFlags::empty()).unwrap();
        assert!(got.flags.contains(CallFlags::NOTIFICATION));
        assert!(got.flags.contains(CallFlags::IRQ));
        tx.send(got.msg.method()).unwrap();
        // Source re-armed: the next interrupt lands as a fresh call.
        let got =
            ipc::wait_for_call(&k2, &d2, None, WaitFlags::empty()).unwrap();
        tx.send(got.msg.method()).unwrap();
    });

    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), NOTIF_FIRST + 5);
    wait_until("pickup re-armed the source", || {
        d_task.answerbox.pending_calls() == 0
    });
    assert!(k.irq(5));
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), NOTIF_FIRST + 5);
    join_all(&[driver]);

    irq::unregister(&k, &d_task, 5).unwrap();
    assert!(!k.irq(5));
    k.shutdown();
}

/// Registration-time validation and ownership of IRQ slots.
#[test]
fn irq_registration_rules() {
    let k = boot(1);
    let a = user_task(&k, "A");
    let b = user_task(&k, "B");
    let ok = IrqCode::from_cmds(&[IrqCmd {
        op: IrqOpcode::Accept,
        ..IrqCmd::default()
    }]);

    irq::register(&k, &a, 3, ok, 0).unwrap();
    assert_eq!(
        irq::register(&k, &b, 3, ok, 0),
        Err(ErrorCode::NoResource),
        "one handler per interrupt"
    );
    assert_eq!(
        irq::unregister(&k, &b, 3),
        Err(ErrorCode::PermissionDenied),
        "only the owner may unregister"
    );
    assert_eq!(irq::unregister(&k, &b, 4), Err(ErrorCode::NotFound));

    let bad = IrqCode::from_cmds(&[IrqCmd {
        op: IrqOpcode::BTest,
        srcarg: 99,
        ..IrqCmd::default()
    }]);
    assert_eq!(
        irq::register(&k, &b, 6, bad, 0),
        Err(ErrorCode::InvalidArgument)
    );
    k.shutdown();
}

/// Syscall surface: thread creation validates the user stack, capability
/// bits gate privileged calls, and the console path moves bytes.
#[test]
fn syscall_surface() {
    let k = boot(1);
    let (console_tx, console_rx) = mpsc::channel::<Vec<u8>>();
    let k_con = {
        // Second kernel with a capturing console, used by the IO check.
        kern::Kernel::boot(kern::kernel::BootArgs {
            cpus: 1,
            console: Box::new(move |bytes| {
                let _ = console_tx.send(bytes.to_vec());
            }),
            ..kern::kernel::BootArgs::default()
        })
    };
    let task = user_task_with_caps(
        &k_con,
        "u",
        CapSet::IO | CapSet::PREEMPT_CONTROL,
    );
    let plain = user_task(&k, "plain");
    let (tx, rx) = mpsc::channel();

    let t = {
        let k2 = Arc::clone(&k_con);
        let task2 = Arc::clone(&task);
        spawn(&k_con, &task, "caller", Priority(4), move || {
            // Zero-size stack is rejected before anything is created.
            let r = syscalls::syscall(
                &k2,
                Sysnum::ThreadCreate as u32,
                &[0x9999, 0x1000, 0, 0, 0, 0],
            );
            assert_eq!(r, ErrorCode::InvalidArgument.as_retval());
            // An unmapped stack too.
            let r = syscalls::syscall(
                &k2,
                Sysnum::ThreadCreate as u32,
                &[0x9999, 0xdead_0000, 0x1000, 0, 0, 0],
            );
            assert_eq!(r, ErrorCode::InvalidArgument.as_retval());
            // A mapped one works.
            let r = syscalls::syscall(
                &k2,
                Sysnum::ThreadCreate as u32,
                &[0x9999, 0x2000, 0x1000, 0, 0, 0],
            );
            assert!(r > 0, "thread id expected, got {r}");

            // Console write through SYS_IO.
            task2.a_s.write_bytes(0x1000, b"hi there").unwrap();
            let r = syscalls::syscall(
                &k2,
                Sysnum::Io as u32,
                &[0x1000, 8, 0, 0, 0, 0],
            );
            assert_eq!(r, 8);

            // TLS install sticks.
            let r = syscalls::syscall(
                &k2,
                Sysnum::TlsSet as u32,
                &[0x7777, 0, 0, 0, 0, 0],
            );
            assert_eq!(r, 0);

            // Task id lands in user memory.
            let r = syscalls::syscall(
                &k2,
                Sysnum::TaskGetId as u32,
                &[0x1800, 0, 0, 0, 0, 0],
            );
            assert_eq!(r, 0);

            // Preemption control: enable-without-disable is an error.
            let r = syscalls::syscall(
                &k2,
                Sysnum::PreemptControl as u32,
                &[1, 0, 0, 0, 0, 0],
            );
            assert_eq!(r, ErrorCode::InvalidArgument.as_retval());
            let r = syscalls::syscall(
                &k2,
                Sysnum::PreemptControl as u32,
                &[0, 0, 0, 0, 0, 0],
            );
            assert_eq!(r, 0);
            let r = syscalls::syscall(
                &k2,
                Sysnum::PreemptControl as u32,
                &[1, 0, 0, 0, 0, 0],
            );
            assert_eq!(r, 0);

            // Bogus syscall number.
            let r = syscalls::syscall(&k2, 0xffff, &[0; 6]);
            assert_eq!(r, ErrorCode::InvalidArgument.as_retval());
            tx.send(()).unwrap();
        })
    };
    rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(console_rx.recv_timeout(PATIENCE).unwrap(), b"hi there");
    assert_eq!(
        umem::read_word(&*task.a_s, 0x1800).unwrap(),
        task.id().0
    );
    join_all(&[t]);

    // Capability checks: a capability-less task may not touch the
    // privileged calls.
    let (tx2, rx2) = mpsc::channel();
    let t2 = {
        let k2 = Arc::clone(&k);
        spawn(&k, &plain, "pleb", Priority(4), move || {
            let io = syscalls::syscall(
                &k2,
                Sysnum::Io as u32,
                &[0x1000, 1, 0, 0, 0, 0],
            );
            let irq = syscalls::syscall(
                &k2,
                Sysnum::IpcRegisterIrq as u32,
                &[1, 0x1000, 64, 0, 0, 0],
            );
            let cap = syscalls::syscall(
                &k2,
                Sysnum::CapGrant as u32,
                &[1, 1, 0, 0, 0, 0],
            );
            tx2.send((io, irq, cap)).unwrap();
        })
    };
    let denied = ErrorCode::PermissionDenied.as_retval();
    assert_eq!(rx2.recv_timeout(PATIENCE).unwrap(), (denied, denied, denied));
    join_all(&[t2]);

    k.shutdown();
    k_con.shutdown();
}

/// Slow-path IRQ registration: the program record is unmarshalled from
/// user memory and validated there.
#[test]
fn irq_register_via_syscall() {
    let k = boot(1);
    let task = user_task_with_caps(&k, "drv", CapSet::IRQ_REG);
    let code = IrqCode::from_cmds(&[IrqCmd {
        op: IrqOpcode::Accept,
        ..IrqCmd::default()
    }]);
    let n = umem::write_record(&*task.a_s, 0x3000, 0x1000, &code).unwrap();

    let (tx, rx) = mpsc::channel();
    let k2 = Arc::clone(&k);
    let t = spawn(&k, &task, "drv", Priority(4), move || {
        let r = syscalls::syscall(
            &k2,
            Sysnum::IpcRegisterIrq as u32,
            &[11, 0x3000, n as u64, 0, 0, 0],
        );
        tx.send(r).unwrap();
    });
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 0);
    join_all(&[t]);

    assert!(k.irq(11));
    assert_eq!(task.answerbox.pending_calls(), 1);
    k.shutdown();
}
