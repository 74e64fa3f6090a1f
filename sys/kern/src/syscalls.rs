// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! Syscalls are implemented by functions with the signature:
//!
//! ```ignore
//! fn syscall(k: &Arc<Kernel>, task: &Arc<Task>, args: Args<'_>)
//!     -> Result<u64, ErrorCode>;
//! ```
//!
//! The caller is the current thread; `task` is its task. On success the
//! `u64` travels to userspace unchanged; an `ErrorCode` becomes a negative
//! return value. A common wrapper handles the encoding and the
//! end-of-syscall preemption point, reducing code in each syscall.
//!
//! Arguments arrive as six raw words. Each syscall family reads them
//! through an *argument proxy* method on [`Args`] that assigns names and
//! types to the words, so the register layout of the ABI is written down
//! exactly once.
//!
//! "Fast" IPC variants carry scalars in the argument words; "slow"
//! variants name records in user memory, read through `umem`.

use alloc::sync::Arc;
use core::convert::TryFrom;

use abi::{
    CapSet, ErrorCode, RawMessage, Sysnum, TaskId, CallRecord, NOTIF_FIRST,
};

use crate::arch;
use crate::ipc::{self, irq};
use crate::kernel::Kernel;
use crate::proc::sched;
use crate::proc::task::Task;
use crate::proc::thread;
use crate::sync::futex;
use crate::sync::waitq::WaitFlags;
use crate::umem;

/// Raw syscall argument words, with one naming method per syscall family.
#[derive(Copy, Clone)]
pub struct Args<'a>(&'a [u64; 6]);

impl Args<'_> {
    /// `SYS_IO`: buffer and length.
    fn as_io(&self) -> (u64, usize) {
        (self.0[0], self.0[1] as usize)
    }

    /// Fast calls: phone slot, method, three scalar arguments, and the
    /// answer buffer (sync) or nothing (async) in the last word.
    fn as_call_fast(&self) -> (usize, RawMessage, u64) {
        let msg = RawMessage::request(
            self.0[1],
            [self.0[2], self.0[3], self.0[4], 0, 0],
        );
        (self.0[0] as usize, msg, self.0[5])
    }

    /// Slow calls: phone slot, request record, answer buffer.
    fn as_call_slow(&self) -> (usize, u64, u64) {
        (self.0[0] as usize, self.0[1], self.0[2])
    }

    /// Fast answer: call id, return value, three scalar arguments.
    fn as_answer_fast(&self) -> (u64, RawMessage) {
        let mut msg = RawMessage::default();
        msg.set_retval(self.0[1]);
        msg.set_arg(1, self.0[2]);
        msg.set_arg(2, self.0[3]);
        msg.set_arg(3, self.0[4]);
        (self.0[0], msg)
    }

    /// Slow answer: call id, answer record address.
    fn as_answer_slow(&self) -> (u64, u64) {
        (self.0[0], self.0[1])
    }

    /// Fast forward: call id, new phone slot, replacement method.
    fn as_forward(&self) -> (u64, usize, u64) {
        (self.0[0], self.0[1] as usize, self.0[2])
    }

    /// Slow forward: call id, new phone slot, replacement payload record.
    fn as_forward_slow(&self) -> (u64, usize, u64) {
        (self.0[0], self.0[1] as usize, self.0[2])
    }

    /// Wait-for-call: destination record buffer (and capacity), timeout in
    /// microseconds (0 = forever), wait flags.
    fn as_wait(&self) -> (u64, usize, Option<u64>, WaitFlags) {
        let usec = if self.0[2] == 0 { None } else { Some(self.0[2]) };
        let flags = if self.0[3] & 1 != 0 {
            WaitFlags::NON_BLOCKING
        } else {
            WaitFlags::empty()
        };
        (self.0[0], self.0[1] as usize, usec, flags)
    }

    /// Thread creation: entry pc, stack base, stack size, argument.
    fn as_thread_create(&self) -> (u64, u64, u64, u64) {
        (self.0[0], self.0[1], self.0[2], self.0[3])
    }

    /// Futex sleep: word address, expected value, timeout (0 = forever).
    fn as_futex_sleep(&self) -> (u64, u64, Option<u64>) {
        let usec = if self.0[2] == 0 { None } else { Some(self.0[2]) };
        (self.0[0], self.0[1], usec)
    }

    /// Futex wake: word address, wake count.
    fn as_futex_wake(&self) -> (u64, usize) {
        (self.0[0], self.0[1] as usize)
    }

    /// IRQ registration: interrupt number, program record and its length,
    /// notification method (0 picks the default for the interrupt).
    fn as_irq_register(&self) -> (u32, u64, usize, u64) {
        (self.0[0] as u32, self.0[1], self.0[2] as usize, self.0[3])
    }

    /// Address-space area operations: base, size, flags.
    fn as_area(&self) -> (u64, u64, u32) {
        (self.0[0], self.0[1], self.0[2] as u32)
    }

    /// Capability grant/revoke: target task, capability bits.
    fn as_cap(&self) -> (TaskId, u32) {
        (TaskId(self.0[0]), self.0[1] as u32)
    }
}

/// Syscall entry point. Must be called on a kernel thread (the one whose
/// userspace invoked the syscall); returns the value destined for the
/// user's return register.
pub fn syscall(k: &Arc<Kernel>, nr: u32, args: &[u64; 6]) -> isize {
    let current = arch::current();
    let task = Arc::clone(&current.task);
    let args = Args(args);

    let result = match Sysnum::try_from(nr) {
        Ok(s) => dispatch(k, s, &task, args),
        Err(()) => Err(ErrorCode::InvalidArgument),
    };
    let retval = match result {
        Ok(v) => v as isize,
        Err(e) => e.as_retval(),
    };
    // Syscall exit is a preemption point.
    sched::preempt_point(k);
    retval
}

fn dispatch(
    k: &Arc<Kernel>,
    nr: Sysnum,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    match nr {
        Sysnum::Io => sys_io(k, task, args),
        Sysnum::TlsSet => sys_tls_set(args),
        Sysnum::ThreadCreate => sys_thread_create(k, task, args),
        Sysnum::ThreadExit => thread::exit_current(),
        Sysnum::TaskGetId => sys_task_get_id(task, args),
        Sysnum::FutexSleepTimeout => sys_futex_sleep(k, task, args),
        Sysnum::FutexWakeup => sys_futex_wake(k, task, args),
        Sysnum::AsAreaCreate => {
            let (base, size, flags) = args.as_area();
            task.a_s.area_create(base, size, flags)
        }
        Sysnum::AsAreaResize => {
            let (base, size, _) = args.as_area();
            task.a_s.area_resize(base, size).map(|_| 0)
        }
        Sysnum::AsAreaDestroy => {
            let (base, _, _) = args.as_area();
            task.a_s.area_destroy(base).map(|_| 0)
        }
        Sysnum::AsAreaAccept => {
            let (base, size, _) = args.as_area();
            task.a_s.area_accept(base, size).map(|_| 0)
        }
        Sysnum::AsAreaSend => {
            let (base, size, _) = args.as_area();
            task.a_s.area_send(base, size).map(|_| 0)
        }
        Sysnum::IpcCallSyncFast => {
            let (slot, msg, answer_va) = args.as_call_fast();
            let answer = ipc::call_sync(k, task, slot, msg)?;
            finish_sync_answer(task, answer_va, &answer)
        }
        Sysnum::IpcCallSyncSlow => {
            let (slot, msg_va, answer_va) = args.as_call_slow();
            let msg = umem::read_message(&*task.a_s, msg_va)?;
            let answer = ipc::call_sync(k, task, slot, msg)?;
            finish_sync_answer(task, answer_va, &answer)
        }
        Sysnum::IpcCallAsyncFast => {
            let (slot, msg, _) = args.as_call_fast();
            ipc::call_async(k, task, slot, msg)
        }
        Sysnum::IpcCallAsyncSlow => {
            let (slot, msg_va, _) = args.as_call_slow();
            let msg = umem::read_message(&*task.a_s, msg_va)?;
            ipc::call_async(k, task, slot, msg)
        }
        Sysnum::IpcAnswerFast => {
            let (call_id, msg) = args.as_answer_fast();
            ipc::answer(k, task, call_id, msg)
        }
        Sysnum::IpcAnswerSlow => {
            let (call_id, msg_va) = args.as_answer_slow();
            let msg = umem::read_message(&*task.a_s, msg_va)?;
            ipc::answer(k, task, call_id, msg)
        }
        Sysnum::IpcForwardFast => {
            let (call_id, slot, method) = args.as_forward();
            ipc::forward(k, task, call_id, slot, method).map(|_| 0)
        }
        Sysnum::IpcForwardSlow => {
            let (call_id, slot, msg_va) = args.as_forward_slow();
            let msg = umem::read_message(&*task.a_s, msg_va)?;
            ipc::forward_payload(k, task, call_id, slot, msg).map(|_| 0)
        }
        Sysnum::IpcWaitForCall => sys_ipc_wait(k, task, args),
        Sysnum::IpcHangup => {
            ipc::hangup(k, task, args.0[0] as usize).map(|_| 0)
        }
        Sysnum::IpcRegisterIrq => sys_irq_register(k, task, args),
        Sysnum::IpcUnregisterIrq => {
            require_cap(task, CapSet::IRQ_REG)?;
            irq::unregister(k, task, args.0[0] as u32).map(|_| 0)
        }
        Sysnum::CapGrant => sys_cap_grant(k, task, args),
        Sysnum::CapRevoke => sys_cap_revoke(k, task, args),
        Sysnum::PreemptControl => sys_preempt_control(task, args),
    }
}

fn require_cap(task: &Task, cap: CapSet) -> Result<(), ErrorCode> {
    if task.has_cap(cap) {
        Ok(())
    } else {
        Err(ErrorCode::PermissionDenied)
    }
}

/// Writes a sync call's answer record back to userspace, if the caller
/// asked for it, and reduces the syscall result to the answer's retval.
fn finish_sync_answer(
    task: &Arc<Task>,
    answer_va: u64,
    answer: &RawMessage,
) -> Result<u64, ErrorCode> {
    if answer_va != 0 {
        umem::write_message(&*task.a_s, answer_va, answer)?;
    }
    Ok(answer.retval())
}

/// Placeholder console write path.
fn sys_io(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    require_cap(task, CapSet::IO)?;
    let (va, len) = args.as_io();
    if len > 4096 {
        return Err(ErrorCode::InvalidArgument);
    }
    let mut buf = alloc::vec![0u8; len];
    task.a_s.read_bytes(va, &mut buf)?;
    k.console_write(&buf);
    Ok(len as u64)
}

/// Installs the calling thread's TLS pointer; the dispatcher reinstates it
/// whenever the thread runs.
fn sys_tls_set(args: Args<'_>) -> Result<u64, ErrorCode> {
    let t = arch::current();
    t.inner.lock().tls = args.0[0];
    Ok(0)
}

fn sys_thread_create(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    let (entry, stack_base, stack_size, uarg) = args.as_thread_create();
    if stack_size == 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    // The user stack must be mapped end to end.
    if task.a_s.resolve(stack_base).is_none()
        || task.a_s.resolve(stack_base + stack_size - 1).is_none()
    {
        return Err(ErrorCode::InvalidArgument);
    }
    let kw = Arc::downgrade(k);
    let t = thread::thread_create(
        k,
        task,
        "uthread",
        abi::Priority::LOWEST_USER,
        alloc::boxed::Box::new(move || {
            if let Some(k) = kw.upgrade() {
                k.user_dispatch(entry, uarg);
            }
        }),
    )?;
    thread::thread_ready(k, &t);
    Ok(t.id().0)
}

fn sys_task_get_id(
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    umem::write_word(&*task.a_s, args.0[0], task.id().0)?;
    Ok(0)
}

fn sys_futex_sleep(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    let (uaddr, expected, usec) = args.as_futex_sleep();
    futex::futex_wait(k, task, uaddr, expected, usec).map(|_| 0)
}

fn sys_futex_wake(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    let (uaddr, n) = args.as_futex_wake();
    futex::futex_wake(k, task, uaddr, n).map(|n| n as u64)
}

fn sys_ipc_wait(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    let (dst_va, dst_len, usec, flags) = args.as_wait();
    let received = ipc::wait_for_call(k, task, usec, flags)?;
    let record = CallRecord {
        id: received.id,
        words: received.msg.0,
        flags: received.flags.bits(),
        sender: received.sender.0,
    };
    if dst_va != 0 {
        umem::write_record(&*task.a_s, dst_va, dst_len, &record)?;
    }
    Ok(received.id)
}

fn sys_irq_register(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    require_cap(task, CapSet::IRQ_REG)?;
    let (inr, code_va, code_len, method) = args.as_irq_register();
    let code: abi::IrqCode = umem::read_record(&*task.a_s, code_va, code_len)?;
    let method = if method == 0 {
        NOTIF_FIRST + inr as u64
    } else {
        method
    };
    irq::register(k, task, inr, code, method).map(|_| 0)
}

fn sys_cap_grant(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    require_cap(task, CapSet::CAP_MANAGE)?;
    let (target, bits) = args.as_cap();
    let caps = CapSet::from_bits(bits).ok_or(ErrorCode::InvalidArgument)?;
    let target = k.task_find(target).ok_or(ErrorCode::NotFound)?;
    target.grant_cap(caps);
    Ok(0)
}

fn sys_cap_revoke(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    require_cap(task, CapSet::CAP_MANAGE)?;
    let (target, bits) = args.as_cap();
    let caps = CapSet::from_bits(bits).ok_or(ErrorCode::InvalidArgument)?;
    let target = k.task_find(target).ok_or(ErrorCode::NotFound)?;
    target.revoke_cap(caps);
    Ok(0)
}

/// Turns preemption off (`enable == 0`) or back on (`enable != 0`) for the
/// calling thread. Depth-counted; enabling below depth zero is an error
/// rather than a crash, since userspace drives this one.
fn sys_preempt_control(
    task: &Arc<Task>,
    args: Args<'_>,
) -> Result<u64, ErrorCode> {
    require_cap(task, CapSet::PREEMPT_CONTROL)?;
    let t = arch::current();
    if args.0[0] == 0 {
        t.preempt_disable();
        Ok(0)
    } else {
        if !t.preemption_disabled() {
            return Err(ErrorCode::InvalidArgument);
        }
        t.preempt_enable();
        Ok(0)
    }
}
