// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted machine backend.
//!
//! Every kernel thread is backed by one host OS thread. A thread's "saved
//! context" is that host thread, parked on a condition variable; restoring
//! the context means setting its resume flag and signalling. The handoff is
//! a flag rather than a bare notify so a resume that races ahead of the
//! corresponding park is never lost.
//!
//! The current-thread register of a real CPU becomes a host thread-local.
//! Host threads that carry no kernel thread (the clock driver, interrupt
//! injectors, test harnesses) read it as empty; they play the role of
//! interrupt context.

use alloc::string::String;
use alloc::sync::Arc;
use core::cell::RefCell;
use core::sync::atomic::{fence, Ordering};
use core::time::Duration;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};

use crate::proc::thread::Thread;

/// Saved machine state of a kernel thread: the parked host thread plus the
/// flags used to hand control back to it.
#[derive(Default)]
pub struct Context {
    state: Mutex<ContextState>,
    cond: Condvar,
}

#[derive(Default)]
struct ContextState {
    /// Set by `resume`, consumed by `park`.
    resumed: bool,
    /// Set once the backing host thread has unwound; observed by joiners.
    exited: bool,
}

impl Context {
    /// Hands the CPU to this context. The owning host thread's next (or
    /// in-progress) [`Context::park`] returns.
    pub fn resume(&self) {
        let mut st = self.state.lock().unwrap();
        st.resumed = true;
        self.cond.notify_all();
    }

    /// Gives up the CPU until somebody resumes this context. Must only be
    /// called by the owning host thread.
    pub fn park(&self) {
        let mut st = self.state.lock().unwrap();
        while !st.resumed {
            st = self.cond.wait(st).unwrap();
        }
        st.resumed = false;
    }

    /// Marks the backing host thread as gone, waking any joiner.
    pub(crate) fn mark_exited(&self) {
        let mut st = self.state.lock().unwrap();
        st.exited = true;
        self.cond.notify_all();
    }

    /// Blocks the *calling host thread* (not a kernel suspension point)
    /// until the owning thread exits, or until `timeout`. Returns whether
    /// the exit was observed. Harness-side observability hook.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        while !st.exited {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
        }
        true
    }
}

std::thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = RefCell::new(None);
}

/// Installs `t` as the current thread of this host thread. Called once, at
/// the top of the thread cushion.
pub(crate) fn install_current(t: Arc<Thread>) {
    CURRENT.with(|c| {
        let prev = c.borrow_mut().replace(t);
        uassert!(prev.is_none(), "host thread already carries a kernel thread");
    });
}

/// Reads the current-thread register.
///
/// # Panics
///
/// If the calling host thread carries no kernel thread. Operations that can
/// suspend are only legal from thread context, so this is the moral
/// equivalent of dereferencing the CPU's current pointer in a real port.
pub fn current() -> Arc<Thread> {
    try_current().expect("kernel thread context required")
}

/// Reads the current-thread register, yielding `None` in interrupt context.
pub fn try_current() -> Option<Arc<Thread>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Saved interrupt priority level, returned by [`interrupts_disable`] and
/// consumed by [`interrupts_restore`]. Deliberately not `Clone`: each saved
/// level is restored exactly once.
#[must_use]
pub struct Ipl(());

/// Raises the IPL to mask interrupts.
///
/// Hosted, the maskable-interrupt part has no teeth -- other host threads
/// keep running -- so this pins the observable part of the contract: the
/// calling thread cannot be preempted off its CPU until the level is
/// restored.
pub fn interrupts_disable() -> Ipl {
    if let Some(t) = try_current() {
        t.preempt_disable();
    }
    Ipl(())
}

/// Restores the IPL saved by a matching [`interrupts_disable`].
pub fn interrupts_restore(_ipl: Ipl) {
    if let Some(t) = try_current() {
        t.preempt_enable();
    }
}

/// Full system memory barrier: no load or store moves across it.
pub fn memory_barrier() {
    fence(Ordering::SeqCst);
}

/// Barrier on entry to a critical section: later accesses stay below it.
pub fn cs_enter_barrier() {
    fence(Ordering::Acquire);
}

/// Barrier on exit from a critical section: earlier accesses stay above it.
pub fn cs_leave_barrier() {
    fence(Ordering::Release);
}

/// Per-CPU doorbell: where a real port would halt the core and wait for an
/// interrupt, the hosted backend blocks on a condition variable. Waking it
/// is also how inter-processor interrupts are modeled.
#[derive(Default)]
pub struct CpuGate {
    state: Mutex<bool>,
    cond: Condvar,
}

/// How long an idle CPU dozes before rechecking the world anyway. This is
/// the hosted stand-in for the periodic balancing interrupt: a core left
/// asleep still takes a look at its neighbors' queues at this cadence.
pub const IDLE_NAP: Duration = Duration::from_millis(10);

/// Puts the calling CPU to sleep until [`cpu_wake`], or for at most
/// [`IDLE_NAP`]. Only the idle thread does this.
pub fn cpu_sleep(gate: &CpuGate) {
    let mut pending = gate.state.lock().unwrap();
    if !*pending {
        let (guard, _) = gate
            .cond
            .wait_timeout(pending, IDLE_NAP)
            .unwrap();
        pending = guard;
    }
    *pending = false;
}

/// Rings a CPU's doorbell; its idle thread (if dozing) comes back to the
/// scheduler. This is the IPI of the hosted machine.
pub fn cpu_wake(gate: &CpuGate) {
    let mut pending = gate.state.lock().unwrap();
    *pending = true;
    gate.cond.notify_all();
}

/// Token thrown by [`exit_thread`] and fielded by the cushion.
struct ExitToken;

/// Terminates the calling kernel thread's execution immediately, as if its
/// entry function had returned. Control lands back in the cushion.
pub fn exit_thread() -> ! {
    std::panic::panic_any(ExitToken);
}

/// Runs a thread's entry function under a panic cushion.
///
/// Returns `None` for a normal return or an explicit [`exit_thread`], and
/// the panic message for anything else. A stray panic in thread code must
/// not take down the host process before the kernel has a chance to log it
/// and retire the thread.
pub(crate) fn run_entry(entry: impl FnOnce()) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => None,
        Err(payload) => {
            if payload.is::<ExitToken>() {
                None
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                Some(String::from(*s))
            } else if let Some(s) = payload.downcast_ref::<String>() {
                Some(s.clone())
            } else {
                Some(String::from("non-string panic payload"))
            }
        }
    }
}

/// Spawns the host thread that backs a kernel thread. The body is the
/// cushion provided by `proc::thread`. Failure maps to the kernel's
/// out-of-memory condition: the host would not give us a stack.
pub(crate) fn spawn_kernel_stack(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> Result<std::thread::JoinHandle<()>, ()> {
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|_| ())
}
