// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! One scheduler instance per CPU, cooperating through work stealing. Each
//! CPU owns `RQ_COUNT` ready queues; smaller indices are more important.
//! Dispatch scans the local queues from 0 upward, falls back to stealing
//! from the neighbors, and finally to the CPU's idle thread.
//!
//! Three policies worth calling out:
//!
//! * **Time slices grow with importance**: `slice(p) = BASE × (1 + p_max −
//!   p)`. The handful of high-priority threads get long slices and
//!   responsive queues; bulk work gets short slices and cheap queues.
//! * **Exhausting a slice demotes**: a thread that burns its whole slice
//!   drops one priority class (bounded at the lowest real class).
//! * **Aging promotes**: every `NEEDS_RELINK_MAX` ticks a CPU shifts every
//!   queue up one class, so nothing starves forever.
//!
//! `schedule()` itself cannot be cancelled; thread cancellation is a wakeup
//! with `Interrupted` status, handled by the wait-queue layer.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use abi::{Priority, BASE_SLICE_TICKS, NEEDS_RELINK_MAX, RQ_COUNT};

use crate::arch;
use crate::kernel::Kernel;
use crate::proc::cpu::Cpu;
use crate::proc::thread::{self, Thread, ThreadFlags, ThreadState};

/// Length of the slice granted to a thread of priority `p`, in ticks.
pub(crate) fn timeslice(p: Priority) -> u64 {
    BASE_SLICE_TICKS * (1 + (RQ_COUNT as u64 - 1) - p.0 as u64)
}

/// Gives up the CPU voluntarily: requeues the caller (unless it is on its
/// way out), picks the next thread, and switches to it. Returns when the
/// caller is dispatched again -- except for `Exiting` callers, for which
/// it returns immediately after the handoff so the cushion can retire
/// them.
///
/// Threads that *block* do not come through here; they commit themselves
/// to a wait queue first and then call [`block_current`], because once a
/// thread is visible in a wait queue its state belongs to whoever wakes
/// it.
pub fn schedule(k: &Kernel) {
    let prev = arch::current();
    let cpu_idx = {
        let ti = prev.inner.lock();
        ti.cpu.expect("schedule() by a thread that never ran")
    };
    let cpu = &k.cpus[cpu_idx];

    let mut prev_exiting = false;
    {
        let mut ti = prev.inner.lock();
        match ti.state {
            ThreadState::Running => {
                // Voluntary yield or preemption: back into the queues. A
                // spent slice costs one priority class.
                ti.state = ThreadState::Ready;
                if ti.flags.contains(ThreadFlags::IDLE) {
                    // The idle thread never enters a queue; dispatch falls
                    // back to it by name.
                } else {
                    if ti.ticks == 0 {
                        ti.priority = ti.priority.demoted();
                    }
                    let pri = ti.priority;
                    drop(ti);
                    cpu.enqueue(k, Arc::clone(&prev), pri);
                }
            }
            ThreadState::Exiting => prev_exiting = true,
            // Sleeping/Ready threads must use block_current; Entering
            // threads have no business here at all.
            _ => panic!("schedule() without a scheduling intent"),
        }
    }

    switch_away(k, cpu, &prev, prev_exiting);
}

/// Hands off the CPU after the calling thread has already committed itself
/// to a wait queue. From that commit point on, a waker -- possibly on
/// another CPU -- may redispatch the thread at any moment, so this path
/// must not read or write the thread's scheduling state at all; it only
/// vacates `cpu_idx` (captured by the caller before the commit) and parks.
pub(crate) fn block_current(k: &Kernel, cpu_idx: usize) {
    let prev = arch::current();
    switch_away(k, &k.cpus[cpu_idx], &prev, false);
}

fn switch_away(k: &Kernel, cpu: &Cpu, prev: &Arc<Thread>, prev_exiting: bool) {
    maybe_relink(cpu);
    let next = find_next(k, cpu);
    dispatch(k, cpu, prev, next, prev_exiting);
}

/// Reschedules if the clock has asked for it and the current thread is
/// preemptible. The preemption points of the kernel: syscall exit and
/// explicit calls from long-running thread code.
pub fn preempt_point(k: &Kernel) {
    let Some(t) = arch::try_current() else {
        return;
    };
    if t.preemption_disabled() {
        return;
    }
    let Some(cpu_idx) = t.inner.lock().cpu else {
        return;
    };
    if k.cpus[cpu_idx].preempt_request.take() {
        schedule(k);
    }
}

/// Selects the next thread for `cpu`: local queues, then the balancer,
/// then the idle thread. `None` only during shutdown, once the idle thread
/// itself is gone.
fn find_next(k: &Kernel, cpu: &Cpu) -> Option<Arc<Thread>> {
    if let Some(t) = cpu.pop_any(k) {
        return Some(t);
    }
    if balance(k, cpu) > 0 {
        if let Some(t) = cpu.pop_any(k) {
            return Some(t);
        }
    }
    let idle = cpu.sched.lock().idle.clone()?;
    if idle.state() == ThreadState::Exiting {
        None
    } else {
        Some(idle)
    }
}

/// Load balancer. Runs when a CPU's queues are all empty: walk the other
/// CPUs outward from our own id, and from each take at most one eligible
/// thread, stopping once we've moved a fair share. Remote queues are only
/// try-locked; contention means "somebody else is busy here, move on", not
/// "wait".
///
/// Not eligible: wired threads, threads whose FPU context is engaged on
/// some CPU, and anything in the idle class.
fn balance(k: &Kernel, cpu: &Cpu) -> usize {
    let total = k.nrdy.get();
    if total <= 0 {
        return 0;
    }
    let target = core::cmp::max(1, total as usize / k.cpus.len() / 2);
    let n = k.cpus.len();
    let mut stolen = 0;

    for off in 1..n {
        let remote = &k.cpus[(cpu.id + off) % n];
        if remote.nrdy.get() <= 0 {
            continue;
        }
        'remote: for q in 0..RQ_COUNT - 1 {
            let Some(mut rq) = remote.rq[q].queue.try_lock() else {
                continue;
            };
            let pos = rq
                .iter()
                .position(|t| !t.wired && t.fpu_cpu.get() < 0);
            if let Some(pos) = pos {
                let t = rq.remove(pos).unwrap();
                drop(rq);
                remote.nrdy.dec();
                k.nrdy.dec();
                {
                    let mut ti = t.inner.lock();
                    ti.flags |= ThreadFlags::STOLEN;
                    ti.cpu = Some(cpu.id);
                }
                cpu.enqueue(k, t, Priority(q as u8));
                stolen += 1;
                break 'remote;
            }
        }
        if stolen >= target {
            break;
        }
    }
    if stolen > 0 {
        log::trace!("cpu{} stole {} thread(s)", cpu.id, stolen);
    }
    stolen
}

/// Priority aging: once enough ticks have accumulated, shift every queue up
/// one class so long-parked threads creep toward the front. Queue index and
/// thread priority move together.
fn maybe_relink(cpu: &Cpu) {
    let due = {
        let mut s = cpu.sched.lock();
        if s.needs_relink >= NEEDS_RELINK_MAX {
            s.needs_relink = 0;
            true
        } else {
            false
        }
    };
    if !due {
        return;
    }
    for q in 1..RQ_COUNT - 1 {
        let moved: Vec<Arc<Thread>> = {
            let mut g = cpu.rq[q].queue.lock();
            g.drain(..).collect()
        };
        for t in moved {
            t.inner.lock().priority = Priority((q - 1) as u8);
            cpu.rq[q - 1].queue.lock().push_back(t);
        }
    }
}

/// Architecture hook invoked just before `t` starts running: re-engage the
/// FPU context on this CPU (lazy FPU switching) and reinstate the thread's
/// TLS pointer. Hosted, both reduce to bookkeeping; the decisions they
/// record still steer migration.
fn before_thread_runs(cpu: &Cpu, t: &Arc<Thread>) {
    if t.fpu_exists.is_set() {
        t.fpu_cpu.set(cpu.id as i64);
    }
}

/// The context switch. Updates the chosen thread to Running, points the
/// CPU's current slot at it, resumes its context, and parks the outgoing
/// one. The outgoing thread's `call_me` callback runs between the two, on
/// the way down, with no locks held.
fn dispatch(
    k: &Kernel,
    cpu: &Cpu,
    prev: &Arc<Thread>,
    next: Option<Arc<Thread>>,
    prev_exiting: bool,
) {
    let Some(next) = next else {
        // Shutdown tail: nothing runnable and no idle thread left.
        cpu.sched.lock().current = None;
        if !prev_exiting {
            prev.context.park();
        }
        return;
    };

    if Arc::ptr_eq(prev, &next) {
        // Nothing better to do than what we were doing. This also covers
        // the sleep/wake photo finish where a waker requeued us on our own
        // CPU before we ever left it.
        uassert!(!prev_exiting);
        {
            let mut ti = prev.inner.lock();
            ti.state = ThreadState::Running;
            if ti.ticks == 0 {
                ti.ticks = timeslice(ti.priority);
            }
        }
        // The scheduler epilogue runs even when the same thread is
        // re-selected, so an armed callback still fires.
        let callback = prev.inner.lock().call_me.take();
        if let Some(cb) = callback {
            cb();
        }
        return;
    }

    {
        let mut ni = next.inner.lock();
        uassert!(
            ni.state == ThreadState::Ready,
            "dispatching a thread that is not Ready"
        );
        ni.state = ThreadState::Running;
        ni.cpu = Some(cpu.id);
        ni.flags.remove(ThreadFlags::STOLEN);
        ni.ticks = timeslice(ni.priority);
    }
    cpu.sched.lock().current = Some(Arc::clone(&next));
    before_thread_runs(cpu, &next);
    log::trace!(
        "cpu{}: switch t{} -> t{}",
        cpu.id,
        prev.id().0,
        next.id().0
    );

    next.context.resume();

    // We are logically off the CPU now; run the deferred callback.
    let callback = prev.inner.lock().call_me.take();
    if let Some(cb) = callback {
        cb();
    }

    if prev_exiting {
        // Never coming back; the cushion finishes the funeral.
        return;
    }
    prev.context.park();
    // Dispatched again, possibly on a different CPU.
}

/// Creates and immediately installs the idle thread for `cpu_idx`: wired,
/// lowest class, initially Running as the CPU's first current thread. Its
/// body alternates between offering the CPU to real work and dozing on the
/// CPU gate.
pub(crate) fn spawn_idle(
    k: &Arc<Kernel>,
    cpu_idx: usize,
) -> Result<Arc<Thread>, abi::ErrorCode> {
    let kw = Arc::downgrade(k);
    let kernel_task = k.kernel_task();
    let t = thread::create_bound(
        k,
        &kernel_task,
        "idle",
        Priority::IDLE,
        Some(cpu_idx),
        true,
        alloc::boxed::Box::new(move || idle_loop(kw)),
    )?;
    {
        let mut ti = t.inner.lock();
        ti.state = ThreadState::Running;
        ti.ticks = timeslice(Priority::IDLE);
    }
    {
        let mut s = k.cpus[cpu_idx].sched.lock();
        s.idle = Some(Arc::clone(&t));
        s.current = Some(Arc::clone(&t));
    }
    t.context.resume();
    Ok(t)
}

fn idle_loop(kw: Weak<Kernel>) {
    loop {
        let Some(k) = kw.upgrade() else { return };
        if k.is_shutting_down() {
            return;
        }
        schedule(&k);
        let cpu_idx = arch::current()
            .inner
            .lock()
            .cpu
            .expect("idle thread without a CPU");
        arch::cpu_sleep(&k.cpus[cpu_idx].gate);
    }
}
