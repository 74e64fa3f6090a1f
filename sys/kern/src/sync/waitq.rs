// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait queues: the FIFO sleep primitive under every blocking kernel path.
//!
//! A wait queue is a list of Sleeping threads plus a count of *missed
//! wakeups*: wake-one on an empty queue banks a credit, and the next sleep
//! consumes a credit instead of blocking. The credits are what make
//! check-then-sleep loops (answerbox receive, futex wait) immune to the
//! window between dropping the state lock and committing to sleep.
//!
//! Ending a sleep is a race among up to three parties -- a waker, the sleep
//! timeout, and an external interrupter -- and membership in the sleeper
//! list is the arbiter: all three take the queue lock, and whoever still
//! finds the thread in the list owns its wakeup. The losers see it gone (or
//! re-sleeping, by the sleep sequence number) and no-op, so a sleep yields
//! exactly one verdict.
//!
//! Wait queues have no owner; they are embedded in the object whose
//! condition they guard (answerbox, futex, call) and share its lifetime.
//! The handle is cheaply clonable so timeout handlers can hold the queue
//! without holding the enclosing object alive by themselves... which they
//! do anyway, transitively, and that is fine for the tick or two involved.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use abi::ErrorCode;

use crate::arch;
use crate::kernel::Kernel;
use crate::proc::sched;
use crate::proc::thread::{self, Thread, ThreadState};
use crate::sync::IrqSpinLock;
use crate::time;

bitflags::bitflags! {
    pub struct WaitFlags: u32 {
        /// Fail with `WouldBlock` instead of sleeping.
        const NON_BLOCKING = 1 << 0;
        /// The sleep may be ended externally with `Interrupted` status
        /// (task teardown does this).
        const INTERRUPTIBLE = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeMode {
    /// Wake the head sleeper, or bank a credit if there is none.
    One,
    /// Drain every sleeper; never banks credits.
    All,
}

#[derive(Default)]
struct WaitQueueInner {
    sleepers: VecDeque<Arc<Thread>>,
    missed_wakeups: u64,
}

struct Shared {
    inner: IrqSpinLock<WaitQueueInner>,
}

/// FIFO sleep primitive. Clones refer to the same queue.
#[derive(Clone)]
pub struct WaitQueue {
    shared: Arc<Shared>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        WaitQueue {
            shared: Arc::new(Shared {
                inner: IrqSpinLock::new(WaitQueueInner::default()),
            }),
        }
    }

    /// Identity comparison; used by wakeup arbitration to check that a
    /// thread still sleeps *here* and not in some later queue.
    pub(crate) fn same(&self, other: &WaitQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of banked wake-one credits.
    pub fn missed_wakeups(&self) -> u64 {
        self.shared.inner.lock().missed_wakeups
    }

    /// Number of threads currently asleep here.
    pub fn sleeper_count(&self) -> usize {
        self.shared.inner.lock().sleepers.len()
    }

    /// Puts the calling thread to sleep on this queue.
    ///
    /// `timeout_usec` of `None` sleeps until woken; `Some(0)` never
    /// blocks -- it consumes a credit if one is banked and otherwise
    /// reports `Timeout` without ever entering the scheduler.
    ///
    /// Returns `Ok` when woken by a waker (or by credit), `Err(Timeout)`
    /// when the timeout fired first, `Err(Interrupted)` when cancelled
    /// externally, `Err(WouldBlock)` for a failed non-blocking attempt.
    pub fn sleep(
        &self,
        k: &Kernel,
        timeout_usec: Option<u64>,
        flags: WaitFlags,
    ) -> Result<(), ErrorCode> {
        self.sleep_guarded(k, timeout_usec, flags, || Ok(()))
    }

    /// Like [`Self::sleep`], but runs `precheck` under the queue lock
    /// before anything else and gives up with its error if it fails. The
    /// futex layer uses this to re-validate the user word in the same
    /// critical section that commits to sleeping.
    pub fn sleep_guarded(
        &self,
        k: &Kernel,
        timeout_usec: Option<u64>,
        flags: WaitFlags,
        precheck: impl FnOnce() -> Result<(), ErrorCode>,
    ) -> Result<(), ErrorCode> {
        let thread = arch::current();
        let cpu_idx = thread
            .inner
            .lock()
            .cpu
            .expect("sleeping thread was never dispatched");

        let mut q = self.shared.inner.lock();
        precheck()?;
        if q.missed_wakeups > 0 {
            q.missed_wakeups -= 1;
            return Ok(());
        }
        if flags.contains(WaitFlags::NON_BLOCKING) {
            return Err(ErrorCode::WouldBlock);
        }
        if timeout_usec == Some(0) {
            return Err(ErrorCode::Timeout);
        }

        // Commit. Everything up to the unlock happens with the queue held,
        // so no waker or timeout can observe a half-asleep thread.
        let seq = {
            let mut ti = thread.inner.lock();
            uassert!(
                ti.state == ThreadState::Running,
                "only a Running thread can sleep"
            );
            ti.state = ThreadState::Sleeping;
            ti.sleep_queue = Some(self.clone());
            ti.sleep_interruptible = flags.contains(WaitFlags::INTERRUPTIBLE);
            ti.wake_reason = None;
            ti.sleep_seq += 1;
            ti.sleep_seq
        };
        q.sleepers.push_back(Arc::clone(&thread));
        if let Some(usec) = timeout_usec {
            let wq = self.clone();
            let sleeper = Arc::downgrade(&thread);
            let handle = time::timeout_register(
                k,
                cpu_idx,
                time::ticks_from_usec(usec),
                Box::new(move |k| timeout_fired(k, wq, sleeper, seq)),
            );
            thread.inner.lock().sleep_timeout = Some(handle);
        }
        drop(q);

        // From the moment the queue lock dropped, a waker may already be
        // redispatching us elsewhere; hand off the CPU without looking at
        // our own state again.
        sched::block_current(k, cpu_idx);

        // Running again; read the verdict the winner left us.
        let mut ti = thread.inner.lock();
        ti.sleep_timeout = None;
        ti.sleep_queue = None;
        match ti.wake_reason.take() {
            Some(verdict) => verdict,
            None => Ok(()),
        }
    }

    /// Wakes sleeper(s). Returns how many threads were actually readied.
    pub fn wake(&self, k: &Kernel, mode: WakeMode) -> usize {
        let mut woken = 0;
        loop {
            let mut q = self.shared.inner.lock();
            let Some(t) = q.sleepers.pop_front() else {
                if mode == WakeMode::One && woken == 0 {
                    q.missed_wakeups += 1;
                }
                return woken;
            };
            let pending_timeout = {
                let mut ti = t.inner.lock();
                ti.wake_reason = Some(Ok(()));
                ti.sleep_timeout.take()
            };
            drop(q);
            if let Some(h) = pending_timeout {
                // Losing this race is fine: the handler finds the thread
                // gone from the list and no-ops.
                time::timeout_unregister(k, &h);
            }
            thread::thread_ready(k, &t);
            woken += 1;
            if mode == WakeMode::One {
                return woken;
            }
        }
    }

    /// Ends `t`'s sleep on this queue with `Timeout` status. Registered as
    /// a timeout handler by `sleep_guarded`; `seq` identifies the exact
    /// sleep it belongs to.
    fn timeout_end_sleep(&self, k: &Kernel, t: &Arc<Thread>, seq: u64) {
        let mut q = self.shared.inner.lock();
        // List membership is the arbiter: a thread no longer in the list
        // has been claimed by a waker, even if its state transition is
        // still in flight.
        let Some(pos) = q.sleepers.iter().position(|s| Arc::ptr_eq(s, t))
        else {
            return;
        };
        {
            let mut ti = t.inner.lock();
            if ti.sleep_seq != seq {
                // The thread is back in this queue, but for a later sleep;
                // this timeout belongs to a sleep that already ended.
                return;
            }
            uassert!(ti.state == ThreadState::Sleeping);
            ti.wake_reason = Some(Err(ErrorCode::Timeout));
            ti.sleep_timeout = None;
        }
        q.sleepers.remove(pos);
        drop(q);
        thread::thread_ready(k, t);
    }
}

fn timeout_fired(
    k: &Kernel,
    wq: WaitQueue,
    sleeper: alloc::sync::Weak<Thread>,
    seq: u64,
) {
    if let Some(t) = sleeper.upgrade() {
        wq.timeout_end_sleep(k, &t, seq);
    }
}

/// Externally cancels `t`'s sleep, giving it `Interrupted` status. Only
/// interruptible sleeps are eligible. Returns whether the thread was
/// readied. Task teardown uses this to flush its threads out of whatever
/// they are blocked on.
pub fn interrupt(k: &Kernel, t: &Arc<Thread>) -> bool {
    loop {
        let Some(wq) = t.inner.lock().sleep_queue.clone() else {
            return false;
        };
        let mut q = wq.shared.inner.lock();
        let pos = q.sleepers.iter().position(|s| Arc::ptr_eq(s, t));
        let Some(pos) = pos else {
            // Not in the queue its back-pointer named: either a waker just
            // claimed it, or it has moved on to a different sleep. Look
            // again; the next read settles it.
            drop(q);
            if t.inner.lock().state != ThreadState::Sleeping {
                return false;
            }
            core::hint::spin_loop();
            continue;
        };
        let pending = {
            let mut ti = t.inner.lock();
            uassert!(ti.state == ThreadState::Sleeping);
            if !ti.sleep_interruptible {
                return false;
            }
            ti.wake_reason = Some(Err(ErrorCode::Interrupted));
            ti.sleep_timeout.take()
        };
        q.sleepers.remove(pos);
        drop(q);
        if let Some(h) = pending {
            time::timeout_unregister(k, &h);
        }
        thread::thread_ready(k, t);
        return true;
    }
}
