// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU state.
//!
//! One [`Cpu`] record per core, fixed at boot. Each carries its own ready
//! queues (one FIFO per priority class, each under its own lock), its own
//! timeout list, and the handful of counters the clock and scheduler
//! maintain. Cross-CPU traffic is limited to work stealing, which only ever
//! *try*-locks a remote queue.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use abi::{Priority, RQ_COUNT};

use crate::arch;
use crate::kernel::Kernel;
use crate::proc::thread::Thread;
use crate::sync::atomic::{AtomicFlag, Counter};
use crate::sync::IrqSpinLock;
use crate::time::TimeoutList;

/// A single priority class's FIFO of ready threads on one CPU.
#[derive(Default)]
pub(crate) struct RunQueue {
    pub(crate) queue: IrqSpinLock<VecDeque<Arc<Thread>>>,
}

/// Scheduler state of one CPU that changes together: the running thread,
/// the idle thread backing it up, and the aging credit.
#[derive(Default)]
pub(crate) struct CpuSched {
    pub current: Option<Arc<Thread>>,
    pub idle: Option<Arc<Thread>>,
    pub needs_relink: u64,
}

pub struct Cpu {
    pub id: usize,
    pub(crate) rq: [RunQueue; RQ_COUNT],
    pub(crate) sched: IrqSpinLock<CpuSched>,
    /// Pending timeouts; separate lock, per the locking order.
    pub(crate) timeouts: IrqSpinLock<TimeoutList>,
    /// Ready threads currently enqueued on this CPU.
    pub(crate) nrdy: Counter,
    /// Ticks that fired while this CPU had interrupts held off; consumed in
    /// a batch by the next `clock()` pass.
    pub(crate) missed_ticks: Counter,
    /// Ticks processed since boot.
    pub(crate) tick_count: Counter,
    /// Set by the clock when the running thread's slice is gone; honored at
    /// the next preemption point.
    pub(crate) preempt_request: AtomicFlag,
    /// Doorbell for waking the idle thread; doubles as the IPI target.
    pub(crate) gate: arch::CpuGate,
    /// Delay-loop calibration, in loops per tick. Consumers are the
    /// busy-wait paths of drivers, which live outside this crate; the boot
    /// code fills it in.
    pub delay_loop_const: u64,
    /// Nominal core frequency in MHz, also informational.
    pub frequency_mhz: u64,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Cpu {
            id,
            rq: core::array::from_fn(|_| RunQueue::default()),
            sched: Default::default(),
            timeouts: Default::default(),
            nrdy: Counter::new(0),
            missed_ticks: Counter::new(0),
            tick_count: Counter::new(0),
            preempt_request: AtomicFlag::new(),
            gate: Default::default(),
            delay_loop_const: 1,
            frequency_mhz: 1_000,
        }
    }

    /// Appends a Ready thread to this CPU's queue for `pri` and rings the
    /// doorbell. The thread's state transition happened under its own lock
    /// before we got here; queue membership is what makes it visible to the
    /// dispatcher.
    pub(crate) fn enqueue(&self, k: &Kernel, t: Arc<Thread>, pri: Priority) {
        self.rq[pri.0 as usize].queue.lock().push_back(t);
        self.nrdy.inc();
        k.nrdy.inc();
        arch::cpu_wake(&self.gate);
    }

    /// Pops the most important ready thread, scanning queues from priority
    /// 0 upward. Takes one queue lock at a time.
    pub(crate) fn pop_any(&self, k: &Kernel) -> Option<Arc<Thread>> {
        for rq in &self.rq {
            if let Some(t) = rq.queue.lock().pop_front() {
                self.nrdy.dec();
                k.nrdy.dec();
                return Some(t);
            }
        }
        None
    }

    /// Snapshot of the running thread.
    pub fn current(&self) -> Option<Arc<Thread>> {
        self.sched.lock().current.clone()
    }

    /// Ticks processed since boot.
    pub fn ticks(&self) -> u64 {
        self.tick_count.get() as u64
    }

    /// Records a timer tick that fired while this CPU had interrupts held
    /// off; the next `clock()` pass makes it up.
    pub fn note_missed_tick(&self) {
        self.missed_ticks.inc();
    }

    /// Count of threads parked in this CPU's ready queues.
    pub fn ready_count(&self) -> u64 {
        self.nrdy.get().max(0) as u64
    }
}
