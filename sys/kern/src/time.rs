// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: timeout descriptors and the clock tick.
//!
//! Each CPU keeps its own timeout list under its own lock. The list stores
//! *deltas*: an entry's `ticks` field counts ticks remaining after its
//! predecessor fires, so the clock only ever decrements the head. Handlers
//! run with the list lock dropped, because a handler's whole job is usually
//! to go take wait-queue and thread locks.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::kernel::Kernel;

/// Ticks are the kernel's time unit; this converts from the microsecond
/// granularity of the public API, rounding up so a nonzero request never
/// becomes a zero-tick (i.e. already-expired) timeout.
pub fn ticks_from_usec(usec: u64) -> u64 {
    core::cmp::max(1, usec.div_ceil(abi::USEC_PER_TICK))
}

/// Handler invoked when a timeout expires. Runs on the host thread driving
/// the clock, outside every kernel lock.
pub type TimeoutFn = Box<dyn FnOnce(&Kernel) + Send>;

struct TimeoutEntry {
    id: u64,
    /// Ticks remaining after the predecessor entry fires.
    ticks: u64,
    handler: TimeoutFn,
}

/// Per-CPU pending-timeout list. Lives inside the CPU record behind an
/// interrupt-safe lock.
#[derive(Default)]
pub struct TimeoutList {
    next_id: u64,
    entries: VecDeque<TimeoutEntry>,
}

impl TimeoutList {
    /// Inserts a timeout `ticks` from now, keeping the delta encoding
    /// consistent. Returns the id used for cancellation.
    fn insert(&mut self, mut ticks: u64, handler: TimeoutFn) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let mut idx = 0;
        for e in self.entries.iter_mut() {
            if ticks <= e.ticks {
                e.ticks -= ticks;
                break;
            }
            ticks -= e.ticks;
            idx += 1;
        }
        self.entries.insert(
            idx,
            TimeoutEntry {
                id,
                ticks,
                handler,
            },
        );
        id
    }

    /// Removes a timeout by id, returning whether it was still pending. The
    /// removed entry's remaining ticks flow to its successor.
    fn remove(&mut self, id: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let e = self.entries.remove(pos).unwrap();
        if let Some(succ) = self.entries.get_mut(pos) {
            succ.ticks += e.ticks;
        }
        true
    }
}

/// Cancellation handle for a registered timeout.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    cpu: usize,
    id: u64,
}

/// Arms `handler` to fire on `cpu` after `ticks` clock ticks. A zero tick
/// count is treated as one: "now" is always the *next* tick.
pub fn timeout_register(
    k: &Kernel,
    cpu: usize,
    ticks: u64,
    handler: TimeoutFn,
) -> TimeoutHandle {
    let ticks = core::cmp::max(1, ticks);
    let id = k.cpus[cpu].timeouts.lock().insert(ticks, handler);
    TimeoutHandle { cpu, id }
}

/// Disarms a timeout. Returns `false` if it already fired (or was already
/// cancelled); callers treat that as "the handler won the race" and rely on
/// the handler's own no-op check.
pub fn timeout_unregister(k: &Kernel, h: &TimeoutHandle) -> bool {
    k.cpus[h.cpu].timeouts.lock().remove(h.id)
}

/// Clock routine, executed once per timer interrupt on `cpu` (interrupt
/// context; the calling host thread must not be a kernel thread).
///
/// Runs expired timeouts and drives preemptive scheduling: it charges the
/// running thread one tick, and when the thread's slice is gone and
/// preemption is permitted, flags the CPU for reschedule at the next
/// preemption point. Ticks missed while interrupts were held off are made
/// up here, one list pass per missed tick.
pub fn clock(k: &Kernel, cpu_idx: usize) {
    let cpu = &k.cpus[cpu_idx];

    let missed = cpu.missed_ticks.swap(0);
    uassert!(missed >= 0);
    for _ in 0..=missed {
        run_expired(k, cpu_idx);
        cpu.tick_count.inc();
    }

    // CPU usage accounting, priority-aging credit, and preemption.
    let current = cpu.sched.lock().current.clone();
    if let Some(t) = current {
        if !t.is_idle() {
            cpu.sched.lock().needs_relink += 1;
            let expired = {
                let mut ti = t.inner.lock();
                ti.total_ticks += 1;
                if ti.ticks > 0 {
                    ti.ticks -= 1;
                }
                ti.ticks == 0
            };
            if expired && !t.preemption_disabled() {
                cpu.preempt_request.test_and_set();
            }
        }
    }
}

/// One tick's worth of timeout-list processing: decrement the head, then
/// pop-and-run entries as long as the head sits at zero. The lock is
/// reacquired around each handler invocation.
fn run_expired(k: &Kernel, cpu_idx: usize) {
    let cpu = &k.cpus[cpu_idx];
    let mut decremented = false;
    loop {
        let mut tl = cpu.timeouts.lock();
        let Some(head) = tl.entries.front_mut() else {
            return;
        };
        if !decremented {
            if head.ticks > 0 {
                head.ticks -= 1;
            }
            decremented = true;
        }
        if head.ticks != 0 {
            return;
        }
        let e = tl.entries.pop_front().unwrap();
        drop(tl);
        (e.handler)(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop() -> TimeoutFn {
        Box::new(|_| {})
    }

    #[test]
    fn delta_insertion_orders_by_deadline() {
        let mut tl = TimeoutList::default();
        tl.insert(10, nop());
        tl.insert(3, nop());
        tl.insert(7, nop());
        let deltas: Vec<u64> = tl.entries.iter().map(|e| e.ticks).collect();
        // Absolute deadlines 3, 7, 10 encoded as deltas.
        assert_eq!(deltas, vec![3, 4, 3]);
    }

    #[test]
    fn removal_gives_ticks_to_successor() {
        let mut tl = TimeoutList::default();
        tl.insert(3, nop());
        let id = tl.insert(7, nop());
        tl.insert(10, nop());
        assert!(tl.remove(id));
        let deltas: Vec<u64> = tl.entries.iter().map(|e| e.ticks).collect();
        assert_eq!(deltas, vec![3, 7]);
        assert!(!tl.remove(id), "double cancel reports the race");
    }

    #[test]
    fn usec_conversion_rounds_up() {
        assert_eq!(ticks_from_usec(1), 1);
        assert_eq!(ticks_from_usec(abi::USEC_PER_TICK), 1);
        assert_eq!(ticks_from_usec(abi::USEC_PER_TICK + 1), 2);
        // Zero microseconds still lands on the next tick; "immediately" is
        // the caller's business, not the timer wheel's.
        assert_eq!(ticks_from_usec(0), 1);
    }
}
