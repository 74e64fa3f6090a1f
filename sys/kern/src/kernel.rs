// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel environment.
//!
//! Classically, the CPU array, the all-tasks registry, and their friends
//! are file-scope globals initialized at boot. Here they live in one
//! [`Kernel`] struct passed explicitly, which keeps every test (and, one
//! day, every machine partition) in its own fully independent kernel
//! instance. Per-CPU state hangs off [`Kernel::cpus`]; the current-CPU
//! pointer of a real port is the current thread's `cpu` field.
//!
//! External inputs are injected at boot: the device register space for IRQ
//! programs, the console sink for `SYS_IO`, and the user-entry hook that
//! stands in for a real port's return-to-userspace. The clock tick and
//! interrupt delivery are the two entry points the outside world calls in.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use abi::{CapSet, TaskId, ThreadId};

use crate::arch;
use crate::ipc::irq::{IoSpace, IrqHandler, NullIo};
use crate::proc::cpu::Cpu;
use crate::proc::task::{self, Task};
use crate::proc::thread::Thread;
use crate::proc::sched;
use crate::sync::atomic::{AtomicFlag, Counter};
use crate::sync::futex::Futex;
use crate::sync::waitq::WaitQueue;
use crate::sync::IrqSpinLock;
use crate::time;
use crate::umem::{KernelSpace, PhysAddr};

/// Console sink: where `SYS_IO` bytes go.
pub type ConsoleSink = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Stand-in for returning to userspace: `SYS_THREAD_CREATE` hands the new
/// thread's entry point and argument to this hook.
pub type UserEntryHook = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Boot-time configuration.
pub struct BootArgs {
    pub cpus: usize,
    /// Device register space for IRQ pseudocode programs.
    pub io: Box<dyn IoSpace>,
    pub console: ConsoleSink,
    pub user_entry: UserEntryHook,
}

impl Default for BootArgs {
    fn default() -> Self {
        BootArgs {
            cpus: 1,
            io: Box::new(NullIo),
            console: Box::new(|bytes| {
                log::debug!("console: {}", String::from_utf8_lossy(bytes));
            }),
            user_entry: Box::new(|entry, _uarg| {
                log::debug!("no user-entry hook for pc {:#x}", entry);
            }),
        }
    }
}

pub struct Kernel {
    pub cpus: Box<[Cpu]>,
    /// Ready threads across all CPUs; feeds the balancer's fair-share
    /// arithmetic.
    pub(crate) nrdy: Counter,
    pub(crate) next_thread_id: Counter,
    pub(crate) next_task_id: Counter,
    pub(crate) next_call_id: Counter,
    /// Round-robin cursor for placing threads with no CPU history.
    pub(crate) next_ready_cpu: Counter,
    /// All threads, weakly: enumeration only, never lifetime.
    threads: IrqSpinLock<BTreeMap<ThreadId, Weak<Thread>>>,
    /// All tasks, weakly.
    tasks: IrqSpinLock<BTreeMap<TaskId, Weak<Task>>>,
    /// Interrupt number -> registered handler program.
    pub(crate) irqs: IrqSpinLock<BTreeMap<u32, Arc<IrqHandler>>>,
    /// Global futex registry, keyed by physical address.
    futexes: IrqSpinLock<BTreeMap<PhysAddr, Arc<Futex>>>,
    io: Box<dyn IoSpace>,
    console: ConsoleSink,
    user_entry: UserEntryHook,
    kernel_task: IrqSpinLock<Option<Arc<Task>>>,
    idles: IrqSpinLock<Vec<Arc<Thread>>>,
    shutting_down: AtomicFlag,
}

impl Kernel {
    /// Boots a kernel: builds the CPU records, creates the kernel task,
    /// and installs one idle thread per CPU as its initial current thread.
    pub fn boot(args: BootArgs) -> Arc<Kernel> {
        let ncpus = args.cpus.max(1);
        let k = Arc::new(Kernel {
            cpus: (0..ncpus).map(Cpu::new).collect(),
            nrdy: Counter::new(0),
            next_thread_id: Counter::new(0),
            next_task_id: Counter::new(0),
            next_call_id: Counter::new(0),
            next_ready_cpu: Counter::new(0),
            threads: IrqSpinLock::new(BTreeMap::new()),
            tasks: IrqSpinLock::new(BTreeMap::new()),
            irqs: IrqSpinLock::new(BTreeMap::new()),
            futexes: IrqSpinLock::new(BTreeMap::new()),
            io: args.io,
            console: args.console,
            user_entry: args.user_entry,
            kernel_task: IrqSpinLock::new(None),
            idles: IrqSpinLock::new(Vec::new()),
            shutting_down: AtomicFlag::new(),
        });

        let ktask =
            task::task_create(&k, Arc::new(KernelSpace), "kernel", CapSet::all());
        *k.kernel_task.lock() = Some(ktask);

        for i in 0..ncpus {
            let idle =
                sched::spawn_idle(&k, i).expect("boot: cannot start idle thread");
            k.idles.lock().push(idle);
        }
        log::info!("kernel up, {} cpu(s)", ncpus);
        k
    }

    /// The task kernel-internal threads (idle and friends) belong to.
    pub fn kernel_task(&self) -> Arc<Task> {
        self.kernel_task
            .lock()
            .clone()
            .expect("kernel task queried before boot finished")
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Total ready threads across all CPUs.
    pub fn ready_total(&self) -> i64 {
        self.nrdy.get()
    }

    /// Ticks seen by CPU 0; the closest thing to a system uptime.
    pub fn uptime_ticks(&self) -> u64 {
        self.cpus[0].ticks()
    }

    // ---- external inputs ----

    /// Timer interrupt for one CPU. Must be called from interrupt context
    /// (a host thread that is not a kernel thread).
    pub fn clock_tick(&self, cpu: usize) {
        uassert!(
            arch::try_current().is_none(),
            "clock_tick from thread context"
        );
        time::clock(self, cpu);
    }

    /// Timer interrupt for every CPU, in id order. Harness convenience.
    pub fn tick_all(&self) {
        for i in 0..self.cpus.len() {
            self.clock_tick(i);
        }
    }

    /// Hardware interrupt `inr`. Returns whether a registered program
    /// accepted it.
    pub fn irq(&self, inr: u32) -> bool {
        uassert!(arch::try_current().is_none(), "irq from thread context");
        crate::ipc::irq::dispatch(self, inr)
    }

    /// Begins an orderly stop: idle threads exit their loops and the CPUs
    /// wind down. Meaningful once the workload has quiesced; threads still
    /// blocked at this point stay blocked forever.
    pub fn shutdown(&self) {
        self.shutting_down.test_and_set();
        for cpu in self.cpus.iter() {
            arch::cpu_wake(&cpu.gate);
        }
        let idles: Vec<Arc<Thread>> = self.idles.lock().clone();
        for idle in idles {
            idle.wait_exited(core::time::Duration::from_secs(5));
        }
        log::info!("kernel down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.is_set()
    }

    // ---- injected collaborators ----

    pub(crate) fn io(&self) -> &dyn IoSpace {
        &*self.io
    }

    pub(crate) fn console_write(&self, bytes: &[u8]) {
        (self.console)(bytes)
    }

    pub(crate) fn user_dispatch(&self, entry: u64, uarg: u64) {
        (self.user_entry)(entry, uarg)
    }

    // ---- registries ----

    pub(crate) fn register_thread(&self, t: &Arc<Thread>) {
        self.threads.lock().insert(t.id(), Arc::downgrade(t));
    }

    pub(crate) fn unregister_thread(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
    }

    pub fn thread_find(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lock().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn register_task(&self, t: &Arc<Task>) {
        self.tasks.lock().insert(t.id(), Arc::downgrade(t));
    }

    pub(crate) fn unregister_task(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
    }

    /// Weak lookup by id; monotonic ids mean a hit is never a lookalike.
    pub fn task_find(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().get(&id).and_then(Weak::upgrade)
    }

    // ---- futex registry ----

    /// Finds or creates the futex for `phys`, taking one owner reference
    /// either way.
    pub(crate) fn futex_lookup_or_create(&self, phys: PhysAddr) -> Arc<Futex> {
        let mut futexes = self.futexes.lock();
        if let Some(f) = futexes.get(&phys) {
            f.refs.inc();
            return Arc::clone(f);
        }
        let f = Arc::new(Futex {
            key: phys,
            wq: WaitQueue::new(),
            refs: Counter::new(1),
        });
        futexes.insert(phys, Arc::clone(&f));
        f
    }

    /// Drops one owner reference; the last one out removes the registry
    /// entry.
    pub(crate) fn futex_release(&self, f: &Arc<Futex>) {
        if f.refs.dec() > 0 {
            return;
        }
        let mut futexes = self.futexes.lock();
        // Recheck under the lock; a racing lookup may have revived it.
        if f.refs.get() == 0 {
            if let Some(cur) = futexes.get(&f.key) {
                if Arc::ptr_eq(cur, f) {
                    futexes.remove(&f.key);
                }
            }
        }
    }

    /// Number of live entries in the futex registry; test observability.
    pub fn futex_count(&self) -> usize {
        self.futexes.lock().len()
    }
}
