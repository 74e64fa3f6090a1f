// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads: the scheduling entity.
//!
//! A thread is always in exactly one of five states, and its membership in
//! kernel structures follows from the state:
//!
//! ```text
//! [Entering] --ready--> [Ready] --dispatch--> [Running]
//!                          ^                     |
//!                          |                     +--block--> [Sleeping] --wake--+
//!                          +---------------------|-------------------------<---+
//!                                                +--exit---> [Exiting]
//! ```
//!
//! * `Ready` threads sit in exactly one CPU's ready queue.
//! * `Running` threads occupy exactly one CPU's current slot.
//! * `Sleeping` threads sit in exactly one wait queue, with `sleep_queue`
//!   pointing back at it.
//! * `Exiting` threads are retired after the final switch away from them;
//!   nothing may resurrect them.
//!
//! The state field lives behind the thread's lock, and every transition
//! happens under it.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use core::time::Duration;

use abi::{ErrorCode, Priority, ThreadId, THREAD_STACK_SIZE};

use crate::arch;
use crate::kernel::Kernel;
use crate::proc::sched;
use crate::proc::task::Task;
use crate::sync::atomic::{AtomicFlag, Counter};
use crate::sync::waitq::{WaitFlags, WaitQueue};
use crate::sync::IrqSpinLock;
use crate::time::TimeoutHandle;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Created but not yet made schedulable.
    Entering,
    /// In a ready queue, waiting for a CPU.
    Ready,
    /// Occupying a CPU.
    Running,
    /// Parked in a wait queue.
    Sleeping,
    /// On its way out; retired after the final context switch.
    Exiting,
}

bitflags::bitflags! {
    pub struct ThreadFlags: u32 {
        /// Taken from another CPU's queue by the load balancer.
        const STOLEN = 1 << 0;
        /// This is a CPU's idle thread: never enqueued, never migrated,
        /// dispatched only when its CPU has nothing better to do.
        const IDLE = 1 << 1;
    }
}

/// Entry function of a thread. Runs on the thread's own (simulated) kernel
/// stack; returning from it is equivalent to calling [`exit_current`].
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Lock-protected portion of a thread.
pub struct ThreadInner {
    pub state: ThreadState,
    pub priority: Priority,
    pub flags: ThreadFlags,
    /// CPU this thread last ran on (or is bound to); used as the affinity
    /// hint when it becomes ready.
    pub cpu: Option<usize>,
    /// Ticks left in the current slice.
    pub ticks: u64,
    /// Lifetime tick count, for accounting.
    pub total_ticks: u64,
    /// Back-pointer to the wait queue this thread sleeps in, when Sleeping.
    pub(crate) sleep_queue: Option<WaitQueue>,
    /// Bumped on every sleep; lets a stale timeout recognize that its sleep
    /// is long over.
    pub(crate) sleep_seq: u64,
    pub(crate) sleep_interruptible: bool,
    pub(crate) sleep_timeout: Option<TimeoutHandle>,
    /// Verdict left behind by whoever ended the sleep; read by the sleeper
    /// once it runs again. `None` means woken normally.
    pub(crate) wake_reason: Option<Result<(), ErrorCode>>,
    /// One-shot callback to run right after the next switch away from this
    /// thread, once its locks are quiescent.
    pub(crate) call_me: Option<Box<dyn FnOnce() + Send>>,
    /// Userspace thread-local-storage pointer, installed by `SYS_TLS_SET`
    /// and reinstated whenever the thread is dispatched.
    pub tls: u64,
}

pub struct Thread {
    id: ThreadId,
    pub(crate) kernel: alloc::sync::Weak<Kernel>,
    pub task: Arc<Task>,
    pub(crate) context: arch::Context,
    /// Wired threads may not migrate off the CPU they were bound to.
    /// Fixed at creation.
    pub wired: bool,
    /// Size of the (simulated) kernel stack backing this thread.
    pub stack_size: usize,
    /// Preemption-disable depth. Atomic rather than lock-protected because
    /// the clock inspects it from interrupt context.
    preempt: Counter,
    /// The thread has touched the FPU at least once.
    pub(crate) fpu_exists: AtomicFlag,
    /// CPU currently holding this thread's FPU context, or -1. While the
    /// context is live on a CPU the thread must not run anywhere else, so
    /// the balancer refuses to steal it.
    pub(crate) fpu_cpu: Counter,
    pub(crate) inner: IrqSpinLock<ThreadInner>,
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    pub fn total_ticks(&self) -> u64 {
        self.inner.lock().total_ticks
    }

    pub fn tls(&self) -> u64 {
        self.inner.lock().tls
    }

    /// CPU this thread last ran on (or is bound to), if any.
    pub fn last_cpu(&self) -> Option<usize> {
        self.inner.lock().cpu
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.inner.lock().flags.contains(ThreadFlags::IDLE)
    }

    pub(crate) fn preempt_disable(&self) {
        self.preempt.inc();
    }

    pub(crate) fn preempt_enable(&self) {
        let d = self.preempt.dec();
        uassert!(d >= 0, "preemption-disable depth underflow");
    }

    pub fn preemption_disabled(&self) -> bool {
        self.preempt.get() > 0
    }

    /// Marks the calling thread as an FPU user and pins its floating-point
    /// context to the CPU it is running on. The balancer will leave it
    /// alone until the context moves with it.
    pub fn use_fpu(&self) {
        self.fpu_exists.test_and_set();
        if let Some(c) = self.inner.lock().cpu {
            self.fpu_cpu.set(c as i64);
        }
    }

    /// Blocks the *calling host thread* until this thread exits. This is a
    /// harness-side observability hook of the hosted machine, not a kernel
    /// suspension point.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        self.context.wait_exited(timeout)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Creates a thread in `task`, in state `Entering`. The thread does not run
/// until [`thread_ready`] makes it schedulable.
pub fn thread_create(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    name: &str,
    priority: Priority,
    entry: ThreadEntry,
) -> Result<Arc<Thread>, ErrorCode> {
    create_bound(k, task, name, priority, None, false, entry)
}

/// Full-control creation path shared with boot: optionally wires the thread
/// to a CPU and/or marks it as that CPU's idle thread.
pub(crate) fn create_bound(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    name: &str,
    priority: Priority,
    wired_cpu: Option<usize>,
    idle: bool,
    entry: ThreadEntry,
) -> Result<Arc<Thread>, ErrorCode> {
    let id = ThreadId(k.next_thread_id.inc() as u64);
    let mut flags = ThreadFlags::empty();
    if idle {
        flags |= ThreadFlags::IDLE;
    }
    let t = Arc::new(Thread {
        id,
        kernel: Arc::downgrade(k),
        task: Arc::clone(task),
        context: arch::Context::default(),
        wired: wired_cpu.is_some(),
        stack_size: THREAD_STACK_SIZE,
        preempt: Counter::new(0),
        fpu_exists: AtomicFlag::new(),
        fpu_cpu: Counter::new(-1),
        inner: IrqSpinLock::new(ThreadInner {
            state: ThreadState::Entering,
            priority,
            flags,
            cpu: wired_cpu,
            ticks: 0,
            total_ticks: 0,
            sleep_queue: None,
            sleep_seq: 0,
            sleep_interruptible: false,
            sleep_timeout: None,
            wake_reason: None,
            call_me: None,
            tls: 0,
        }),
    });

    task.note_thread_created(&t)?;
    k.register_thread(&t);

    let t2 = Arc::clone(&t);
    let spawned = arch::spawn_kernel_stack(
        format!("{} (t{})", name, id.0),
        move || cushion(t2, entry),
    );
    if spawned.is_err() {
        task.forget_thread(&t);
        k.unregister_thread(t.id());
        return Err(ErrorCode::NoMemory);
    }
    log::trace!("created thread {} '{}' in task {:?}", id.0, name, task.id());
    Ok(t)
}

/// The cushion every thread starts its life in: it installs the
/// current-thread register, waits to be dispatched for the first time, runs
/// the entry function, and falls into the exit path. Having a common
/// landing pad under every entry function is what lets `thread_create`
/// build threads whose "saved program counter" is ordinary portable code.
fn cushion(t: Arc<Thread>, entry: ThreadEntry) {
    arch::install_current(Arc::clone(&t));
    t.context.park();
    if let Some(panic_msg) = arch::run_entry(entry) {
        log::error!("thread {} panicked: {}", t.id().0, panic_msg);
    }
    if let Some(k) = t.kernel.upgrade() {
        finish_exit(&k, &t);
    }
    t.context.mark_exited();
}

/// Terminates the calling thread immediately. The common case -- the entry
/// function simply returning -- takes the same path without calling this.
pub fn exit_current() -> ! {
    arch::exit_thread()
}

/// Exit path run by the cushion: switches away for the last time, then
/// retires the thread.
fn finish_exit(k: &Kernel, t: &Arc<Thread>) {
    t.inner.lock().state = ThreadState::Exiting;
    // Hands the CPU to a successor and returns without parking, because
    // nothing will ever dispatch us again.
    sched::schedule(k);
    t.task.note_thread_exited(k);
    k.unregister_thread(t.id());
    log::trace!("thread {} exited", t.id().0);
}

/// Makes `t` schedulable: transitions `Entering` or a freshly woken thread
/// to `Ready` and appends it to a CPU's ready queue at its priority.
///
/// Target CPU policy: a wired thread goes to its bound CPU; a thread whose
/// FPU context is engaged on some CPU goes back there; otherwise the thread
/// returns to the CPU it last ran on, and a thread with no history is dealt
/// round-robin.
pub fn thread_ready(k: &Kernel, t: &Arc<Thread>) {
    let (pri, preferred) = {
        let mut ti = t.inner.lock();
        uassert!(
            matches!(ti.state, ThreadState::Entering | ThreadState::Sleeping),
            "thread_ready on a thread that is not Entering or Sleeping"
        );
        ti.state = ThreadState::Ready;
        ti.sleep_queue = None;
        ti.sleep_interruptible = false;
        let engaged = t.fpu_cpu.get();
        let preferred = if t.wired {
            Some(ti.cpu.expect("wired thread without a CPU"))
        } else if engaged >= 0 {
            Some(engaged as usize)
        } else {
            ti.cpu
        };
        (ti.priority, preferred)
    };
    let target = preferred
        .unwrap_or_else(|| k.next_ready_cpu.postinc() as usize % k.cpus.len());
    uassert!(target < k.cpus.len());
    t.inner.lock().cpu = Some(target);
    k.cpus[target].enqueue(k, Arc::clone(t), pri);
}

/// Suspends the calling thread for at least `usec` microseconds, by
/// sleeping on a throwaway wait queue that nobody will ever signal.
pub fn thread_usleep(k: &Kernel, usec: u64) {
    let wq = WaitQueue::new();
    match wq.sleep(k, Some(usec.max(1)), WaitFlags::empty()) {
        Err(ErrorCode::Timeout) => (),
        other => uassert!(
            other.is_err(),
            "private sleep queue woke without a waker"
        ),
    }
}

/// Suspends the calling thread for at least `sec` seconds.
pub fn thread_sleep(k: &Kernel, sec: u64) {
    thread_usleep(k, sec * 1_000_000);
}

/// Arms `f` to run right after the next context switch away from the
/// calling thread, once the thread's locks are no longer held. Used for
/// cleanup that must not run in the thread's own locked context.
///
/// # Panics
///
/// If a callback is already armed; the slot is single-occupancy.
pub fn thread_register_call_me(f: Box<dyn FnOnce() + Send>) {
    let t = arch::current();
    let prev = t.inner.lock().call_me.replace(f);
    uassert!(prev.is_none(), "call_me slot already armed");
}
