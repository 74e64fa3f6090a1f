// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks: the protection and accounting container around threads.
//!
//! A task owns an address-space handle (opaque to this crate), a capability
//! word, a phone table, exactly one answerbox, and a cache of the futexes
//! its threads touched. Task teardown is asynchronous by design: `kill`
//! only marks the task dying and flushes its threads out of their sleeps;
//! the final cleanup -- hanging up phones, auto-answering everything left
//! in the answerbox -- runs when the last thread is gone.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use abi::{CapSet, ErrorCode, TaskId, IPC_MAX_PHONES};

use crate::ipc::{self, Answerbox, Phone};
use crate::kernel::Kernel;
use crate::proc::thread::Thread;
use crate::sync::atomic::Counter;
use crate::sync::futex::Futex;
use crate::sync::{waitq, IrqSpinLock};
use crate::umem::{AddressSpace, PhysAddr};

struct TaskInner {
    threads: Vec<Weak<Thread>>,
    dying: bool,
    torn_down: bool,
}

pub struct Task {
    id: TaskId,
    name: String,
    /// Address-space handle; the core delegates all user-memory work here.
    pub a_s: Arc<dyn AddressSpace>,
    caps: IrqSpinLock<CapSet>,
    /// The task's one and only server endpoint.
    pub answerbox: Arc<Answerbox>,
    /// Client endpoints, a fixed table of slots.
    pub(crate) phones: [Phone; IPC_MAX_PHONES],
    /// Futexes this task's threads have used, held alive for them.
    pub(crate) futex_cache:
        IrqSpinLock<alloc::collections::BTreeMap<PhysAddr, Arc<Futex>>>,
    inner: IrqSpinLock<TaskInner>,
    /// Threads attached and not yet exited.
    alive: Counter,
}

/// Creates a task with no threads. It starts participating in scheduling
/// when its first thread is readied.
pub fn task_create(
    k: &Arc<Kernel>,
    a_s: Arc<dyn AddressSpace>,
    name: &str,
    caps: CapSet,
) -> Arc<Task> {
    let id = TaskId(k.next_task_id.inc() as u64);
    let task = Arc::new_cyclic(|weak: &Weak<Task>| Task {
        id,
        name: String::from(name),
        a_s,
        caps: IrqSpinLock::new(caps),
        answerbox: Arc::new(Answerbox::new(weak.clone())),
        phones: core::array::from_fn(|_| Phone::default()),
        futex_cache: IrqSpinLock::new(Default::default()),
        inner: IrqSpinLock::new(TaskInner {
            threads: Vec::new(),
            dying: false,
            torn_down: false,
        }),
        alive: Counter::new(0),
    });
    k.register_task(&task);
    log::debug!("created task {} '{}'", id.0, name);
    task
}

/// Marks `task` for teardown: hangs up its phones, kicks its threads out of
/// interruptible sleeps with `Interrupted` status, and -- once no thread
/// remains -- performs the final answerbox cleanup.
pub fn task_destroy(k: &Kernel, task: &Arc<Task>) {
    {
        let mut inner = task.inner.lock();
        if inner.dying {
            return;
        }
        inner.dying = true;
    }
    log::debug!("task {} '{}' dying", task.id.0, task.name);

    for slot in 0..IPC_MAX_PHONES {
        // Best effort; unconnected slots just decline.
        let _ = ipc::hangup(k, task, slot);
    }
    for t in task.threads() {
        waitq::interrupt(k, &t);
    }
    if task.alive.get() == 0 {
        task.finish_teardown(k);
    }
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caps(&self) -> CapSet {
        *self.caps.lock()
    }

    pub fn has_cap(&self, cap: CapSet) -> bool {
        self.caps.lock().contains(cap)
    }

    pub fn grant_cap(&self, cap: CapSet) {
        self.caps.lock().insert(cap);
    }

    pub fn revoke_cap(&self, cap: CapSet) {
        self.caps.lock().remove(cap);
    }

    pub fn is_dying(&self) -> bool {
        self.inner.lock().dying
    }

    /// Live threads of this task. The task holds only weak references; the
    /// scheduler structures own the threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner
            .lock()
            .threads
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn note_thread_created(
        &self,
        t: &Arc<Thread>,
    ) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock();
        if inner.dying {
            return Err(ErrorCode::InvalidArgument);
        }
        inner.threads.push(Arc::downgrade(t));
        self.alive.inc();
        Ok(())
    }

    /// Rolls back `note_thread_created` when thread creation fails late.
    pub(crate) fn forget_thread(&self, t: &Arc<Thread>) {
        let mut inner = self.inner.lock();
        inner
            .threads
            .retain(|w| !w.upgrade().is_some_and(|x| Arc::ptr_eq(&x, t)));
        self.alive.dec();
    }

    /// Called from the exit path of each member thread. The task of the
    /// last one out is torn down: a task does not survive its threads.
    pub(crate) fn note_thread_exited(&self, k: &Kernel) {
        let remaining = self.alive.dec();
        uassert!(remaining >= 0);
        if remaining == 0 {
            self.inner.lock().dying = true;
            self.finish_teardown(k);
        }
    }

    /// Final, idempotent step of teardown: drain and auto-answer the
    /// answerbox, release futex references, unregister.
    pub(crate) fn finish_teardown(&self, k: &Kernel) {
        {
            let mut inner = self.inner.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
        }
        ipc::cleanup_answerbox(k, &self.answerbox);
        ipc::irq::unregister_all(k, self.id);
        let cached: Vec<Arc<Futex>> = {
            let mut cache = self.futex_cache.lock();
            let v = cache.values().cloned().collect();
            cache.clear();
            v
        };
        for f in cached {
            k.futex_release(&f);
        }
        k.unregister_task(self.id);
        log::debug!("task {} '{}' torn down", self.id.0, self.name);
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .finish()
    }
}
