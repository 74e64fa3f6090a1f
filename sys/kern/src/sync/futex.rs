// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Futexes: the bridge from a userspace memory word to a kernel wait
//! queue.
//!
//! A futex is keyed by the *physical* address of its word, so threads (or
//! tasks) that map the same page at different virtual addresses contend on
//! the same object. The kernel keeps one global registry, reference
//! counted; each task additionally caches the futexes its threads have
//! touched and drops those references at teardown, which is when unused
//! futexes disappear.
//!
//! `futex_wait` re-reads the word under the futex's wait-queue lock; a
//! mismatch with the expected value fails with `Again` instead of
//! sleeping, and the wait-queue credit mechanism covers wakeups that land
//! in the remaining window before the sleep commits.

use alloc::sync::Arc;

use abi::ErrorCode;

use crate::kernel::Kernel;
use crate::proc::task::Task;
use crate::sync::atomic::Counter;
use crate::sync::waitq::{WaitFlags, WaitQueue, WakeMode};
use crate::umem::{self, PhysAddr};

/// Kernel object behind one userspace synchronization word.
pub struct Futex {
    pub(crate) key: PhysAddr,
    pub(crate) wq: WaitQueue,
    /// Owners: one per task caching this futex. The registry entry dies
    /// with the last owner.
    pub(crate) refs: Counter,
}

/// Resolves `uaddr` through `task`'s address space and returns the futex
/// for the backing physical word, creating and caching it on first use.
fn futex_get(
    k: &Kernel,
    task: &Arc<Task>,
    uaddr: u64,
) -> Result<Arc<Futex>, ErrorCode> {
    let phys = task
        .a_s
        .resolve(uaddr)
        .ok_or(ErrorCode::InvalidArgument)?;

    if let Some(f) = task.futex_cache.lock().get(&phys) {
        return Ok(Arc::clone(f));
    }
    let futex = k.futex_lookup_or_create(phys);
    // Two threads of one task can race to fill the cache; the loser must
    // not hold a second reference.
    let mut cache = task.futex_cache.lock();
    if let Some(existing) = cache.get(&phys) {
        let f = Arc::clone(existing);
        drop(cache);
        k.futex_release(&futex);
        Ok(f)
    } else {
        cache.insert(phys, Arc::clone(&futex));
        Ok(futex)
    }
}

/// Suspends the calling thread until the word at `uaddr` is signalled.
///
/// The word is re-read under the futex lock: if it no longer equals
/// `expected` the caller gets `Again` and should re-evaluate instead of
/// sleeping. `timeout_usec` follows wait-queue semantics (`None` forever).
/// The sleep is interruptible by task teardown.
pub fn futex_wait(
    k: &Kernel,
    task: &Arc<Task>,
    uaddr: u64,
    expected: u64,
    timeout_usec: Option<u64>,
) -> Result<(), ErrorCode> {
    let futex = futex_get(k, task, uaddr)?;
    let a_s = Arc::clone(&task.a_s);
    futex.wq.sleep_guarded(
        k,
        timeout_usec,
        WaitFlags::INTERRUPTIBLE,
        || {
            if umem::read_word(&*a_s, uaddr)? != expected {
                Err(ErrorCode::Again)
            } else {
                Ok(())
            }
        },
    )
}

/// Wakes up to `n` sleepers of the futex behind `uaddr`. Wakeups beyond
/// the sleeper count are banked as wait-queue credits, so a wake that
/// races ahead of its waiter is not lost. Returns the number of threads
/// actually readied.
pub fn futex_wake(
    k: &Kernel,
    task: &Arc<Task>,
    uaddr: u64,
    n: usize,
) -> Result<usize, ErrorCode> {
    let futex = futex_get(k, task, uaddr)?;
    let mut woken = 0;
    for _ in 0..n {
        woken += futex.wq.wake(k, WakeMode::One);
    }
    Ok(woken)
}
