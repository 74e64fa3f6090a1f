// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness bits for the kernel test suites: booting, task and
//! thread shorthand, and a background clock driver.

#![allow(dead_code)] // not every suite uses every helper

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use abi::{CapSet, Priority};
use kern::kernel::{BootArgs, Kernel};
use kern::proc::task::{self, Task};
use kern::proc::thread::{self, Thread};
use kern::umem;

/// Default patience for cross-thread observations. Generous because CI
/// machines are slow and wrong answers are worse than slow tests.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn boot(cpus: usize) -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::boot(BootArgs {
        cpus,
        ..BootArgs::default()
    })
}

/// A task with a small flat address space mapped at `0x1000`.
pub fn user_task(k: &Arc<Kernel>, name: &str) -> Arc<Task> {
    user_task_with_caps(k, name, CapSet::empty())
}

pub fn user_task_with_caps(
    k: &Arc<Kernel>,
    name: &str,
    caps: CapSet,
) -> Arc<Task> {
    task::task_create(k, umem::flat_space(0x1000, 0x10000), name, caps)
}

/// Creates and immediately readies a thread running `body`.
pub fn spawn(
    k: &Arc<Kernel>,
    task: &Arc<Task>,
    name: &str,
    priority: Priority,
    body: impl FnOnce() + Send + 'static,
) -> Arc<Thread> {
    let t = thread::thread_create(k, task, name, priority, Box::new(body))
        .expect("thread_create failed");
    thread::thread_ready(k, &t);
    t
}

/// Waits for every listed thread to exit; panics past [`PATIENCE`].
pub fn join_all(threads: &[Arc<Thread>]) {
    for t in threads {
        assert!(
            t.wait_exited(PATIENCE),
            "thread {:?} did not exit in time",
            t
        );
    }
}

/// Spins until `cond` holds; panics past [`PATIENCE`].
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + PATIENCE;
    while !cond() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Background clock: ticks every CPU at a fixed cadence until dropped.
/// Plays the part of the timer interrupt of the hosted machine.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(k: Arc<Kernel>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let driver = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                k.tick_all();
                std::thread::sleep(period);
            }
        });
        Ticker {
            stop,
            driver: Some(driver),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.driver.take() {
            let _ = h.join();
        }
    }
}
