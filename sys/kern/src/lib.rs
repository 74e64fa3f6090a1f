// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler, synchronization, and IPC core of the kernel.
//!
//! This is the architecture-independent heart of the operating system: the
//! preemptive multi-level-queue scheduler with per-CPU run queues and work
//! stealing, the wait-queue sleep primitive underneath every blocking kernel
//! path, the phone/answerbox call-passing IPC machinery, and the futex bridge
//! for userspace synchronization. Everything else in the system -- memory
//! management, drivers, servers -- is a client of this crate.
//!
//! Code outside the `arch` module is *intended* to be portable: it speaks to
//! the machine only through the `arch` API (saved contexts, CPU sleep/wake,
//! barriers) and to the outside world only through injected collaborators
//! (an [`umem::AddressSpace`] per task, an [`ipc::irq::IoSpace`] for device
//! registers, the clock tick entry point). The one architecture provided
//! here, `arch::sim`, represents saved thread contexts as parked host
//! threads, which makes the entire kernel testable on the development host.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic ideas
//! that appear consistently.
//!
//! 1. Every state transition of a thread, call, or queue happens under that
//!    object's own lock, and locks nest in one global order (phone, then
//!    answerbox, then wait queue, then thread, then ready queue).
//! 2. A strong preference for safe code where reasonable.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
pub mod arch;

pub mod ipc;
pub mod kernel;
pub mod proc;
pub mod sync;
pub mod syscalls;
pub mod time;
pub mod umem;

pub use kernel::Kernel;
