// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives: atomic counters, spinlocks, wait queues, and
//! the futex bridge to userspace.

pub mod atomic;
pub mod futex;
pub mod spinlock;
pub mod waitq;

pub use atomic::{AtomicFlag, Counter};
pub use spinlock::{IrqSpinLock, SpinLock};
pub use waitq::{WaitFlags, WaitQueue, WakeMode};
