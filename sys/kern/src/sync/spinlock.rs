// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spinlocks.
//!
//! Two flavors, matching the two kinds of critical section in the kernel:
//!
//! * [`SpinLock`] -- plain mutual exclusion. Holding it disables preemption
//!   for the owning thread, so the holder cannot be descheduled while other
//!   CPUs spin on it.
//! * [`IrqSpinLock`] -- additionally saves the interrupt priority level and
//!   raises it to the maximum for the duration, for state that is also
//!   touched from interrupt context (wait queues, timeout lists, ready
//!   queues, answerboxes).
//!
//! Both are strict spinlocks: the holder must never sleep. Every kernel
//! suspension point is reached only with all guards dropped; violating that
//! is a kernel bug, not a recoverable condition.
//!
//! Recursive acquisition by the same CPU is forbidden and will simply
//! deadlock the offender, which on the hosted backend shows up as a hung
//! test rather than silent corruption.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};

use crate::arch;
use crate::sync::atomic::AtomicFlag;

/// Plain spinlock protecting a `T`.
#[derive(Default)]
pub struct SpinLock<T> {
    flag: AtomicFlag,
    value: UnsafeCell<T>,
}

// A SpinLock hands out &T/&mut T under mutual exclusion, the same soundness
// argument as std's Mutex.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            flag: AtomicFlag::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning as needed. Preemption of the calling
    /// thread is disabled until the guard drops.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        if let Some(t) = arch::try_current() {
            t.preempt_disable();
        }
        while self.flag.test_and_set() {
            spin_loop();
        }
        arch::cs_enter_barrier();
        SpinGuard { lock: self }
    }

    /// Single acquisition attempt; used where lock order would otherwise
    /// invert (the work-stealing path).
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if let Some(t) = arch::try_current() {
            t.preempt_disable();
        }
        if self.flag.test_and_set() {
            if let Some(t) = arch::try_current() {
                t.preempt_enable();
            }
            None
        } else {
            arch::cs_enter_barrier();
            Some(SpinGuard { lock: self })
        }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: the flag is held, so access is exclusive.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the flag is held, so access is exclusive.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        arch::cs_leave_barrier();
        self.lock.flag.clear();
        if let Some(t) = arch::try_current() {
            t.preempt_enable();
        }
    }
}

/// Interrupt-safe spinlock: acquisition saves the current interrupt
/// priority level and raises it to the maximum; the guard restores it.
///
/// This is the guard-object rendition of the classic
/// `ipl = interrupts_disable(); spinlock_lock(&l); ...;
/// spinlock_unlock(&l); interrupts_restore(ipl);` bracket: the saved level
/// rides inside the guard and cannot be forgotten or restored twice.
#[derive(Default)]
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        IrqSpinLock {
            inner: SpinLock::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinGuard<'_, T> {
        let ipl = arch::interrupts_disable();
        let guard = self.inner.lock();
        IrqSpinGuard {
            guard: Some(guard),
            ipl: Some(ipl),
        }
    }

    pub fn try_lock(&self) -> Option<IrqSpinGuard<'_, T>> {
        let ipl = arch::interrupts_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinGuard {
                guard: Some(guard),
                ipl: Some(ipl),
            }),
            None => {
                arch::interrupts_restore(ipl);
                None
            }
        }
    }
}

pub struct IrqSpinGuard<'a, T> {
    guard: Option<SpinGuard<'a, T>>,
    ipl: Option<arch::Ipl>,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before dropping the level back down.
        drop(self.guard.take());
        if let Some(ipl) = self.ipl.take() {
            arch::interrupts_restore(ipl);
        }
    }
}
