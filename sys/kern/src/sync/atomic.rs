// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel atomic types.
//!
//! Contended kernel counters (ready-thread counts, id generators, missed
//! tick counts) go through [`Counter`] rather than raw `core::sync::atomic`
//! types, so the ordering decision is made in exactly one place: every
//! operation is sequentially consistent, i.e. it carries a full barrier
//! between its read and its write. None of these counters is remotely hot
//! enough for that to matter, and it removes a whole class of
//! subtly-wrong-ordering bugs from review.

use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Machine-word counter with atomic arithmetic.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub const fn new(v: i64) -> Self {
        Counter(AtomicI64::new(v))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::SeqCst)
    }

    /// Increments and returns the *new* value.
    pub fn inc(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements and returns the *new* value.
    pub fn dec(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Increments and returns the *previous* value.
    pub fn postinc(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Decrements and returns the *previous* value.
    pub fn postdec(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::SeqCst)
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Replaces `old` with `new` if the counter still holds `old`.
    pub fn compare_and_swap(&self, old: i64, new: i64) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Exchanges the value, returning the previous one.
    pub fn swap(&self, v: i64) -> i64 {
        self.0.swap(v, Ordering::SeqCst)
    }
}

/// One-bit test-and-set cell; the substrate under [`super::SpinLock`].
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub const fn new() -> Self {
        AtomicFlag(AtomicBool::new(false))
    }

    /// Sets the flag, returning whether it was already set.
    pub fn test_and_set(&self) -> bool {
        self.0.swap(true, Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_arithmetic() {
        let c = Counter::new(5);
        assert_eq!(c.postinc(), 5);
        assert_eq!(c.get(), 6);
        assert_eq!(c.inc(), 7);
        assert_eq!(c.dec(), 6);
        assert_eq!(c.postdec(), 6);
        assert_eq!(c.get(), 5);
        assert!(c.compare_and_swap(5, 11));
        assert!(!c.compare_and_swap(5, 12));
        assert_eq!(c.get(), 11);
    }

    #[test]
    fn flag_test_and_set() {
        let f = AtomicFlag::new();
        assert!(!f.test_and_set());
        assert!(f.test_and_set());
        f.clear();
        assert!(!f.test_and_set());
    }

    #[test]
    fn counter_contended_increment() {
        use std::sync::Arc;
        let c = Arc::new(Counter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.inc();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.get(), 8000);
    }
}
