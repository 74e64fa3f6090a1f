// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support selection.
//!
//! The portable kernel reaches the machine exclusively through this module:
//! saved thread contexts and the switch between them, the current-thread
//! register, interrupt-priority manipulation, CPU sleep/wake, and memory
//! barriers. Exactly one backend is compiled in.
//!
//! `sim` is the hosted backend: a "CPU" is a permission to run, a saved
//! context is a parked host thread, and raising the interrupt priority level
//! maps onto the preemption-disable count (a hosted process cannot mask its
//! peers, so the IPL's only observable effect -- shielding the holder from
//! preemption -- is the part that is modeled). Bare-metal ports would slot
//! in beside it.

/// Asserts a kernel invariant. Failure is a kernel bug and is fatal; this is
/// never used to report user errors.
macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond, "kernel invariant violated")
    };
    ($cond:expr, $msg:expr) => {
        assert!($cond, $msg)
    };
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        compile_error!(
            "no bare-metal arch backend in this tree; build hosted"
        );
    } else {
        mod sim;
        pub use sim::*;
    }
}
