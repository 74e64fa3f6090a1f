// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in here is either a plain scalar, a `bitflags` set, or a
//! fixed-layout record, so that the same definitions can be compiled into the
//! kernel and into user programs without dragging kernel internals across the
//! boundary.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes};

/// Number of ready queues per CPU. Queue 0 is the most important; queue
/// `RQ_COUNT - 1` is reserved for the per-CPU idle thread.
pub const RQ_COUNT: usize = 16;

/// Number of phone slots in every task's phone table.
pub const IPC_MAX_PHONES: usize = 16;

/// Cap on calls a single sender task may have parked in one answerbox's
/// pickup queue. Exceeding it fails the send with `ErrorCode::Again`.
pub const IPC_MAX_ASYNC_CALLS: usize = 4;

/// Size of the simulated kernel stack handed to each thread.
pub const THREAD_STACK_SIZE: usize = 16 * 1024;

/// Time slice granted to a priority-`RQ_COUNT - 2` thread, in clock ticks.
/// More important threads get proportionally longer slices; see the
/// scheduler for the formula.
pub const BASE_SLICE_TICKS: u64 = 10;

/// Number of clock ticks between priority-aging passes on a CPU.
pub const NEEDS_RELINK_MAX: u64 = 16;

/// Microseconds represented by one clock tick.
pub const USEC_PER_TICK: u64 = 1_000;

/// Names a task. Task ids are assigned monotonically at task creation and
/// never reused, so a stale id reliably fails lookup instead of aliasing a
/// new task.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize, AsBytes, FromBytes,
)]
#[repr(transparent)]
pub struct TaskId(pub u64);

/// Names a thread. Same monotonic-and-never-reused story as [`TaskId`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize, AsBytes, FromBytes,
)]
#[repr(transparent)]
pub struct ThreadId(pub u64);

/// Indicates the priority class of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The most important class available to ordinary threads.
    pub const HIGHEST: Self = Priority(0);

    /// The least important class available to ordinary threads. One class is
    /// held back for idle threads.
    pub const LOWEST_USER: Self = Priority((RQ_COUNT - 2) as u8);

    /// Reserved for per-CPU idle threads; below every real priority.
    pub const IDLE: Self = Priority((RQ_COUNT - 1) as u8);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Returns the next less important class, saturating at
    /// [`Priority::LOWEST_USER`]. Used when a thread exhausts its slice.
    pub fn demoted(self) -> Self {
        if (self.0 as usize) < RQ_COUNT - 2 {
            Priority(self.0 + 1)
        } else {
            self
        }
    }

    /// Returns the next more important class, saturating at
    /// [`Priority::HIGHEST`]. Used by aging.
    pub fn promoted(self) -> Self {
        Priority(self.0.saturating_sub(1))
    }
}

bitflags::bitflags! {
    /// A task's permission word. Syscall and IPC handlers check individual
    /// bits before performing privileged operations.
    pub struct CapSet: u32 {
        /// May write to the console I/O path.
        const IO = 1 << 0;
        /// May manipulate address-space areas of other tasks.
        const MEM_MANAGER = 1 << 1;
        /// May register and unregister IRQ notification programs.
        const IRQ_REG = 1 << 2;
        /// May turn preemption off and back on.
        const PREEMPT_CONTROL = 1 << 3;
        /// May grant and revoke capabilities, including this one.
        const CAP_MANAGE = 1 << 4;
    }
}

/// Result kinds produced by kernel operations, exposed to user code as
/// negative return values at the syscall boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// Allocator refused; the operation unwound.
    NoMemory = 1,
    /// A fixed table (phone slots, etc.) is exhausted.
    NoResource = 2,
    /// A non-blocking operation found nothing to do.
    WouldBlock = 3,
    /// A sleep expired before wakeup.
    Timeout = 4,
    /// A sleep was aborted by external cancellation.
    Interrupted = 5,
    /// IPC peer terminated, or the phone is hung up.
    Hangup = 6,
    /// Informational: the call took the forwarded path.
    Forwarded = 7,
    /// The capability word lacks the required bit.
    PermissionDenied = 8,
    /// Bad user pointer, out-of-range id, or malformed IRQ program.
    InvalidArgument = 9,
    /// Transient resource pressure; retry later.
    Again = 10,
    /// Lookup by id failed.
    NotFound = 11,
}

impl ErrorCode {
    /// Encodes this error as a syscall return value. Success paths return
    /// non-negative values, so errors occupy the negative range.
    pub fn as_retval(self) -> isize {
        -(self as u32 as isize)
    }

    /// Encodes this error as the return-value word of an IPC answer
    /// (two's-complement of the negative code).
    pub fn as_retword(self) -> u64 {
        self.as_retval() as i64 as u64
    }

    /// Decodes an IPC answer's return-value word back into an error, if it
    /// is one.
    pub fn from_retword(w: u64) -> Option<Self> {
        use core::convert::TryFrom;
        Self::try_from(w as i64 as isize).ok()
    }
}

/// We're using an explicit `TryFrom` impl for `ErrorCode` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<isize> for ErrorCode {
    type Error = ();

    fn try_from(v: isize) -> Result<Self, Self::Error> {
        match v.checked_neg().ok_or(())? {
            1 => Ok(Self::NoMemory),
            2 => Ok(Self::NoResource),
            3 => Ok(Self::WouldBlock),
            4 => Ok(Self::Timeout),
            5 => Ok(Self::Interrupted),
            6 => Ok(Self::Hangup),
            7 => Ok(Self::Forwarded),
            8 => Ok(Self::PermissionDenied),
            9 => Ok(Self::InvalidArgument),
            10 => Ok(Self::Again),
            11 => Ok(Self::NotFound),
            _ => Err(()),
        }
    }
}

/// Syscall numbers.
///
/// "Fast" IPC variants carry their payload in registers; "slow" variants
/// read a full record out of user memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Io = 0,
    TlsSet = 1,
    ThreadCreate = 2,
    ThreadExit = 3,
    TaskGetId = 4,
    FutexSleepTimeout = 5,
    FutexWakeup = 6,
    AsAreaCreate = 7,
    AsAreaResize = 8,
    AsAreaDestroy = 9,
    AsAreaAccept = 10,
    AsAreaSend = 11,
    IpcCallSyncFast = 12,
    IpcCallSyncSlow = 13,
    IpcCallAsyncFast = 14,
    IpcCallAsyncSlow = 15,
    IpcAnswerFast = 16,
    IpcAnswerSlow = 17,
    IpcForwardFast = 18,
    IpcForwardSlow = 26,
    IpcWaitForCall = 19,
    IpcHangup = 20,
    IpcRegisterIrq = 21,
    IpcUnregisterIrq = 22,
    CapGrant = 23,
    CapRevoke = 24,
    PreemptControl = 25,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Io),
            1 => Ok(Self::TlsSet),
            2 => Ok(Self::ThreadCreate),
            3 => Ok(Self::ThreadExit),
            4 => Ok(Self::TaskGetId),
            5 => Ok(Self::FutexSleepTimeout),
            6 => Ok(Self::FutexWakeup),
            7 => Ok(Self::AsAreaCreate),
            8 => Ok(Self::AsAreaResize),
            9 => Ok(Self::AsAreaDestroy),
            10 => Ok(Self::AsAreaAccept),
            11 => Ok(Self::AsAreaSend),
            12 => Ok(Self::IpcCallSyncFast),
            13 => Ok(Self::IpcCallSyncSlow),
            14 => Ok(Self::IpcCallAsyncFast),
            15 => Ok(Self::IpcCallAsyncSlow),
            16 => Ok(Self::IpcAnswerFast),
            17 => Ok(Self::IpcAnswerSlow),
            18 => Ok(Self::IpcForwardFast),
            19 => Ok(Self::IpcWaitForCall),
            20 => Ok(Self::IpcHangup),
            21 => Ok(Self::IpcRegisterIrq),
            22 => Ok(Self::IpcUnregisterIrq),
            23 => Ok(Self::CapGrant),
            24 => Ok(Self::CapRevoke),
            25 => Ok(Self::PreemptControl),
            26 => Ok(Self::IpcForwardSlow),
            _ => Err(()),
        }
    }
}

/// Number of payload words in an IPC message, including the method word.
pub const MSG_WORDS: usize = 6;

/// Delivered to a server when a peer hangs up a phone connected to it.
pub const MSG_PHONE_HUNGUP: u64 = 0;
/// Connection handshake: the sender asks the receiver to hand it a phone to
/// a (possibly third-party) answerbox. The answer carries the new phone id.
pub const MSG_CONNECT_ME_TO: u64 = 1;
/// Reverse handshake: the sender offers the receiver a phone back to the
/// sender's own answerbox.
pub const MSG_CONNECT_TO_ME: u64 = 2;
/// Shared-memory export handshake; the transfer itself is out of the core.
pub const MSG_SHARE_OUT: u64 = 3;
/// Shared-memory import handshake; the transfer itself is out of the core.
pub const MSG_SHARE_IN: u64 = 4;
/// Method ids at or above this value are free for application protocols.
pub const FIRST_USER_METHOD: u64 = 16;
/// Method ids for kernel-originated notifications start here.
pub const NOTIF_FIRST: u64 = 1024;

/// Fixed-size IPC payload: a method word plus five scalar arguments.
///
/// On the request path, word 0 holds the method id. On the answer path, the
/// same word holds the return value. There is no inline data payload; bulk
/// transfer is negotiated with the `MSG_SHARE_*` methods and performed by
/// the memory subsystem.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
    AsBytes, FromBytes,
)]
#[repr(transparent)]
pub struct RawMessage(pub [u64; MSG_WORDS]);

impl RawMessage {
    /// Builds a request payload from a method id and up to five arguments.
    pub fn request(method: u64, args: [u64; MSG_WORDS - 1]) -> Self {
        let mut w = [0; MSG_WORDS];
        w[0] = method;
        w[1..].copy_from_slice(&args);
        RawMessage(w)
    }

    pub fn method(&self) -> u64 {
        self.0[0]
    }

    pub fn set_method(&mut self, m: u64) {
        self.0[0] = m;
    }

    /// Return value of an answered call; aliases the method word.
    pub fn retval(&self) -> u64 {
        self.0[0]
    }

    pub fn set_retval(&mut self, v: u64) {
        self.0[0] = v;
    }

    /// Reads argument `i`, where arguments are numbered 1 through 5.
    ///
    /// # Panics
    ///
    /// If `i` is 0 or out of range; argument numbering is part of the ABI
    /// and a bad index is a kernel bug, not a user error.
    pub fn arg(&self, i: usize) -> u64 {
        assert!((1..MSG_WORDS).contains(&i));
        self.0[i]
    }

    /// Writes argument `i`; same numbering and panic rules as [`Self::arg`].
    pub fn set_arg(&mut self, i: usize, v: u64) {
        assert!((1..MSG_WORDS).contains(&i));
        self.0[i] = v;
    }
}

bitflags::bitflags! {
    /// State bits carried on a call object.
    pub struct CallFlags: u32 {
        /// The server has answered; the payload is now the answer.
        const ANSWERED = 1 << 0;
        /// The call was re-targeted at least once on its way to pickup.
        const FORWARDED = 1 << 1;
        /// Kernel-originated; delivered ahead of ordinary calls and lossy.
        const NOTIFICATION = 1 << 2;
        /// Synthesized by an IRQ pseudocode program.
        const IRQ = 1 << 3;
        /// Nobody is waiting for the answer; reclaim it on arrival.
        const DISCARD_ANSWER = 1 << 4;
    }
}

/// Upper bound on IRQ pseudocode program length, checked at registration.
pub const IRQ_PROG_MAX_LEN: usize = 32;

/// Number of scratch argument registers available to an IRQ program. The
/// same registers feed the synthesized notification's payload.
pub const IRQ_PROG_ARG_COUNT: usize = MSG_WORDS - 1;

/// Operation vocabulary of IRQ pseudocode programs.
///
/// Programs are straight-line: `Predicate` can skip forward, nothing can
/// jump backward, so execution time is bounded by program length. That is
/// what makes them safe to run in interrupt context.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IrqOpcode {
    PioRead8,
    PioRead16,
    PioRead32,
    PioWrite8,
    PioWrite16,
    PioWrite32,
    /// Like `PioWrite*`, but the value comes from a scratch register.
    PioWriteA8,
    PioWriteA16,
    PioWriteA32,
    MemRead8,
    MemRead16,
    MemRead32,
    MemWrite8,
    MemWrite16,
    MemWrite32,
    MemWriteA8,
    MemWriteA16,
    MemWriteA32,
    /// Mask the source register with `value`, store into the destination.
    BTest,
    /// Skip the next `value` commands if the source register is zero.
    Predicate,
    /// Claim the interrupt and synthesize a notification.
    Accept,
    /// The interrupt is not ours; stop without a notification.
    Decline,
}

impl Default for IrqOpcode {
    fn default() -> Self {
        IrqOpcode::Decline
    }
}

/// One command of an IRQ pseudocode program: an opcode plus its operands.
/// Which operands are meaningful depends on the opcode; the kernel checks
/// register indices and skip distances once, at registration time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IrqCmd {
    pub op: IrqOpcode,
    /// I/O port or physical memory address, for the access opcodes.
    pub addr: u64,
    /// Immediate: write value, mask, or skip distance.
    pub value: u64,
    /// Scratch register index read by `PioWriteA*`/`MemWriteA*`/`BTest`/
    /// `Predicate`.
    pub srcarg: u8,
    /// Scratch register index written by reads and `BTest`.
    pub dstarg: u8,
}

/// A complete IRQ program as registered from user memory: a fixed-capacity
/// command array plus its live length. Fixed capacity keeps the record
/// marshallable without allocation.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct IrqCode {
    pub len: u32,
    pub cmds: [IrqCmd; IRQ_PROG_MAX_LEN],
}

impl IrqCode {
    /// Convenience constructor from a short command slice.
    ///
    /// # Panics
    ///
    /// If `cmds` exceeds [`IRQ_PROG_MAX_LEN`].
    pub fn from_cmds(cmds: &[IrqCmd]) -> Self {
        assert!(cmds.len() <= IRQ_PROG_MAX_LEN);
        let mut out = IrqCode {
            len: cmds.len() as u32,
            cmds: [IrqCmd::default(); IRQ_PROG_MAX_LEN],
        };
        out.cmds[..cmds.len()].copy_from_slice(cmds);
        out
    }

    pub fn cmds(&self) -> &[IrqCmd] {
        &self.cmds[..self.len as usize]
    }
}

/// The record `SYS_IPC_WAIT_FOR_CALL` writes back to user memory: the
/// received call's correlation id, payload, state flags, and sender task.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: u64,
    pub words: [u64; MSG_WORDS],
    pub flags: u32,
    pub sender: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn error_code_retval_round_trip() {
        for e in [
            ErrorCode::NoMemory,
            ErrorCode::NoResource,
            ErrorCode::WouldBlock,
            ErrorCode::Timeout,
            ErrorCode::Interrupted,
            ErrorCode::Hangup,
            ErrorCode::Forwarded,
            ErrorCode::PermissionDenied,
            ErrorCode::InvalidArgument,
            ErrorCode::Again,
            ErrorCode::NotFound,
        ] {
            let v = e.as_retval();
            assert!(v < 0);
            assert_eq!(ErrorCode::try_from(v), Ok(e));
        }
        assert!(ErrorCode::try_from(0).is_err());
        assert!(ErrorCode::try_from(-9999).is_err());
    }

    #[test]
    fn sysnum_try_from_covers_table() {
        for n in 0..=26 {
            let s = Sysnum::try_from(n).unwrap();
            assert_eq!(s as u32, n);
        }
        assert!(Sysnum::try_from(27).is_err());
    }

    #[test]
    fn priority_direction() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(3).is_more_important_than(Priority(3)));
        assert!(Priority::HIGHEST.is_more_important_than(Priority::IDLE));
        assert_eq!(Priority::LOWEST_USER.demoted(), Priority::LOWEST_USER);
        assert_eq!(Priority(0).promoted(), Priority(0));
        assert_eq!(Priority(5).demoted(), Priority(6));
        assert_eq!(Priority(5).promoted(), Priority(4));
    }

    #[test]
    fn message_words() {
        let mut m = RawMessage::request(42, [1, 2, 3, 4, 5]);
        assert_eq!(m.method(), 42);
        assert_eq!(m.arg(1), 1);
        assert_eq!(m.arg(5), 5);
        m.set_retval(7);
        assert_eq!(m.retval(), 7);
        assert_eq!(m.arg(2), 2, "answering must not disturb arguments");
    }

    #[test]
    fn irq_code_slice_view() {
        let prog = IrqCode::from_cmds(&[IrqCmd {
            op: IrqOpcode::Accept,
            ..IrqCmd::default()
        }]);
        assert_eq!(prog.cmds().len(), 1);
        assert_eq!(prog.cmds()[0].op, IrqOpcode::Accept);
    }
}
