// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IRQ pseudocode programs: how a hardware interrupt becomes an IPC
//! notification.
//!
//! A driver task pre-registers a tiny straight-line program against an
//! interrupt number. When that interrupt fires, the kernel interprets the
//! program *in interrupt context*: it can poke device registers through
//! the injected [`IoSpace`], mask and test scratch registers, and finally
//! either `Accept` (claim the interrupt and synthesize a notification from
//! the scratch registers) or `Decline` (not our device). Programs cannot
//! loop, so their runtime is bounded by their length; operand validity is
//! checked once, at registration, never per interrupt.
//!
//! Notifications are lossy by design: while one from a given source sits
//! unclaimed in the answerbox, further `Accept`s from that source are
//! coalesced into it. Picking the notification up re-arms the source.

use alloc::sync::{Arc, Weak};

use abi::{
    ErrorCode, IrqCode, IrqOpcode, RawMessage, IRQ_PROG_ARG_COUNT,
    IRQ_PROG_MAX_LEN,
};

use crate::ipc;
use crate::kernel::Kernel;
use crate::proc::task::Task;
use crate::sync::atomic::AtomicFlag;

/// Access width of a device register operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoWidth {
    W8,
    W16,
    W32,
}

/// Device register access, injected at boot. The core performs no I/O of
/// its own; this is one of the explicitly injected device callbacks.
pub trait IoSpace: Send + Sync {
    fn pio_read(&self, addr: u64, width: IoWidth) -> u32;
    fn pio_write(&self, addr: u64, width: IoWidth, value: u32);
    fn mem_read(&self, addr: u64, width: IoWidth) -> u32;
    fn mem_write(&self, addr: u64, width: IoWidth, value: u32);
}

/// Default I/O space of the hosted machine: reads as zeroes, swallows
/// writes.
pub struct NullIo;

impl IoSpace for NullIo {
    fn pio_read(&self, _addr: u64, _width: IoWidth) -> u32 {
        0
    }
    fn pio_write(&self, _addr: u64, _width: IoWidth, _value: u32) {}
    fn mem_read(&self, _addr: u64, _width: IoWidth) -> u32 {
        0
    }
    fn mem_write(&self, _addr: u64, _width: IoWidth, _value: u32) {}
}

/// A registered interrupt handler: the validated program, the owning task,
/// and the coalescing state.
pub(crate) struct IrqHandler {
    code: IrqCode,
    task: Weak<Task>,
    owner: abi::TaskId,
    method: u64,
    /// Set while a notification from this source awaits pickup.
    pending: AtomicFlag,
}

/// Validates an IRQ program: length, register operands, and predicate skip
/// distances. Passing this once is what makes blind execution in interrupt
/// context safe.
pub fn validate(code: &IrqCode) -> Result<(), ErrorCode> {
    let len = code.len as usize;
    if len > IRQ_PROG_MAX_LEN {
        return Err(ErrorCode::InvalidArgument);
    }
    let cmds = code.cmds();
    for (i, c) in cmds.iter().enumerate() {
        let uses_dst = matches!(
            c.op,
            IrqOpcode::PioRead8
                | IrqOpcode::PioRead16
                | IrqOpcode::PioRead32
                | IrqOpcode::MemRead8
                | IrqOpcode::MemRead16
                | IrqOpcode::MemRead32
                | IrqOpcode::BTest
        );
        let uses_src = matches!(
            c.op,
            IrqOpcode::PioWriteA8
                | IrqOpcode::PioWriteA16
                | IrqOpcode::PioWriteA32
                | IrqOpcode::MemWriteA8
                | IrqOpcode::MemWriteA16
                | IrqOpcode::MemWriteA32
                | IrqOpcode::BTest
                | IrqOpcode::Predicate
        );
        if uses_dst && c.dstarg as usize >= IRQ_PROG_ARG_COUNT {
            return Err(ErrorCode::InvalidArgument);
        }
        if uses_src && c.srcarg as usize >= IRQ_PROG_ARG_COUNT {
            return Err(ErrorCode::InvalidArgument);
        }
        if c.op == IrqOpcode::Predicate
            && c.value as usize > cmds.len() - (i + 1)
        {
            return Err(ErrorCode::InvalidArgument);
        }
    }
    Ok(())
}

/// Interprets a validated program against `io`, filling `scratch`. Returns
/// whether the interrupt was accepted. Falling off the end without an
/// explicit verdict declines, so a program that never says `Accept` can
/// never produce a notification.
///
/// Public so machine harnesses can dry-run a program against their own
/// `IoSpace`; only call it on a program [`validate`] has passed.
pub fn execute(
    code: &IrqCode,
    scratch: &mut [u64; IRQ_PROG_ARG_COUNT],
    io: &dyn IoSpace,
) -> bool {
    let cmds = code.cmds();
    let mut i = 0;
    while i < cmds.len() {
        let c = cmds[i];
        i += 1;
        let src = c.srcarg as usize;
        let dst = c.dstarg as usize;
        match c.op {
            IrqOpcode::PioRead8 => {
                scratch[dst] = io.pio_read(c.addr, IoWidth::W8) as u64
            }
            IrqOpcode::PioRead16 => {
                scratch[dst] = io.pio_read(c.addr, IoWidth::W16) as u64
            }
            IrqOpcode::PioRead32 => {
                scratch[dst] = io.pio_read(c.addr, IoWidth::W32) as u64
            }
            IrqOpcode::PioWrite8 => {
                io.pio_write(c.addr, IoWidth::W8, c.value as u32)
            }
            IrqOpcode::PioWrite16 => {
                io.pio_write(c.addr, IoWidth::W16, c.value as u32)
            }
            IrqOpcode::PioWrite32 => {
                io.pio_write(c.addr, IoWidth::W32, c.value as u32)
            }
            IrqOpcode::PioWriteA8 => {
                io.pio_write(c.addr, IoWidth::W8, scratch[src] as u32)
            }
            IrqOpcode::PioWriteA16 => {
                io.pio_write(c.addr, IoWidth::W16, scratch[src] as u32)
            }
            IrqOpcode::PioWriteA32 => {
                io.pio_write(c.addr, IoWidth::W32, scratch[src] as u32)
            }
            IrqOpcode::MemRead8 => {
                scratch[dst] = io.mem_read(c.addr, IoWidth::W8) as u64
            }
            IrqOpcode::MemRead16 => {
                scratch[dst] = io.mem_read(c.addr, IoWidth::W16) as u64
            }
            IrqOpcode::MemRead32 => {
                scratch[dst] = io.mem_read(c.addr, IoWidth::W32) as u64
            }
            IrqOpcode::MemWrite8 => {
                io.mem_write(c.addr, IoWidth::W8, c.value as u32)
            }
            IrqOpcode::MemWrite16 => {
                io.mem_write(c.addr, IoWidth::W16, c.value as u32)
            }
            IrqOpcode::MemWrite32 => {
                io.mem_write(c.addr, IoWidth::W32, c.value as u32)
            }
            IrqOpcode::MemWriteA8 => {
                io.mem_write(c.addr, IoWidth::W8, scratch[src] as u32)
            }
            IrqOpcode::MemWriteA16 => {
                io.mem_write(c.addr, IoWidth::W16, scratch[src] as u32)
            }
            IrqOpcode::MemWriteA32 => {
                io.mem_write(c.addr, IoWidth::W32, scratch[src] as u32)
            }
            IrqOpcode::BTest => scratch[dst] = scratch[src] & c.value,
            IrqOpcode::Predicate => {
                if scratch[src] == 0 {
                    i += c.value as usize;
                }
            }
            IrqOpcode::Accept => return true,
            IrqOpcode::Decline => return false,
        }
    }
    false
}

/// Registers `code` as the handler program for interrupt `inr`, with
/// notifications delivered to `task`'s answerbox under method id `method`.
/// One handler per interrupt number; the slot is first come, first served.
pub fn register(
    k: &Kernel,
    task: &Arc<Task>,
    inr: u32,
    code: IrqCode,
    method: u64,
) -> Result<(), ErrorCode> {
    validate(&code)?;
    let mut irqs = k.irqs.lock();
    if irqs.contains_key(&inr) {
        return Err(ErrorCode::NoResource);
    }
    irqs.insert(
        inr,
        Arc::new(IrqHandler {
            code,
            task: Arc::downgrade(task),
            owner: task.id(),
            method,
            pending: AtomicFlag::new(),
        }),
    );
    log::debug!("task {} registered irq {}", task.id().0, inr);
    Ok(())
}

/// Removes the handler for `inr`. Only the registering task may do so.
pub fn unregister(
    k: &Kernel,
    task: &Arc<Task>,
    inr: u32,
) -> Result<(), ErrorCode> {
    let mut irqs = k.irqs.lock();
    let h = irqs.get(&inr).ok_or(ErrorCode::NotFound)?;
    if h.owner != task.id() {
        return Err(ErrorCode::PermissionDenied);
    }
    irqs.remove(&inr);
    Ok(())
}

/// Drops every handler owned by `task`; teardown path.
pub(crate) fn unregister_all(k: &Kernel, task_id: abi::TaskId) {
    k.irqs.lock().retain(|_, h| h.owner != task_id);
}

/// Interrupt entry point: runs the program registered for `inr`, if any,
/// and on `Accept` synthesizes a notification call whose arguments are the
/// program's scratch registers. Returns whether the interrupt was claimed.
///
/// Runs in interrupt context: the calling host thread must not be a kernel
/// thread.
pub fn dispatch(k: &Kernel, inr: u32) -> bool {
    let Some(h) = k.irqs.lock().get(&inr).cloned() else {
        return false;
    };
    let mut scratch = [0u64; IRQ_PROG_ARG_COUNT];
    if !execute(&h.code, &mut scratch, k.io()) {
        return false;
    }
    if h.pending.test_and_set() {
        // Previous notification not yet collected; coalesce.
        return true;
    }
    let Some(task) = h.task.upgrade() else {
        h.pending.clear();
        return false;
    };
    let msg = RawMessage::request(h.method, scratch);
    let call = ipc::new_notification(k, msg, Some(inr));
    if ipc::send_notification(k, &task.answerbox, call).is_err() {
        h.pending.clear();
        return false;
    }
    true
}

/// Re-arms a source after its notification was picked up.
pub(crate) fn pending_clear(k: &Kernel, inr: u32) {
    if let Some(h) = k.irqs.lock().get(&inr) {
        h.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::IrqCmd;
    use alloc::vec::Vec;

    use crate::sync::SpinLock;

    #[derive(Default)]
    struct FakeIo {
        pio: SpinLock<alloc::collections::BTreeMap<u64, u32>>,
        writes: SpinLock<Vec<(u64, u32)>>,
    }

    impl IoSpace for FakeIo {
        fn pio_read(&self, addr: u64, _w: IoWidth) -> u32 {
            *self.pio.lock().get(&addr).unwrap_or(&0)
        }
        fn pio_write(&self, addr: u64, _w: IoWidth, value: u32) {
            self.writes.lock().push((addr, value));
        }
        fn mem_read(&self, addr: u64, w: IoWidth) -> u32 {
            self.pio_read(addr, w)
        }
        fn mem_write(&self, addr: u64, w: IoWidth, value: u32) {
            self.pio_write(addr, w, value);
        }
    }

    fn cmd(op: IrqOpcode) -> IrqCmd {
        IrqCmd {
            op,
            ..IrqCmd::default()
        }
    }

    #[test]
    fn trivial_accept_and_decline() {
        let io = FakeIo::default();
        let mut scratch = [0; IRQ_PROG_ARG_COUNT];
        let acc = IrqCode::from_cmds(&[cmd(IrqOpcode::Accept)]);
        assert!(execute(&acc, &mut scratch, &io));
        let dec = IrqCode::from_cmds(&[cmd(IrqOpcode::Decline)]);
        assert!(!execute(&dec, &mut scratch, &io));
        let empty = IrqCode::from_cmds(&[]);
        assert!(!execute(&empty, &mut scratch, &io), "no verdict declines");
    }

    #[test]
    fn status_mask_and_predicate() {
        // Read a status register, mask the interrupt bit, accept only if
        // set -- the canonical shape of a real handler program.
        let io = FakeIo::default();
        io.pio.lock().insert(0x60, 0b1010);
        let prog = IrqCode::from_cmds(&[
            IrqCmd {
                op: IrqOpcode::PioRead8,
                addr: 0x60,
                dstarg: 0,
                ..IrqCmd::default()
            },
            IrqCmd {
                op: IrqOpcode::BTest,
                value: 0b0010,
                srcarg: 0,
                dstarg: 1,
                ..IrqCmd::default()
            },
            IrqCmd {
                op: IrqOpcode::Predicate,
                value: 1,
                srcarg: 1,
                ..IrqCmd::default()
            },
            cmd(IrqOpcode::Accept),
            cmd(IrqOpcode::Decline),
        ]);
        validate(&prog).unwrap();
        let mut scratch = [0; IRQ_PROG_ARG_COUNT];
        assert!(execute(&prog, &mut scratch, &io));
        assert_eq!(scratch[0], 0b1010);
        assert_eq!(scratch[1], 0b0010);

        // Clear the interrupt bit; the predicate now skips Accept.
        io.pio.lock().insert(0x60, 0b1000);
        let mut scratch = [0; IRQ_PROG_ARG_COUNT];
        assert!(!execute(&prog, &mut scratch, &io));
    }

    #[test]
    fn write_from_argument() {
        let io = FakeIo::default();
        io.pio.lock().insert(0x20, 0x5A);
        let prog = IrqCode::from_cmds(&[
            IrqCmd {
                op: IrqOpcode::PioRead8,
                addr: 0x20,
                dstarg: 2,
                ..IrqCmd::default()
            },
            IrqCmd {
                op: IrqOpcode::PioWriteA8,
                addr: 0x24,
                srcarg: 2,
                ..IrqCmd::default()
            },
            cmd(IrqOpcode::Accept),
        ]);
        validate(&prog).unwrap();
        let mut scratch = [0; IRQ_PROG_ARG_COUNT];
        assert!(execute(&prog, &mut scratch, &io));
        assert_eq!(*io.writes.lock(), vec![(0x24, 0x5A)]);
    }

    #[test]
    fn validation_rejects_bad_operands() {
        let bad_dst = IrqCode::from_cmds(&[IrqCmd {
            op: IrqOpcode::PioRead8,
            dstarg: IRQ_PROG_ARG_COUNT as u8,
            ..IrqCmd::default()
        }]);
        assert_eq!(validate(&bad_dst), Err(ErrorCode::InvalidArgument));

        let bad_src = IrqCode::from_cmds(&[IrqCmd {
            op: IrqOpcode::BTest,
            srcarg: 200,
            dstarg: 0,
            ..IrqCmd::default()
        }]);
        assert_eq!(validate(&bad_src), Err(ErrorCode::InvalidArgument));

        let skip_past_end = IrqCode::from_cmds(&[IrqCmd {
            op: IrqOpcode::Predicate,
            value: 2,
            srcarg: 0,
            ..IrqCmd::default()
        }]);
        assert_eq!(
            validate(&skip_past_end),
            Err(ErrorCode::InvalidArgument)
        );

        let mut oversized = IrqCode::from_cmds(&[cmd(IrqOpcode::Accept)]);
        oversized.len = (IRQ_PROG_MAX_LEN + 1) as u32;
        assert_eq!(validate(&oversized), Err(ErrorCode::InvalidArgument));
    }

    #[test]
    fn predicate_skip_is_exact() {
        // Predicate skipping exactly to the end is legal.
        let prog = IrqCode::from_cmds(&[
            IrqCmd {
                op: IrqOpcode::Predicate,
                value: 1,
                srcarg: 0,
                ..IrqCmd::default()
            },
            cmd(IrqOpcode::Accept),
        ]);
        validate(&prog).unwrap();
        let io = FakeIo::default();
        // Scratch register 0 is zero, so the Accept is skipped and the
        // program falls off the end: declined.
        let mut scratch = [0; IRQ_PROG_ARG_COUNT];
        assert!(!execute(&prog, &mut scratch, &io));
    }
}
