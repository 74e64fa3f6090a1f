// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC: phones, answerboxes, and the calls that travel between them.
//!
//! Topology: every task owns exactly one [`Answerbox`] (its server side)
//! and a fixed table of [`Phone`] slots (its client side), each either free
//! or connected to some task's answerbox. A [`Call`] is a fixed-size scalar
//! message that is enqueued on the callee's box, picked up by a receiver,
//! and eventually answered -- the same object, with its payload replaced,
//! flowing back to the sender.
//!
//! Lifecycle of a call:
//!
//! ```text
//! create -> callee box `calls` -> callee box `dispatched` -> answered:
//!     sync sender:  wake on the call's own wait flag
//!     async sender: sender box `answers`, collected by wait-for-call
//! ```
//!
//! Delivery guarantees: FIFO per phone (a phone feeds one box, and sends
//! take the box lock); exactly one answer per call, which on peer death is
//! synthesized by the kernel with `Hangup` status and the request's scalar
//! arguments preserved. Notifications are kernel-originated, jump the
//! queue, and are lossy (coalesced by source).
//!
//! Phones hold *weak* references to their peer's answerbox; the reference
//! is upgraded under the phone's lock, and an upgrade failure is reported
//! as -- and is indistinguishable from -- a hangup. That is what breaks
//! the task ↔ phone ↔ answerbox reference cycle.

pub mod irq;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use abi::{
    CallFlags, ErrorCode, RawMessage, TaskId, IPC_MAX_ASYNC_CALLS,
    IPC_MAX_PHONES, MSG_CONNECT_ME_TO, MSG_CONNECT_TO_ME, MSG_PHONE_HUNGUP,
};

use crate::kernel::Kernel;
use crate::proc::task::Task;
use crate::sync::waitq::{WaitFlags, WaitQueue, WakeMode};
use crate::sync::{IrqSpinLock, SpinLock};

/// Sender id stamped on kernel-originated calls (notifications, synthetic
/// hangups on behalf of dead tasks). Real task ids start at 1.
pub const KERNEL_SENDER: TaskId = TaskId(0);

/// One slot of a task's phone table.
#[derive(Default)]
pub struct Phone {
    state: SpinLock<PhoneState>,
}

pub enum PhoneState {
    /// Unused slot.
    Free,
    /// Allocation placeholder during a connection handshake.
    Connecting,
    /// Live channel to a peer's answerbox.
    Connected(Weak<Answerbox>),
    /// Dead channel; calls report `Hangup` until the slot is reused.
    Hungup,
}

impl Default for PhoneState {
    fn default() -> Self {
        PhoneState::Free
    }
}

/// Mutable portion of a call.
pub(crate) struct CallInner {
    /// Request payload on the way in; answer payload once `ANSWERED`.
    pub msg: RawMessage,
    pub flags: CallFlags,
}

/// A message object. Allocated per call, owned by exactly one queue (or by
/// the code holding it between queues) at any moment; the `Arc` exists so
/// a sync sender can wait on its own call while the callee holds it.
pub struct Call {
    pub id: u64,
    pub(crate) sender: Weak<Task>,
    pub sender_id: TaskId,
    /// Sync senders sleep on the call itself instead of their answerbox.
    sync: bool,
    /// Kernel-originated, delivered at the head of the queue, lossy.
    notification: bool,
    /// IRQ source to un-coalesce when this notification is picked up.
    pub(crate) notif_src: Option<u32>,
    /// The sync sender's private wake flag.
    done: WaitQueue,
    pub(crate) inner: SpinLock<CallInner>,
}

struct BoxInner {
    /// Set false when the owning task begins teardown; senders see Hangup.
    open: bool,
    /// Calls awaiting pickup. Notifications enter at the front.
    calls: VecDeque<Arc<Call>>,
    /// Picked up, awaiting the server's answer.
    dispatched: VecDeque<Arc<Call>>,
    /// Answered calls awaiting collection by *this* task as the sender.
    answers: VecDeque<Arc<Call>>,
    /// Per-sender count of entries in `calls`, for the flood cap.
    per_sender: BTreeMap<TaskId, usize>,
}

/// A task's server endpoint.
pub struct Answerbox {
    pub(crate) task: Weak<Task>,
    /// Receivers block here; senders signal it.
    pub(crate) wq: WaitQueue,
    inner: IrqSpinLock<BoxInner>,
}

impl Answerbox {
    pub(crate) fn new(task: Weak<Task>) -> Self {
        Answerbox {
            task,
            wq: WaitQueue::new(),
            inner: IrqSpinLock::new(BoxInner {
                open: true,
                calls: VecDeque::new(),
                dispatched: VecDeque::new(),
                answers: VecDeque::new(),
                per_sender: BTreeMap::new(),
            }),
        }
    }

    /// The task this box belongs to, while it lives.
    pub fn owner(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }

    /// Calls awaiting pickup; test observability.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Answers awaiting collection; test observability.
    pub fn pending_answers(&self) -> usize {
        self.inner.lock().answers.len()
    }
}

/// What `wait_for_call` hands to the receiver.
#[derive(Clone, Debug)]
pub struct Received {
    /// Call id: the answer handle for requests, the correlation id for
    /// collected answers.
    pub id: u64,
    pub msg: RawMessage,
    pub flags: CallFlags,
    pub sender: TaskId,
}

impl Received {
    /// True for a collected answer to one of our own async calls, false
    /// for a request somebody wants us to serve.
    pub fn is_answer(&self) -> bool {
        self.flags.contains(CallFlags::ANSWERED)
    }
}

fn new_call(
    k: &Kernel,
    sender: &Arc<Task>,
    msg: RawMessage,
    sync: bool,
) -> Arc<Call> {
    Arc::new(Call {
        id: k.next_call_id.inc() as u64,
        sender: Arc::downgrade(sender),
        sender_id: sender.id(),
        sync,
        notification: false,
        notif_src: None,
        done: WaitQueue::new(),
        inner: SpinLock::new(CallInner {
            msg,
            flags: CallFlags::empty(),
        }),
    })
}

/// Builds a kernel-originated notification call. Used by the IRQ layer.
pub(crate) fn new_notification(
    k: &Kernel,
    msg: RawMessage,
    notif_src: Option<u32>,
) -> Arc<Call> {
    Arc::new(Call {
        id: k.next_call_id.inc() as u64,
        sender: Weak::new(),
        sender_id: KERNEL_SENDER,
        sync: false,
        notification: true,
        notif_src,
        done: WaitQueue::new(),
        inner: SpinLock::new(CallInner {
            msg,
            flags: CallFlags::NOTIFICATION | CallFlags::DISCARD_ANSWER,
        }),
    })
}

/// Allocates a free phone slot in `task`, leaving it `Connecting`.
fn alloc_phone(task: &Task) -> Result<usize, ErrorCode> {
    for (i, phone) in task.phones.iter().enumerate() {
        let mut st = phone.state.lock();
        if matches!(*st, PhoneState::Free) {
            *st = PhoneState::Connecting;
            return Ok(i);
        }
    }
    Err(ErrorCode::NoResource)
}

/// Connects a fresh phone slot in `src` to `dst`'s answerbox, returning the
/// slot index. This is both the kernel-internal bootstrap (wiring initial
/// tasks together) and the tail end of the connection handshakes.
pub fn connect(src: &Arc<Task>, dst: &Arc<Task>) -> Result<usize, ErrorCode> {
    let slot = alloc_phone(src)?;
    *src.phones[slot].state.lock() =
        PhoneState::Connected(Arc::downgrade(&dst.answerbox));
    log::trace!(
        "task {} phone {} -> task {}",
        src.id().0,
        slot,
        dst.id().0
    );
    Ok(slot)
}

/// Resolves a phone slot to its target answerbox. A dead peer is detected
/// here (failed weak upgrade) and converted into `Hungup` state.
fn phone_target(
    task: &Task,
    slot: usize,
) -> Result<Arc<Answerbox>, ErrorCode> {
    if slot >= IPC_MAX_PHONES {
        return Err(ErrorCode::InvalidArgument);
    }
    let mut st = task.phones[slot].state.lock();
    match &*st {
        PhoneState::Connected(weak) => match weak.upgrade() {
            Some(b) => Ok(b),
            None => {
                *st = PhoneState::Hungup;
                Err(ErrorCode::Hangup)
            }
        },
        PhoneState::Hungup => Err(ErrorCode::Hangup),
        PhoneState::Free | PhoneState::Connecting => {
            Err(ErrorCode::InvalidArgument)
        }
    }
}

/// Enqueues `call` on `abox`, enforcing the per-sender cap for ordinary
/// calls. Notifications jump the queue and skip accounting.
fn send_call(
    k: &Kernel,
    abox: &Answerbox,
    call: Arc<Call>,
) -> Result<(), ErrorCode> {
    {
        let mut b = abox.inner.lock();
        if !b.open {
            return Err(ErrorCode::Hangup);
        }
        if call.notification {
            b.calls.push_front(call);
        } else {
            let count = b.per_sender.entry(call.sender_id).or_insert(0);
            if *count >= IPC_MAX_ASYNC_CALLS {
                return Err(ErrorCode::Again);
            }
            *count += 1;
            b.calls.push_back(call);
        }
    }
    abox.wq.wake(k, WakeMode::One);
    Ok(())
}

/// Entry point for the IRQ layer: notifications take the ordinary send
/// path, which puts them at the head of the queue and exempts them from
/// sender accounting.
pub(crate) fn send_notification(
    k: &Kernel,
    abox: &Answerbox,
    call: Arc<Call>,
) -> Result<(), ErrorCode> {
    send_call(k, abox, call)
}

/// Stamps `answer` into the call and routes it back: wake the sync sender,
/// or park it in the (live) sender's answerbox for collection.
fn deliver_answer(k: &Kernel, call: &Arc<Call>, answer: RawMessage) {
    let discard = {
        let mut ci = call.inner.lock();
        ci.msg = answer;
        ci.flags |= CallFlags::ANSWERED;
        ci.flags.contains(CallFlags::DISCARD_ANSWER)
    };
    if discard {
        return;
    }
    if call.sync {
        call.done.wake(k, WakeMode::One);
        return;
    }
    if let Some(sender) = call.sender.upgrade() {
        let delivered = {
            let mut b = sender.answerbox.inner.lock();
            if b.open {
                b.answers.push_back(Arc::clone(call));
                true
            } else {
                false
            }
        };
        if delivered {
            sender.answerbox.wq.wake(k, WakeMode::One);
        }
    }
    // A dead sender's answer has nowhere to go; the call simply drops.
}

/// Synchronous call on `slot`: send, sleep on the call's own wait flag,
/// return the answer payload. Interruption (task teardown) abandons the
/// call; a late answer to an abandoned call is discarded.
pub fn call_sync(
    k: &Kernel,
    task: &Arc<Task>,
    slot: usize,
    msg: RawMessage,
) -> Result<RawMessage, ErrorCode> {
    let abox = phone_target(task, slot)?;
    let call = new_call(k, task, msg, true);
    send_call(k, &abox, Arc::clone(&call))?;
    match call.done.sleep(k, None, WaitFlags::INTERRUPTIBLE) {
        Ok(()) => Ok(call.inner.lock().msg),
        Err(e) => {
            let mut ci = call.inner.lock();
            if ci.flags.contains(CallFlags::ANSWERED) {
                // The answer raced our interruption and won; take it.
                Ok(ci.msg)
            } else {
                ci.flags |= CallFlags::DISCARD_ANSWER;
                Err(e)
            }
        }
    }
}

/// Asynchronous call on `slot`. Returns the call id; the answer arrives in
/// the caller's own answerbox, via [`wait_for_call`], carrying the same id.
pub fn call_async(
    k: &Kernel,
    task: &Arc<Task>,
    slot: usize,
    msg: RawMessage,
) -> Result<u64, ErrorCode> {
    let abox = phone_target(task, slot)?;
    let call = new_call(k, task, msg, false);
    let id = call.id;
    send_call(k, &abox, call)?;
    Ok(id)
}

/// Server side: answers the dispatched call `call_id` with `answer`.
///
/// Answers to the connection-handshake methods are post-processed here: a
/// successful `MSG_CONNECT_ME_TO` mints a phone in the *sender's* table
/// aimed at the answering task and reports its slot in argument 5 of the
/// answer; a successful `MSG_CONNECT_TO_ME` mints a phone in the
/// *answerer's* table aimed back at the sender and returns its slot to the
/// answerer. Failure to mint turns the answer into `NoResource`.
pub fn answer(
    k: &Kernel,
    task: &Arc<Task>,
    call_id: u64,
    answer: RawMessage,
) -> Result<u64, ErrorCode> {
    let call = {
        let mut b = task.answerbox.inner.lock();
        let pos = b
            .dispatched
            .iter()
            .position(|c| c.id == call_id)
            .ok_or(ErrorCode::NotFound)?;
        b.dispatched.remove(pos).unwrap()
    };

    let req_method = call.inner.lock().msg.method();
    let mut out = answer;
    let mut retval_to_answerer = 0u64;
    if out.retval() == 0 {
        match req_method {
            MSG_CONNECT_ME_TO => {
                if let Some(sender) = call.sender.upgrade() {
                    match connect(&sender, task) {
                        Ok(slot) => out.set_arg(5, slot as u64),
                        Err(e) => out.set_retval(e.as_retword()),
                    }
                }
            }
            MSG_CONNECT_TO_ME => {
                if let Some(sender) = call.sender.upgrade() {
                    match connect(task, &sender) {
                        Ok(slot) => retval_to_answerer = slot as u64,
                        Err(e) => out.set_retval(e.as_retword()),
                    }
                }
            }
            _ => (),
        }
    }
    deliver_answer(k, &call, out);
    Ok(retval_to_answerer)
}

/// Re-targets a dispatched call at another phone, preserving the original
/// sender. The method is replaced; arguments travel unchanged. If the new
/// target cannot take the call, the kernel answers it toward the sender
/// with the failure, so the call is never lost.
pub fn forward(
    k: &Kernel,
    task: &Arc<Task>,
    call_id: u64,
    slot: usize,
    new_method: u64,
) -> Result<(), ErrorCode> {
    forward_rewrite(k, task, call_id, slot, |msg| {
        msg.set_method(new_method)
    })
}

/// Slow-path forward: the forwarder supplies a whole replacement payload,
/// not just a method id.
pub fn forward_payload(
    k: &Kernel,
    task: &Arc<Task>,
    call_id: u64,
    slot: usize,
    payload: RawMessage,
) -> Result<(), ErrorCode> {
    forward_rewrite(k, task, call_id, slot, |msg| *msg = payload)
}

fn forward_rewrite(
    k: &Kernel,
    task: &Arc<Task>,
    call_id: u64,
    slot: usize,
    rewrite: impl FnOnce(&mut RawMessage),
) -> Result<(), ErrorCode> {
    let call = {
        let mut b = task.answerbox.inner.lock();
        let pos = b
            .dispatched
            .iter()
            .position(|c| c.id == call_id)
            .ok_or(ErrorCode::NotFound)?;
        b.dispatched.remove(pos).unwrap()
    };
    {
        let mut ci = call.inner.lock();
        ci.flags |= CallFlags::FORWARDED;
        rewrite(&mut ci.msg);
    }
    let target = match phone_target(task, slot) {
        Ok(t) => t,
        Err(e) => {
            bounce(k, &call, e);
            return Err(e);
        }
    };
    if let Err(e) = send_call(k, &target, Arc::clone(&call)) {
        bounce(k, &call, e);
        return Err(e);
    }
    Ok(())
}

/// Answers a call with an error on behalf of the kernel, preserving the
/// request's scalar arguments.
fn bounce(k: &Kernel, call: &Arc<Call>, e: ErrorCode) {
    let mut msg = call.inner.lock().msg;
    msg.set_retval(e.as_retword());
    deliver_answer(k, call, msg);
}

/// Blocks until something lands in `task`'s answerbox and returns it:
/// collected answers first, then notifications and requests in queue
/// order. Picking up a request moves it to the awaiting-answer list;
/// picking up a notification re-arms its source for the next delivery.
///
/// `timeout_usec` and `flags` have wait-queue semantics
/// ([`WaitQueue::sleep`]); the wait is always interruptible by teardown.
pub fn wait_for_call(
    k: &Kernel,
    task: &Arc<Task>,
    timeout_usec: Option<u64>,
    flags: WaitFlags,
) -> Result<Received, ErrorCode> {
    loop {
        let got = {
            let mut b = task.answerbox.inner.lock();
            if let Some(c) = b.answers.pop_front() {
                Some(c)
            } else if let Some(c) = b.calls.pop_front() {
                if !c.notification {
                    if let Some(count) = b.per_sender.get_mut(&c.sender_id) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            b.per_sender.remove(&c.sender_id);
                        }
                    }
                    b.dispatched.push_back(Arc::clone(&c));
                }
                Some(c)
            } else if !b.open {
                // Our own box is being torn down; no call is ever coming.
                return Err(ErrorCode::Hangup);
            } else {
                None
            }
        };
        if let Some(c) = got {
            if let Some(inr) = c.notif_src {
                irq::pending_clear(k, inr);
            }
            let ci = c.inner.lock();
            return Ok(Received {
                id: c.id,
                msg: ci.msg,
                flags: ci.flags,
                sender: c.sender_id,
            });
        }
        task.answerbox
            .wq
            .sleep(k, timeout_usec, flags | WaitFlags::INTERRUPTIBLE)?;
    }
}

/// Hangs up a phone slot. Idempotent: an already hung-up phone reports
/// success and nothing changes. A connected peer receives a synthetic
/// `MSG_PHONE_HUNGUP` call so its server loop can clean up; the kernel
/// never waits for that call to be answered.
pub fn hangup(k: &Kernel, task: &Arc<Task>, slot: usize) -> Result<(), ErrorCode> {
    if slot >= IPC_MAX_PHONES {
        return Err(ErrorCode::InvalidArgument);
    }
    let peer = {
        let mut st = task.phones[slot].state.lock();
        match &*st {
            PhoneState::Free | PhoneState::Connecting => {
                return Err(ErrorCode::InvalidArgument)
            }
            PhoneState::Hungup => return Ok(()),
            PhoneState::Connected(weak) => {
                let peer = weak.upgrade();
                *st = PhoneState::Hungup;
                peer
            }
        }
    };
    if let Some(abox) = peer {
        let msg = RawMessage::request(
            MSG_PHONE_HUNGUP,
            [task.id().0, 0, 0, 0, 0],
        );
        let call = Arc::new(Call {
            id: k.next_call_id.inc() as u64,
            sender: Arc::downgrade(task),
            sender_id: task.id(),
            sync: false,
            notification: false,
            notif_src: None,
            done: WaitQueue::new(),
            inner: SpinLock::new(CallInner {
                msg,
                flags: CallFlags::DISCARD_ANSWER,
            }),
        });
        // The peer may be mid-teardown; then nobody needs the notice.
        let _ = send_call_unmetered(k, &abox, call);
    }
    Ok(())
}

/// Like `send_call` but exempt from the per-sender cap: hangup notices
/// must get through even when the sender has flooded the box.
fn send_call_unmetered(
    k: &Kernel,
    abox: &Answerbox,
    call: Arc<Call>,
) -> Result<(), ErrorCode> {
    {
        let mut b = abox.inner.lock();
        if !b.open {
            return Err(ErrorCode::Hangup);
        }
        b.calls.push_back(call);
    }
    abox.wq.wake(k, WakeMode::One);
    Ok(())
}

/// Teardown path: closes the box and auto-answers, with `Hangup` status,
/// every call a peer still has in flight here -- both the ones never picked
/// up and the ones awaiting an answer that will now never come. Queue order
/// is preserved, so senders collect their failures in issue order.
pub(crate) fn cleanup_answerbox(k: &Kernel, abox: &Answerbox) {
    let orphans: Vec<Arc<Call>> = {
        let mut guard = abox.inner.lock();
        let b = &mut *guard;
        b.open = false;
        b.per_sender.clear();
        b.answers.clear();
        b.calls.drain(..).chain(b.dispatched.drain(..)).collect()
    };
    if !orphans.is_empty() {
        log::warn!(
            "answerbox teardown auto-answering {} orphaned call(s)",
            orphans.len()
        );
    }
    for call in orphans {
        bounce(k, &call, ErrorCode::Hangup);
    }
    // Kick any receiver still blocked on the box; it will observe the
    // closed state and fail out with Hangup.
    abox.wq.wake(k, WakeMode::All);
}
