// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transaction engine: admission, payload copy, object translation,
//! target selection, dispatch, and failure unwinding.
//!
//! A send is processed in phases. *Resolution* finds the target process and
//! (for replies and nested calls) the specific target thread. *Admission*
//! pins the target node with a strong count and reserves a buffer in the
//! target's mapping. *Copy and translation* move the payload across and
//! rewrite each embedded object into the receiver's terms, object by
//! object, enforcing the monotonic fixup order. *Dispatch* links the
//! transaction into the caller's stack (synchronous), gates it behind the
//! node's async queue (one-way), or resumes the caller (reply), then wakes
//! the target. Any failure after admission walks the offsets processed so
//! far and reverses each effect before reporting back to the sender.

use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian};
use ferry_abi::{
    BufferFlags, BufferObject, Cookie, FdArrayObject, FdObject, FlatObject,
    Handle, Nice, NodePolicy, ObjPtr, ObjectKind, Return, TransactionData,
    TxnFlags, UsageError, EXTRAS_ALIGN, OFFSET_WORD,
};
use zerocopy::{FromBytes, IntoBytes};

use crate::alloc::{align8, AllocError, Buffer};
use crate::err::DeliveryError;
use crate::node::Node;
use crate::process::Process;
use crate::thread::Thread;
use crate::work::{Work, WorkTarget};

/// Peer links of a transaction. `from`, `to_proc` and `to_thread` can be
/// nulled during thread teardown, so readers snapshot them under this lock
/// without touching the owning thread's locks.
pub(crate) struct TxnPeers {
    pub from: Option<Arc<Thread>>,
    pub from_parent: Option<Arc<Transaction>>,
    pub to_proc: Option<Arc<Process>>,
    pub to_thread: Option<Arc<Thread>>,
    pub to_parent: Option<Arc<Transaction>>,
    /// Receiver nicety before the priority rule was applied; restored when
    /// the reply goes out.
    pub saved_nice: Nice,
}

/// One in-flight call or reply.
pub struct Transaction {
    pub debug_id: u32,
    pub code: u32,
    pub flags: TxnFlags,
    pub need_reply: bool,
    /// Sender nicety at send time, input to the priority rule.
    pub priority: Nice,
    pub sender_euid: u32,
    pub(crate) peers: Mutex<TxnPeers>,
    pub(crate) buffer: Mutex<Option<Arc<Buffer>>>,
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("debug_id", &self.debug_id)
            .field("code", &self.code)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn is_oneway(&self) -> bool {
        self.flags.contains(TxnFlags::ONE_WAY)
    }

    /// Whether this is a request (has a target node) rather than a reply.
    pub(crate) fn is_request(&self) -> bool {
        self.buffer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|b| b.target_node.lock().unwrap().is_some())
    }

    /// Snapshots the sending thread, pinning it against teardown. Callers
    /// must balance with `Thread::tmp_dec`.
    pub(crate) fn from_thread(&self) -> Option<Arc<Thread>> {
        let peers = self.peers.lock().unwrap();
        let from = peers.from.clone();
        if let Some(t) = &from {
            t.tmp_inc();
        }
        from
    }

    pub(crate) fn set_saved_nice(&self, nice: Nice) {
        self.peers.lock().unwrap().saved_nice = nice;
    }

    pub(crate) fn saved_nice(&self) -> Nice {
        self.peers.lock().unwrap().saved_nice
    }

    /// Forgets the buffer without touching its back-link; used when the
    /// buffer itself is being freed.
    pub(crate) fn clear_buffer(&self) {
        *self.buffer.lock().unwrap() = None;
    }

    /// Unlinks the buffer from this transaction in both directions. The
    /// buffer stays alive in its allocator until freed.
    pub(crate) fn detach_buffer(&self) {
        if let Some(b) = self.buffer.lock().unwrap().take() {
            *b.transaction.lock().unwrap() = Weak::new();
        }
    }

    /// Final unlinking of a finished or abandoned transaction.
    pub(crate) fn free(&self) {
        self.detach_buffer();
    }
}

/// Failure of a send, together with the popped incoming frame when the
/// failing send was a reply (its caller still needs an answer).
struct Abort {
    err: DeliveryError,
    in_reply_to: Option<Arc<Transaction>>,
    /// The completion marker already reached the sender's queue before the
    /// failure, so the error path must not produce a second one.
    tc_queued: bool,
}

/// Pins taken during resolution, released on every exit path. The node's
/// strong count transfers to the buffer once allocation succeeds.
#[derive(Default)]
struct Pins {
    node_strong: Option<Arc<Node>>,
    proc_tmp: Option<Arc<Process>>,
    thread_tmp: Option<Arc<Thread>>,
}

impl Pins {
    fn release(&mut self) {
        if let Some(n) = self.node_strong.take() {
            n.dec(true, false);
        }
        if let Some(t) = self.thread_tmp.take() {
            t.tmp_dec();
        }
        if let Some(p) = self.proc_tmp.take() {
            p.tmp_dec();
        }
    }
}

/// Entry point for `Transaction`/`Reply` (and their `_SG` forms) from the
/// write pump. Failures are routed to the thread's error slots rather than
/// returned.
pub(crate) fn transact(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    tr: &TransactionData,
    reply: bool,
    extras_size: u64,
) {
    if let Err(abort) = transact_inner(proc, thread, tr, reply, extras_size)
    {
        log::warn!(
            "{}:{} transaction failed {:?}, size {}-{}",
            proc.pid,
            thread.tid,
            abort.err,
            tr.data_size,
            tr.offsets_size
        );
        match abort.in_reply_to {
            Some(irt) => {
                // The reply itself was accepted as far as the sender is
                // concerned; the original caller gets the failure.
                if !abort.tc_queued {
                    crate::thread::set_return_error(
                        thread,
                        Return::TransactionComplete,
                        0,
                    );
                }
                send_failed_reply(irt, abort.err.return_code());
            }
            None => {
                crate::thread::set_return_error(
                    thread,
                    abort.err.return_code(),
                    0,
                );
            }
        }
    }
}

fn transact_inner(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    tr: &TransactionData,
    reply: bool,
    extras_size: u64,
) -> Result<(), Abort> {
    let driver = &proc.driver;
    let flags = tr.txn_flags();
    let oneway = flags.contains(TxnFlags::ONE_WAY);
    let mut pins = Pins::default();
    let mut in_reply_to: Option<Arc<Transaction>> = None;
    let mut target_thread: Option<Arc<Thread>> = None;
    let mut target_node: Option<Arc<Node>> = None;

    let fail = |pins: &mut Pins,
                err: DeliveryError,
                irt: Option<Arc<Transaction>>| {
        pins.release();
        Abort { err, in_reply_to: irt, tc_queued: false }
    };

    let target_proc: Arc<Process>;
    if reply {
        let irt = {
            let st = thread.state.lock().unwrap();
            st.stack.clone()
        };
        let Some(irt) = irt else {
            log::warn!(
                "{}:{} got reply with no transaction stack",
                proc.pid,
                thread.tid
            );
            return Err(fail(
                &mut pins,
                UsageError::BadReplyTarget.into(),
                None,
            ));
        };
        // The handler is done; drop back to the nicety we ran at before
        // this frame was delivered.
        thread.state.lock().unwrap().nice = irt.saved_nice();
        {
            let peers = irt.peers.lock().unwrap();
            let ours = peers
                .to_thread
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, thread));
            if !ours {
                log::warn!(
                    "{}:{} got reply with bad transaction stack, \
                     transaction {}",
                    proc.pid,
                    thread.tid,
                    irt.debug_id
                );
                return Err(fail(
                    &mut pins,
                    UsageError::BadReplyTarget.into(),
                    None,
                ));
            }
        }
        // Pop our incoming frame.
        {
            let mut st = thread.state.lock().unwrap();
            st.stack = irt.peers.lock().unwrap().to_parent.clone();
        }
        let Some(tt) = irt.from_thread() else {
            return Err(fail(&mut pins, DeliveryError::Dead, Some(irt)));
        };
        pins.thread_tmp = Some(Arc::clone(&tt));
        let caller_top_matches = {
            let st = tt.state.lock().unwrap();
            st.stack.as_ref().is_some_and(|top| Arc::ptr_eq(top, &irt))
        };
        if !caller_top_matches {
            log::warn!(
                "{}:{} got reply with bad target transaction stack",
                proc.pid,
                thread.tid
            );
            return Err(fail(
                &mut pins,
                UsageError::BadReplyTarget.into(),
                None,
            ));
        }
        target_proc = Arc::clone(&tt.proc);
        target_proc.tmp_inc();
        pins.proc_tmp = Some(Arc::clone(&target_proc));
        target_thread = Some(tt);
        in_reply_to = Some(irt);
    } else {
        let node = if tr.target != 0 {
            let handle = Handle(tr.target as u32);
            let nref = match proc.get_ref(handle, true) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!(
                        "{}:{} transaction to invalid handle {}",
                        proc.pid,
                        thread.tid,
                        handle.0
                    );
                    return Err(fail(&mut pins, e.into(), None));
                }
            };
            let node = Arc::clone(&nref.node);
            // Strong-pin the node across the whole operation.
            if let Err(e) = node.inc(true, false, None) {
                return Err(fail(&mut pins, e.into(), None));
            }
            node
        } else {
            let Some(node) = proc.context.manager_node() else {
                return Err(fail(&mut pins, DeliveryError::Dead, None));
            };
            if let Err(e) = node.inc(true, false, None) {
                node.tmp_dec();
                return Err(fail(&mut pins, e.into(), None));
            }
            node.tmp_dec();
            node
        };
        pins.node_strong = Some(Arc::clone(&node));

        let Some(owner) = node.owner() else {
            return Err(fail(&mut pins, DeliveryError::Dead, None));
        };
        target_proc = owner;
        target_proc.tmp_inc();
        pins.proc_tmp = Some(Arc::clone(&target_proc));

        if !driver.policy.may_transact(proc, &target_proc) {
            return Err(fail(&mut pins, DeliveryError::Denied, None));
        }

        if !oneway {
            // Nested synchronous calls resume the thread that initiated
            // the outer call: if the stack passes through the target
            // process, steer there.
            let top = thread.state.lock().unwrap().stack.clone();
            if let Some(top) = top {
                let ours = top
                    .peers
                    .lock()
                    .unwrap()
                    .to_thread
                    .as_ref()
                    .is_some_and(|t| Arc::ptr_eq(t, thread));
                if !ours {
                    log::warn!(
                        "{}:{} got new transaction with bad transaction \
                         stack",
                        proc.pid,
                        thread.tid
                    );
                    return Err(fail(
                        &mut pins,
                        UsageError::BadReplyTarget.into(),
                        None,
                    ));
                }
                let mut cur = Some(top);
                while let Some(c) = cur {
                    let peers = c.peers.lock().unwrap();
                    if let Some(from) = &peers.from {
                        if Arc::ptr_eq(&from.proc, &target_proc) {
                            target_thread = Some(Arc::clone(from));
                            break;
                        }
                    }
                    cur = peers.from_parent.clone();
                }
            }
        }
        target_node = Some(node);
    }

    let t_debug_id = driver.next_id();
    if reply {
        log::debug!(
            "{}:{} Reply {} -> {}, size {}-{}-{}",
            proc.pid,
            thread.tid,
            t_debug_id,
            target_proc.pid,
            tr.data_size,
            tr.offsets_size,
            extras_size
        );
    } else {
        log::debug!(
            "{}:{} Transaction {} -> {} node {}, size {}-{}-{}",
            proc.pid,
            thread.tid,
            t_debug_id,
            target_proc.pid,
            target_node.as_ref().map_or(0, |n| n.debug_id),
            tr.data_size,
            tr.offsets_size,
            extras_size
        );
    }

    let t = Arc::new(Transaction {
        debug_id: t_debug_id,
        code: tr.code,
        flags,
        need_reply: !reply && !oneway,
        priority: thread.current_nice(),
        sender_euid: proc.euid,
        peers: Mutex::new(TxnPeers {
            from: (!reply && !oneway).then(|| Arc::clone(thread)),
            from_parent: None,
            to_proc: Some(Arc::clone(&target_proc)),
            to_thread: target_thread.clone(),
            to_parent: None,
            saved_nice: Nice::default(),
        }),
        buffer: Mutex::new(None),
    });

    let is_async = !reply && oneway;
    let buffer = match target_proc.alloc.alloc_buf(
        t_debug_id,
        tr.data_size,
        tr.offsets_size,
        extras_size,
        is_async,
    ) {
        Ok(b) => b,
        Err(AllocError::NotMapped) => {
            // The target's mapping is gone; it is dying.
            return Err(fail(&mut pins, DeliveryError::Dead, in_reply_to));
        }
        Err(_) => {
            return Err(fail(
                &mut pins,
                DeliveryError::Exhausted,
                in_reply_to,
            ));
        }
    };
    *buffer.transaction.lock().unwrap() = Arc::downgrade(&t);
    *t.buffer.lock().unwrap() = Some(Arc::clone(&buffer));
    // The admission strong count now rides on the buffer: exactly one of
    // `pins.node_strong` / `buffer.target_node` owns it at any time.
    *buffer.target_node.lock().unwrap() = pins.node_strong.take();

    // From here on, failures release the buffer and everything translated
    // so far.
    let unwind = |pins: &mut Pins,
                  err: DeliveryError,
                  irt: Option<Arc<Transaction>>,
                  data: &[u8],
                  extras: &[u8],
                  offsets: &[u64],
                  upto: usize| {
        unwind_failed_buffer(
            &target_proc,
            &buffer,
            data,
            extras,
            offsets,
            upto,
        );
        t.clear_buffer();
        pins.release();
        Abort { err, in_reply_to: irt, tc_queued: false }
    };

    // Copy the payload and offsets out of the sender.
    let data = match proc.vm.read(tr.data_ptr, tr.data_size) {
        Ok(d) => d,
        Err(_) => {
            log::warn!(
                "{}:{} transaction with invalid data ptr",
                proc.pid,
                thread.tid
            );
            return Err(unwind(
                &mut pins,
                UsageError::BadAddress.into(),
                in_reply_to,
                &[],
                &[],
                &[],
                0,
            ));
        }
    };
    let mut data = data;
    let offsets_bytes = match proc.vm.read(tr.offsets_ptr, tr.offsets_size) {
        Ok(d) => d,
        Err(_) => {
            log::warn!(
                "{}:{} transaction with invalid offsets ptr",
                proc.pid,
                thread.tid
            );
            return Err(unwind(
                &mut pins,
                UsageError::BadAddress.into(),
                in_reply_to,
                &data,
                &[],
                &[],
                0,
            ));
        }
    };
    if tr.offsets_size % OFFSET_WORD != 0 {
        log::warn!(
            "{}:{} transaction with invalid offsets size {}",
            proc.pid,
            thread.tid,
            tr.offsets_size
        );
        return Err(unwind(
            &mut pins,
            UsageError::BadAlignment.into(),
            in_reply_to,
            &data,
            &[],
            &[],
            0,
        ));
    }
    if extras_size % EXTRAS_ALIGN != 0 {
        log::warn!(
            "{}:{} transaction with unaligned extras size {}",
            proc.pid,
            thread.tid,
            extras_size
        );
        return Err(unwind(
            &mut pins,
            UsageError::BadAlignment.into(),
            in_reply_to,
            &data,
            &[],
            &[],
            0,
        ));
    }
    let offsets: Vec<u64> = offsets_bytes
        .chunks_exact(OFFSET_WORD as usize)
        .map(LittleEndian::read_u64)
        .collect();

    // Translate each embedded object in offset order.
    let mut extras = vec![0u8; extras_size as usize];
    let extras_base = buffer.extras_addr();
    let mut sg_off: u64 = 0;
    let mut off_min: u64 = 0;
    let mut last_fixup: Option<(u64, u64)> = None;
    for (idx, &off) in offsets.iter().enumerate() {
        let object = validate_object(&data, off);
        let Some((kind, obj_size)) = object else {
            log::warn!(
                "{}:{} transaction with invalid object at offset {}",
                proc.pid,
                thread.tid,
                off
            );
            return Err(unwind(
                &mut pins,
                UsageError::BadObject.into(),
                in_reply_to,
                &data,
                &extras,
                &offsets,
                idx,
            ));
        };
        if off < off_min {
            log::warn!(
                "{}:{} transaction with overlapping object at offset {} \
                 (min {})",
                proc.pid,
                thread.tid,
                off,
                off_min
            );
            return Err(unwind(
                &mut pins,
                UsageError::BadObject.into(),
                in_reply_to,
                &data,
                &extras,
                &offsets,
                idx,
            ));
        }
        off_min = off + obj_size;

        let step = match kind {
            ObjectKind::Binder | ObjectKind::WeakBinder => translate_binder(
                proc,
                &target_proc,
                thread,
                &mut data,
                off,
                kind == ObjectKind::Binder,
            ),
            ObjectKind::Handle | ObjectKind::WeakHandle => translate_handle(
                proc,
                &target_proc,
                &mut data,
                off,
                kind == ObjectKind::Handle,
            ),
            ObjectKind::Fd => {
                translate_fd_object(
                    proc,
                    &target_proc,
                    &target_node,
                    in_reply_to.as_deref(),
                    &mut data,
                    off,
                )
            }
            ObjectKind::Ptr => translate_ptr(
                proc,
                &mut data,
                &offsets,
                idx,
                off,
                &mut extras,
                extras_base,
                &mut sg_off,
                &mut last_fixup,
            ),
            ObjectKind::FdArray => translate_fd_array(
                proc,
                &target_proc,
                &target_node,
                in_reply_to.as_deref(),
                &data,
                &offsets,
                idx,
                off,
                &mut extras,
                extras_base,
                &mut last_fixup,
            ),
        };
        if let Err(err) = step {
            return Err(unwind(
                &mut pins,
                err,
                in_reply_to,
                &data,
                &extras,
                &offsets,
                idx,
            ));
        }
    }

    // Commit the translated payload into the target's mapping.
    let commit = target_proc
        .vm
        .write_privileged(buffer.data_addr(), &data)
        .and_then(|()| {
            target_proc
                .vm
                .write_privileged(buffer.offsets_addr(), &offsets_bytes)
        })
        .and_then(|()| {
            target_proc.vm.write_privileged(buffer.extras_addr(), &extras)
        });
    if commit.is_err() {
        // Mapping disappeared under us; the target is dying.
        return Err(unwind(
            &mut pins,
            DeliveryError::Dead,
            in_reply_to,
            &data,
            &extras,
            &offsets,
            offsets.len(),
        ));
    }

    // The sender learns its command was accepted before anything else.
    crate::work::push_thread(thread, Work::TransactionComplete, false);

    if reply {
        let irt = in_reply_to.take().unwrap();
        let tt = target_thread.clone().unwrap();
        if tt.is_dead() {
            let mut abort = unwind(
                &mut pins,
                DeliveryError::Dead,
                Some(irt),
                &data,
                &extras,
                &offsets,
                offsets.len(),
            );
            abort.tc_queued = true;
            return Err(abort);
        }
        // Pop the caller's outgoing frame and retire it.
        {
            let mut st = tt.state.lock().unwrap();
            let from_parent = irt.peers.lock().unwrap().from_parent.clone();
            match &st.stack {
                Some(top) if Arc::ptr_eq(top, &irt) => {
                    st.stack = from_parent;
                }
                _ => log::error!(
                    "caller stack does not match transaction {}",
                    irt.debug_id
                ),
            }
        }
        irt.peers.lock().unwrap().from = None;
        irt.free();
        // Synchronous-exclusive wakeup of the resuming caller.
        if !crate::work::push_thread_if_alive(
            &tt,
            Work::Transaction(Arc::clone(&t)),
        ) {
            // The caller died between the check above and the enqueue; its
            // frame is already retired, so only the buffer remains to undo.
            let mut abort = unwind(
                &mut pins,
                DeliveryError::Dead,
                None,
                &data,
                &extras,
                &offsets,
                offsets.len(),
            );
            abort.tc_queued = true;
            return Err(abort);
        }
    } else if !oneway {
        // Push onto our own stack before the target can see it.
        {
            let mut st = thread.state.lock().unwrap();
            t.peers.lock().unwrap().from_parent = st.stack.take();
            st.stack = Some(Arc::clone(&t));
        }
        let target_dead = target_proc.is_dead()
            || target_thread.as_ref().is_some_and(|tt| tt.is_dead());
        if target_dead {
            // Unwind the push.
            {
                let mut st = thread.state.lock().unwrap();
                st.stack = t.peers.lock().unwrap().from_parent.take();
            }
            t.peers.lock().unwrap().from = None;
            return Err(unwind(
                &mut pins,
                DeliveryError::Dead,
                None,
                &data,
                &extras,
                &offsets,
                offsets.len(),
            ));
        }
        let pushed = match &target_thread {
            Some(tt) => crate::work::push_thread_if_alive(
                tt,
                Work::Transaction(Arc::clone(&t)),
            ),
            None => crate::work::push_proc_if_alive(
                &target_proc,
                Work::Transaction(Arc::clone(&t)),
            ),
        };
        if !pushed {
            {
                let mut st = thread.state.lock().unwrap();
                st.stack = t.peers.lock().unwrap().from_parent.take();
            }
            t.peers.lock().unwrap().from = None;
            return Err(unwind(
                &mut pins,
                DeliveryError::Dead,
                None,
                &data,
                &extras,
                &offsets,
                offsets.len(),
            ));
        }
    } else {
        let node = target_node
            .as_ref()
            .expect("async transaction without target node");
        // Test/set of has_async_txn must be atomic with the enqueue, so
        // both happen under the node lock, where process release also
        // detaches the node.
        let mut nst = node.state.lock().unwrap();
        if target_proc.is_dead() || nst.owner.is_none() {
            drop(nst);
            return Err(unwind(
                &mut pins,
                DeliveryError::Dead,
                None,
                &data,
                &extras,
                &offsets,
                offsets.len(),
            ));
        }
        if nst.has_async_txn {
            // One at a time per node; park behind the one in flight.
            nst.async_todo.push_back(Work::Transaction(Arc::clone(&t)));
        } else if crate::work::push_proc_if_alive(
            &target_proc,
            Work::Transaction(Arc::clone(&t)),
        ) {
            nst.has_async_txn = true;
        } else {
            drop(nst);
            return Err(unwind(
                &mut pins,
                DeliveryError::Dead,
                None,
                &data,
                &extras,
                &offsets,
                offsets.len(),
            ));
        }
    }

    pins.release();
    Ok(())
}

/// Checks for a valid object header at `offset` and returns its kind and
/// wire size.
fn validate_object(data: &[u8], offset: u64) -> Option<(ObjectKind, u64)> {
    if offset % 4 != 0 || offset.checked_add(4)? > data.len() as u64 {
        return None;
    }
    let kind_word = LittleEndian::read_u32(&data[offset as usize..]);
    let kind = ObjectKind::try_from(kind_word).ok()?;
    let size = kind.wire_size();
    if offset + size <= data.len() as u64 {
        Some((kind, size))
    } else {
        None
    }
}

fn read_object<T: FromBytes>(data: &[u8], off: u64) -> T {
    let off = off as usize;
    T::read_from_bytes(&data[off..off + core::mem::size_of::<T>()])
        .expect("object validated before read")
}

fn write_object<T: IntoBytes + zerocopy::Immutable>(
    data: &mut [u8],
    off: u64,
    value: &T,
) {
    let off = off as usize;
    data[off..off + core::mem::size_of::<T>()]
        .copy_from_slice(value.as_bytes());
}

/// Sender exports an object it owns: find or create the node, take a
/// reference in the target, and rewrite the object as a handle.
fn translate_binder(
    proc: &Arc<Process>,
    target_proc: &Arc<Process>,
    thread: &Arc<Thread>,
    data: &mut [u8],
    off: u64,
    strong: bool,
) -> Result<(), DeliveryError> {
    let mut fp: FlatObject = read_object(data, off);
    let node = proc.node_for_ptr(
        ObjPtr(fp.a),
        fp.cookie,
        NodePolicy::from_wire(fp.flags),
        false,
    );
    if fp.cookie != node.cookie {
        log::warn!(
            "{}:{} sending u{:#x} node {}, cookie mismatch {:#x} != {:#x}",
            proc.pid,
            thread.tid,
            fp.a,
            node.debug_id,
            fp.cookie.0,
            node.cookie.0
        );
        node.tmp_dec();
        return Err(UsageError::CookieMismatch.into());
    }
    if !proc.driver.policy.may_transfer_binder(proc, target_proc) {
        node.tmp_dec();
        return Err(DeliveryError::Denied);
    }

    // Notification work for the new count lands on the sender's own
    // thread, which is already inside the driver.
    let target = WorkTarget::Thread(Arc::clone(thread));
    let info = match target_proc.inc_ref_for_node(&node, strong, Some(&target))
    {
        Ok(i) => i,
        Err(e) => {
            node.tmp_dec();
            return Err(e.into());
        }
    };

    fp.kind = if strong {
        ObjectKind::Handle as u32
    } else {
        ObjectKind::WeakHandle as u32
    };
    fp.a = u64::from(info.handle.0);
    fp.cookie = Cookie(0);
    write_object(data, off, &fp);

    log::debug!(
        "        node {} u{:#x} -> ref {} handle {}",
        node.debug_id,
        node.ptr.0,
        info.debug_id,
        info.handle.0
    );
    node.tmp_dec();
    Ok(())
}

/// Sender passes a handle it holds: if the target owns the node the object
/// collapses back into a binder; otherwise the target gets its own
/// reference.
fn translate_handle(
    proc: &Arc<Process>,
    target_proc: &Arc<Process>,
    data: &mut [u8],
    off: u64,
    strong: bool,
) -> Result<(), DeliveryError> {
    let mut fp: FlatObject = read_object(data, off);
    let handle = fp.handle();
    let nref = match proc.get_ref(handle, strong) {
        Ok(r) => r,
        Err(e) => {
            log::warn!(
                "{} got transaction with invalid handle {}",
                proc.pid,
                handle.0
            );
            return Err(e.into());
        }
    };
    let node = Arc::clone(&nref.node);
    node.tmp_inc();
    if !proc.driver.policy.may_transfer_binder(proc, target_proc) {
        node.tmp_dec();
        return Err(DeliveryError::Denied);
    }

    let owned_by_target = node
        .owner()
        .is_some_and(|owner| Arc::ptr_eq(&owner, target_proc));
    if owned_by_target {
        // The object is coming home; resolve the cycle instead of creating
        // a self-reference.
        fp.kind = if strong {
            ObjectKind::Binder as u32
        } else {
            ObjectKind::WeakBinder as u32
        };
        fp.a = node.ptr.0;
        fp.cookie = node.cookie;
        if let Err(e) = node.inc(strong, false, None) {
            node.tmp_dec();
            return Err(e.into());
        }
        write_object(data, off, &fp);
        log::debug!(
            "        ref {} handle {} -> node {} u{:#x}",
            nref.debug_id,
            handle.0,
            node.debug_id,
            node.ptr.0
        );
    } else {
        let info = match target_proc.inc_ref_for_node(&node, strong, None) {
            Ok(i) => i,
            Err(e) => {
                node.tmp_dec();
                return Err(e.into());
            }
        };
        fp.a = u64::from(info.handle.0);
        fp.cookie = Cookie(0);
        write_object(data, off, &fp);
        log::debug!(
            "        ref {} handle {} -> ref {} handle {} (node {})",
            nref.debug_id,
            handle.0,
            info.debug_id,
            info.handle.0,
            node.debug_id
        );
    }
    node.tmp_dec();
    Ok(())
}

/// Moves one descriptor across: duplicates the sender's file into a fresh
/// close-on-exec descriptor of the target.
fn translate_fd(
    proc: &Arc<Process>,
    target_proc: &Arc<Process>,
    target_node: &Option<Arc<Node>>,
    in_reply_to: Option<&Transaction>,
    fd: u32,
) -> Result<u32, DeliveryError> {
    let target_allows = match in_reply_to {
        Some(irt) => irt.flags.contains(TxnFlags::ACCEPT_FDS),
        None => target_node
            .as_ref()
            .is_some_and(|n| n.policy.accepts_fds),
    };
    if !target_allows {
        log::warn!(
            "{} sent fd {} but target does not allow fds",
            proc.pid,
            fd
        );
        return Err(UsageError::FdNotAccepted.into());
    }
    let Some(file) = proc.files.get(fd) else {
        log::warn!("{} got transaction with invalid fd {}", proc.pid, fd);
        return Err(UsageError::BadFd(fd).into());
    };
    if !proc.driver.policy.may_transfer_file(proc, target_proc, &file) {
        return Err(DeliveryError::Denied);
    }
    let Some(target_fd) = target_proc.files.reserve() else {
        return Err(DeliveryError::Exhausted);
    };
    target_proc.files.commit(target_fd, file, true);
    log::debug!("        fd {} -> {}", fd, target_fd);
    Ok(target_fd)
}

fn translate_fd_object(
    proc: &Arc<Process>,
    target_proc: &Arc<Process>,
    target_node: &Option<Arc<Node>>,
    in_reply_to: Option<&Transaction>,
    data: &mut [u8],
    off: u64,
) -> Result<(), DeliveryError> {
    let mut fp: FdObject = read_object(data, off);
    let target_fd =
        translate_fd(proc, target_proc, target_node, in_reply_to, fp.fd)?;
    fp._pad = 0;
    fp.fd = target_fd;
    write_object(data, off, &fp);
    Ok(())
}

/// Looks up the `Ptr` object named by offsets-array index `index`. Only
/// indexes below `num_valid` (already translated) are acceptable parents.
fn validate_ptr(
    data: &[u8],
    offsets: &[u64],
    index: u64,
    num_valid: u64,
) -> Option<BufferObject> {
    if index >= num_valid {
        return None;
    }
    let off = *offsets.get(index as usize)?;
    let (kind, _) = validate_object(data, off)?;
    if kind != ObjectKind::Ptr {
        return None;
    }
    Some(read_object(data, off))
}

/// Validates that a fixup at `fixup_offset` inside parent `parent_idx`
/// respects the monotonic order: the parent must be the most recently
/// fixed-up object or one of its ancestors, and each fixup within a parent
/// must land past the previous one.
fn validate_fixup(
    data: &[u8],
    offsets: &[u64],
    parent_idx: u64,
    fixup_offset: u64,
    last_fixup: Option<(u64, u64)>,
) -> bool {
    let Some((mut last_idx, mut last_min)) = last_fixup else {
        // Nothing to fix up in.
        return false;
    };
    while last_idx != parent_idx {
        let Some(last_obj) =
            validate_ptr(data, offsets, last_idx, u64::MAX)
        else {
            return false;
        };
        if !last_obj.buffer_flags().contains(BufferFlags::HAS_PARENT) {
            return false;
        }
        last_min = last_obj.parent_offset + core::mem::size_of::<u64>() as u64;
        last_idx = last_obj.parent;
    }
    fixup_offset >= last_min
}

/// Copies a pointer-with-length payload into the extras region, rewrites
/// the object to the target-space address, and patches the parent's
/// pointer word when asked to.
fn translate_ptr(
    proc: &Arc<Process>,
    data: &mut [u8],
    offsets: &[u64],
    index: usize,
    off: u64,
    extras: &mut [u8],
    extras_base: u64,
    sg_off: &mut u64,
    last_fixup: &mut Option<(u64, u64)>,
) -> Result<(), DeliveryError> {
    let mut bp: BufferObject = read_object(data, off);
    let buf_left = extras.len() as u64 - *sg_off;
    if bp.length > buf_left {
        log::warn!("{} got transaction with too large buffer", proc.pid);
        return Err(UsageError::ExtrasExhausted.into());
    }
    let payload = proc
        .vm
        .read(bp.buffer, bp.length)
        .map_err(|_| DeliveryError::from(UsageError::BadAddress))?;
    let dst = *sg_off as usize;
    extras[dst..dst + payload.len()].copy_from_slice(&payload);
    let new_addr = extras_base + *sg_off;
    bp.buffer = new_addr;
    *sg_off += align8(bp.length);

    if bp.buffer_flags().contains(BufferFlags::HAS_PARENT) {
        let Some(parent) =
            validate_ptr(data, offsets, bp.parent, index as u64)
        else {
            log::warn!(
                "{} got transaction with invalid parent offset or type",
                proc.pid
            );
            return Err(UsageError::BadParent.into());
        };
        if !validate_fixup(
            data,
            offsets,
            bp.parent,
            bp.parent_offset,
            *last_fixup,
        ) {
            log::warn!(
                "{} got transaction with out-of-order buffer fixup",
                proc.pid
            );
            return Err(UsageError::FixupOutOfOrder.into());
        }
        let word = core::mem::size_of::<u64>() as u64;
        if parent.length < word || bp.parent_offset > parent.length - word {
            log::warn!(
                "{} got transaction with invalid parent offset",
                proc.pid
            );
            return Err(UsageError::BadParent.into());
        }
        // The parent's contents were already copied into the extras
        // region; patch the pointer word there.
        let rel = parent
            .buffer
            .checked_sub(extras_base)
            .and_then(|r| r.checked_add(bp.parent_offset))
            .filter(|r| r + word <= extras.len() as u64)
            .ok_or(DeliveryError::from(UsageError::BadParent))?;
        LittleEndian::write_u64(&mut extras[rel as usize..], new_addr);
    }
    *last_fixup = Some((index as u64, 0));
    write_object(data, off, &bp);
    Ok(())
}

/// Translates every descriptor of an fd-array in place inside its parent's
/// copied contents.
fn translate_fd_array(
    proc: &Arc<Process>,
    target_proc: &Arc<Process>,
    target_node: &Option<Arc<Node>>,
    in_reply_to: Option<&Transaction>,
    data: &[u8],
    offsets: &[u64],
    index: usize,
    off: u64,
    extras: &mut [u8],
    extras_base: u64,
    last_fixup: &mut Option<(u64, u64)>,
) -> Result<(), DeliveryError> {
    let fda: FdArrayObject = read_object(data, off);
    let Some(parent) = validate_ptr(data, offsets, fda.parent, index as u64)
    else {
        log::warn!(
            "{} got transaction with invalid parent offset or type",
            proc.pid
        );
        return Err(UsageError::BadParent.into());
    };
    if !validate_fixup(
        data,
        offsets,
        fda.parent,
        fda.parent_offset,
        *last_fixup,
    ) {
        log::warn!(
            "{} got transaction with out-of-order buffer fixup",
            proc.pid
        );
        return Err(UsageError::FixupOutOfOrder.into());
    }
    let fd_size = core::mem::size_of::<u32>() as u64;
    let fd_buf_size = match fda.num_fds.checked_mul(fd_size) {
        Some(s) => s,
        None => {
            log::warn!(
                "{} got transaction with invalid number of fds ({})",
                proc.pid,
                fda.num_fds
            );
            return Err(UsageError::BadParent.into());
        }
    };
    if fd_buf_size > parent.length
        || fda.parent_offset > parent.length - fd_buf_size
    {
        log::warn!(
            "{} not enough space to store {} fds in buffer",
            proc.pid,
            fda.num_fds
        );
        return Err(UsageError::BadParent.into());
    }
    let rel = parent
        .buffer
        .checked_sub(extras_base)
        .and_then(|r| r.checked_add(fda.parent_offset))
        .filter(|r| r + fd_buf_size <= extras.len() as u64)
        .ok_or(DeliveryError::from(UsageError::BadParent))?;
    if rel % fd_size != 0 {
        log::warn!("{} parent offset not aligned correctly", proc.pid);
        return Err(UsageError::BadAlignment.into());
    }

    for i in 0..fda.num_fds {
        let at = (rel + i * fd_size) as usize;
        let fd = LittleEndian::read_u32(&extras[at..]);
        match translate_fd(proc, target_proc, target_node, in_reply_to, fd) {
            Ok(new_fd) => {
                LittleEndian::write_u32(&mut extras[at..], new_fd);
            }
            Err(e) => {
                // Close whatever we already installed.
                for j in 0..i {
                    let at = (rel + j * fd_size) as usize;
                    let installed = LittleEndian::read_u32(&extras[at..]);
                    target_proc.files.close(installed);
                }
                return Err(e);
            }
        }
    }
    *last_fixup = Some((fda.parent, fda.parent_offset + fd_buf_size));
    Ok(())
}

/// Reverses the effects of the first `upto` translated objects and frees
/// the buffer. Used when translation or dispatch fails partway.
fn unwind_failed_buffer(
    target_proc: &Arc<Process>,
    buffer: &Arc<Buffer>,
    data: &[u8],
    extras: &[u8],
    offsets: &[u64],
    upto: usize,
) {
    if let Some(node) = buffer.target_node.lock().unwrap().take() {
        node.dec(true, false);
    }
    let extras_base = buffer.extras_addr();
    let read_parent = |addr: u64, len: u64| -> Option<Vec<u8>> {
        let rel = addr.checked_sub(extras_base)?;
        let end = rel.checked_add(len)?;
        if end > extras.len() as u64 {
            return None;
        }
        Some(extras[rel as usize..end as usize].to_vec())
    };
    release_buffer_objects(
        target_proc,
        data,
        offsets,
        upto,
        true,
        &read_parent,
    );
    *buffer.transaction.lock().unwrap() = Weak::new();
    target_proc.alloc.free_buf(buffer);
}

/// Releases the references and descriptors a delivered buffer carries;
/// the `FreeBuffer` path. The buffer's bytes are read back out of the
/// owner's mapping.
pub(crate) fn release_buffer(proc: &Arc<Process>, buffer: &Arc<Buffer>) {
    log::debug!(
        "{} buffer release {}, size {}-{}",
        proc.pid,
        buffer.debug_id,
        buffer.data_size,
        buffer.offsets_size
    );
    if let Some(node) = buffer.target_node.lock().unwrap().take() {
        node.dec(true, false);
    }
    let Ok(data) = proc.vm.read(buffer.data_addr(), buffer.data_size) else {
        return;
    };
    let Ok(offsets_bytes) =
        proc.vm.read(buffer.offsets_addr(), buffer.offsets_size)
    else {
        return;
    };
    let offsets: Vec<u64> = offsets_bytes
        .chunks_exact(OFFSET_WORD as usize)
        .map(LittleEndian::read_u64)
        .collect();
    let read_parent =
        |addr: u64, len: u64| -> Option<Vec<u8>> { proc.vm.read(addr, len).ok() };
    release_buffer_objects(proc, &data, &offsets, offsets.len(), false, &read_parent);
}

/// Walks the first `upto` objects of a buffer and undoes each one's
/// reference effect. `close_fds` distinguishes the failure unwind (plain
/// fds were installed and must be closed) from a normal free (the receiver
/// owns them now). Fd-array descriptors are owned by the buffer and are
/// closed in both cases.
fn release_buffer_objects(
    proc: &Arc<Process>,
    data: &[u8],
    offsets: &[u64],
    upto: usize,
    close_fds: bool,
    read_parent: &dyn Fn(u64, u64) -> Option<Vec<u8>>,
) {
    for (idx, &off) in offsets.iter().take(upto).enumerate() {
        let Some((kind, _)) = validate_object(data, off) else {
            log::error!(
                "buffer release: bad object at offset {}, size {}",
                off,
                data.len()
            );
            continue;
        };
        match kind {
            ObjectKind::Binder | ObjectKind::WeakBinder => {
                let fp: FlatObject = read_object(data, off);
                let Some(node) = proc.find_node(ObjPtr(fp.a)) else {
                    log::error!(
                        "buffer release: bad node u{:#x}",
                        fp.a
                    );
                    continue;
                };
                log::debug!(
                    "        node {} u{:#x}",
                    node.debug_id,
                    node.ptr.0
                );
                node.dec(kind == ObjectKind::Binder, false);
                node.tmp_dec();
            }
            ObjectKind::Handle | ObjectKind::WeakHandle => {
                let fp: FlatObject = read_object(data, off);
                match proc.update_ref_for_handle(
                    fp.handle(),
                    false,
                    kind == ObjectKind::Handle,
                ) {
                    Ok(info) => log::debug!(
                        "        ref {} handle {}",
                        info.debug_id,
                        info.handle.0
                    ),
                    Err(e) => log::error!(
                        "buffer release: bad handle {}: {:?}",
                        fp.handle().0,
                        e
                    ),
                }
            }
            ObjectKind::Fd => {
                if close_fds {
                    let fp: FdObject = read_object(data, off);
                    log::debug!("        fd {}", fp.fd);
                    proc.files.close(fp.fd);
                }
            }
            ObjectKind::Ptr => {
                // Cleaned up with the buffer itself.
            }
            ObjectKind::FdArray => {
                let fda: FdArrayObject = read_object(data, off);
                let Some(parent) =
                    validate_ptr(data, offsets, fda.parent, idx as u64)
                else {
                    log::error!("buffer release: bad parent offset");
                    continue;
                };
                let fd_size = core::mem::size_of::<u32>() as u64;
                let Some(fd_buf_size) = fda.num_fds.checked_mul(fd_size)
                else {
                    continue;
                };
                if fd_buf_size > parent.length
                    || fda.parent_offset > parent.length - fd_buf_size
                {
                    log::error!(
                        "buffer release: not enough space for {} fds",
                        fda.num_fds
                    );
                    continue;
                }
                let Some(words) = read_parent(
                    parent.buffer + fda.parent_offset,
                    fd_buf_size,
                ) else {
                    continue;
                };
                for chunk in words.chunks_exact(fd_size as usize) {
                    proc.files.close(LittleEndian::read_u32(chunk));
                }
            }
        }
    }
}

/// Walks a failed synchronous transaction's caller chain and delivers the
/// error to the deepest caller still alive.
pub(crate) fn send_failed_reply(t: Arc<Transaction>, code: Return) {
    assert!(!t.is_oneway());
    let mut t = t;
    loop {
        match t.from_thread() {
            Some(target) => {
                log::debug!(
                    "send failed reply for transaction {} to {}:{}",
                    t.debug_id,
                    target.proc.pid,
                    target.tid
                );
                {
                    let mut st = target.state.lock().unwrap();
                    let from_parent =
                        t.peers.lock().unwrap().from_parent.clone();
                    match &st.stack {
                        Some(top) if Arc::ptr_eq(top, &t) => {
                            st.stack = from_parent;
                        }
                        _ => log::error!(
                            "failed-reply target stack does not match \
                             transaction {}",
                            t.debug_id
                        ),
                    }
                }
                t.peers.lock().unwrap().from = None;
                crate::thread::set_reply_error(&target, code);
                target.tmp_dec();
                t.free();
                return;
            }
            None => {
                let next = t.peers.lock().unwrap().from_parent.clone();
                log::debug!(
                    "send failed reply for transaction {}, target dead",
                    t.debug_id
                );
                t.free();
                match next {
                    Some(n) => t = n,
                    None => return,
                }
            }
        }
    }
}
