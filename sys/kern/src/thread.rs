// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker threads and the write/read pumps they drive.
//!
//! One `Thread` record exists per OS thread that has ever entered the
//! driver for a given process. The write pump consumes the command stream
//! one tagged record at a time; the read pump blocks until work is
//! available, then streams result records back, stopping early when it
//! delivers something the caller must act on.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use ferry_abi::{
    Command, Cookie, DeathRequest, Handle, Nice, NodeRecord, Return,
    TransactionData, TransactionDataSg, UsageError,
};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::err::IoctlError;
use crate::node::{DeathKind, DeathRecord, Node, WorkSite};
use crate::process::Process;
use crate::work::{ErrorSlot, Work};

bitflags::bitflags! {
    /// Looper lifecycle bits. Only the owning thread changes these, apart
    /// from teardown.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) struct LooperFlags: u32 {
        /// Spawned worker, announced with `RegisterLooper`.
        const REGISTERED = 1 << 0;
        /// Caller-owned worker, announced with `EnterLooper`.
        const ENTERED = 1 << 1;
        const EXITED = 1 << 2;
        /// Lifecycle commands arrived out of order.
        const INVALID = 1 << 3;
        /// Currently blocked in the read pump.
        const WAITING = 1 << 4;
    }
}

/// A pending record for one of the thread's preallocated error slots.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ErrorCode {
    pub code: Return,
    /// Payload for `Return::Error`; unused otherwise.
    pub param: u32,
}

pub(crate) struct ThreadInner {
    pub looper: LooperFlags,
    pub todo: std::collections::VecDeque<Work>,
    /// Top of this thread's transaction stack.
    pub stack: Option<Arc<crate::transaction::Transaction>>,
    /// Errors this thread originated.
    pub return_error: Option<ErrorCode>,
    /// Reply errors routed here from a callee.
    pub reply_error: Option<ErrorCode>,
    /// Simulated scheduling nicety of the underlying OS thread.
    pub nice: Nice,
    pub is_dead: bool,
}

pub struct Thread {
    pub tid: u32,
    pub(crate) proc: Arc<Process>,
    pub(crate) state: Mutex<ThreadInner>,
    /// Paired with `state`; wakes the thread out of a thread-work wait.
    pub(crate) wait: Condvar,
    /// Forces the thread back to user space at the next boundary. Readable
    /// without any lock.
    pub(crate) needs_return: AtomicBool,
    /// Transient uses of this record by in-flight transactions.
    pub(crate) tmp_refs: AtomicU32,
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("pid", &self.proc.pid)
            .field("tid", &self.tid)
            .finish()
    }
}

impl Thread {
    pub(crate) fn new(
        proc: Arc<Process>,
        tid: u32,
        nice: Nice,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid,
            proc,
            state: Mutex::new(ThreadInner {
                looper: LooperFlags::empty(),
                todo: std::collections::VecDeque::new(),
                stack: None,
                return_error: None,
                reply_error: None,
                nice,
                is_dead: false,
            }),
            wait: Condvar::new(),
            // A fresh thread returns to user space promptly on its first
            // read, giving the runtime a chance to finish setup.
            needs_return: AtomicBool::new(true),
            tmp_refs: AtomicU32::new(0),
        })
    }

    pub(crate) fn tmp_inc(&self) {
        self.tmp_refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tmp_dec(&self) {
        self.tmp_refs.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state.lock().unwrap().is_dead
    }

    pub(crate) fn current_nice(&self) -> Nice {
        self.state.lock().unwrap().nice
    }

    fn is_looper(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .looper
            .intersects(LooperFlags::REGISTERED | LooperFlags::ENTERED)
    }
}

/// Records an error this thread originated; it will surface as the next
/// record on the thread's read.
pub(crate) fn set_return_error(thread: &Thread, code: Return, param: u32) {
    let mut st = thread.state.lock().unwrap();
    if st.return_error.is_some() {
        log::warn!(
            "{}:{} dropping error {:?}, slot busy",
            thread.proc.pid,
            thread.tid,
            code
        );
        return;
    }
    st.return_error = Some(ErrorCode { code, param });
    st.todo.push_back(Work::Error(ErrorSlot::Origin));
    drop(st);
    thread.wait.notify_all();
}

/// Records a reply error routed to this thread from a callee's failure.
pub(crate) fn set_reply_error(thread: &Thread, code: Return) {
    let mut st = thread.state.lock().unwrap();
    if st.reply_error.is_some() {
        log::warn!(
            "{}:{} unexpected reply error {:?}, slot busy",
            thread.proc.pid,
            thread.tid,
            code
        );
        return;
    }
    st.reply_error = Some(ErrorCode { code, param: 0 });
    st.todo.push_back(Work::Error(ErrorSlot::Reply));
    drop(st);
    thread.wait.notify_all();
}

/// Cursor over the command stream.
struct Stream<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Stream<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u32(&mut self) -> Result<u32, IoctlError> {
        if self.remaining() < 4 {
            return Err(IoctlError::Fault);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, IoctlError> {
        if self.remaining() < 8 {
            return Err(IoctlError::Fault);
        }
        let v = LittleEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    fn obj<T: FromBytes>(&mut self) -> Result<T, IoctlError> {
        let n = core::mem::size_of::<T>();
        if self.remaining() < n {
            return Err(IoctlError::Fault);
        }
        let v = T::read_from_bytes(&self.buf[self.pos..self.pos + n])
            .map_err(|_| IoctlError::Fault)?;
        self.pos += n;
        Ok(v)
    }
}

/// Executes the write half of a `WriteRead`: consumes tagged records until
/// the stream ends, an unrecoverable stream error occurs, or the thread
/// picks up a pending error.
pub(crate) fn thread_write(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    stream: &[u8],
    consumed: &mut u64,
) -> Result<(), IoctlError> {
    let mut cur = Stream { buf: stream, pos: *consumed as usize };

    while cur.remaining() > 0 {
        if thread.state.lock().unwrap().return_error.is_some() {
            break;
        }
        let tag = cur.u32()?;
        let cmd = Command::try_from(tag).map_err(|t| {
            log::error!("{}:{} unknown command {}", proc.pid, thread.tid, t);
            IoctlError::Stream(UsageError::BadCommand(t))
        })?;
        match cmd {
            Command::IncRefs
            | Command::Acquire
            | Command::Release
            | Command::DecRefs => {
                let handle = Handle(cur.u32()?);
                let strong =
                    matches!(cmd, Command::Acquire | Command::Release);
                let increment =
                    matches!(cmd, Command::IncRefs | Command::Acquire);
                match proc.update_ref_for_handle(handle, increment, strong) {
                    Ok(info) => log::debug!(
                        "{}:{} {:?} ref {} handle {} s {} w {}",
                        proc.pid,
                        thread.tid,
                        cmd,
                        info.debug_id,
                        info.handle.0,
                        info.strong,
                        info.weak
                    ),
                    Err(e) => log::warn!(
                        "{}:{} {:?} on handle {} failed: {:?}",
                        proc.pid,
                        thread.tid,
                        cmd,
                        handle.0,
                        e
                    ),
                }
            }
            Command::IncRefsDone | Command::AcquireDone => {
                let rec: NodeRecord = cur.obj()?;
                let strong = cmd == Command::AcquireDone;
                ack_node_record(proc, thread, rec, strong);
            }
            Command::AttemptAcquire | Command::AcquireResult => {
                log::error!(
                    "{}:{} reserved command {:?}",
                    proc.pid,
                    thread.tid,
                    cmd
                );
                return Err(IoctlError::Stream(UsageError::ReservedCommand(
                    tag,
                )));
            }
            Command::FreeBuffer => {
                let user_ptr = cur.u64()?;
                free_buffer(proc, thread, user_ptr);
            }
            Command::Transaction | Command::Reply => {
                let tr: TransactionData = cur.obj()?;
                crate::transaction::transact(
                    proc,
                    thread,
                    &tr,
                    cmd == Command::Reply,
                    0,
                );
            }
            Command::TransactionSg | Command::ReplySg => {
                let tr: TransactionDataSg = cur.obj()?;
                crate::transaction::transact(
                    proc,
                    thread,
                    &tr.data,
                    cmd == Command::ReplySg,
                    tr.extras_size,
                );
            }
            Command::RegisterLooper => {
                log::debug!("{}:{} RegisterLooper", proc.pid, thread.tid);
                let entered = thread
                    .state
                    .lock()
                    .unwrap()
                    .looper
                    .contains(LooperFlags::ENTERED);
                let mut invalid = false;
                if entered {
                    log::warn!(
                        "{}:{} RegisterLooper after EnterLooper",
                        proc.pid,
                        thread.tid
                    );
                    invalid = true;
                } else {
                    let mut inner = proc.inner.lock().unwrap();
                    if inner.requested_threads == 0 {
                        log::warn!(
                            "{}:{} RegisterLooper without request",
                            proc.pid,
                            thread.tid
                        );
                        invalid = true;
                    } else {
                        inner.requested_threads -= 1;
                        inner.requested_started += 1;
                    }
                }
                let mut st = thread.state.lock().unwrap();
                if invalid {
                    st.looper |= LooperFlags::INVALID;
                }
                st.looper |= LooperFlags::REGISTERED;
            }
            Command::EnterLooper => {
                log::debug!("{}:{} EnterLooper", proc.pid, thread.tid);
                let mut st = thread.state.lock().unwrap();
                if st.looper.contains(LooperFlags::REGISTERED) {
                    log::warn!(
                        "{}:{} EnterLooper after RegisterLooper",
                        proc.pid,
                        thread.tid
                    );
                    st.looper |= LooperFlags::INVALID;
                }
                st.looper |= LooperFlags::ENTERED;
            }
            Command::ExitLooper => {
                log::debug!("{}:{} ExitLooper", proc.pid, thread.tid);
                thread.state.lock().unwrap().looper |= LooperFlags::EXITED;
            }
            Command::RequestDeathNotification => {
                let req: DeathRequest = cur.obj()?;
                request_death(proc, thread, req.handle, req.cookie);
            }
            Command::ClearDeathNotification => {
                let req: DeathRequest = cur.obj()?;
                clear_death(proc, thread, req.handle, req.cookie);
            }
            Command::DeadBinderDone => {
                let cookie = Cookie(cur.u64()?);
                dead_binder_done(proc, thread, cookie);
            }
        }
        *consumed = cur.pos as u64;
    }
    Ok(())
}

/// Handles `IncRefsDone`/`AcquireDone`: the owner acknowledges a
/// notification, releasing the count the driver parked on its behalf.
fn ack_node_record(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    rec: NodeRecord,
    strong: bool,
) {
    let what = if strong { "AcquireDone" } else { "IncRefsDone" };
    let Some(node) = proc.find_node(rec.ptr) else {
        log::warn!(
            "{}:{} {} u{:#x} no match",
            proc.pid,
            thread.tid,
            what,
            rec.ptr.0
        );
        return;
    };
    if rec.cookie != node.cookie {
        log::warn!(
            "{}:{} {} node {} cookie mismatch {:#x} != {:#x}",
            proc.pid,
            thread.tid,
            what,
            node.debug_id,
            rec.cookie.0,
            node.cookie.0
        );
        node.tmp_dec();
        return;
    }
    if let Err(e) = node.ack_ref_done(strong) {
        log::warn!(
            "{}:{} {} node {}: {:?}",
            proc.pid,
            thread.tid,
            what,
            node.debug_id,
            e
        );
    }
    node.tmp_dec();
}

/// Handles `FreeBuffer`: returns a delivered payload to the allocator,
/// promoting the next parked async transaction if this buffer was the one
/// in flight for its node.
fn free_buffer(proc: &Arc<Process>, thread: &Arc<Thread>, user_ptr: u64) {
    let buffer = match proc.alloc.prepare_to_free(user_ptr) {
        Ok(b) => b,
        Err(e) => {
            log::warn!(
                "{}:{} FreeBuffer u{:#x}: {:?}",
                proc.pid,
                thread.tid,
                user_ptr,
                e
            );
            return;
        }
    };
    log::debug!(
        "{}:{} FreeBuffer u{:#x} buffer {}",
        proc.pid,
        thread.tid,
        user_ptr,
        buffer.debug_id
    );

    if let Some(txn) = buffer.transaction.lock().unwrap().upgrade() {
        txn.clear_buffer();
    }
    *buffer.transaction.lock().unwrap() = std::sync::Weak::new();

    if buffer.is_async {
        let node = buffer.target_node.lock().unwrap().clone();
        if let Some(node) = node {
            let mut st = node.state.lock().unwrap();
            if !st.has_async_txn {
                log::error!(
                    "async buffer freed for node {} with no async in flight",
                    node.debug_id
                );
            }
            match st.async_todo.pop_front() {
                // Next parked send becomes the in-flight one; hand it to
                // the freeing thread, which is about to read anyway.
                Some(w) => crate::work::push_thread(thread, w, false),
                None => st.has_async_txn = false,
            }
        }
    }

    crate::transaction::release_buffer(proc, &buffer);
    proc.alloc.free_buf(&buffer);
}

/// Registers a death notification. The node lock is held across the
/// dead-check and the enqueue so a racing owner death cannot slip between
/// them: the registration observes exactly one of "owner alive" (the
/// broadcast will find it) or "owner dead" (immediate notification).
fn request_death(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    handle: Handle,
    cookie: Cookie,
) {
    let nref = match proc.get_ref(handle, false) {
        Ok(r) => r,
        Err(e) => {
            log::warn!(
                "{}:{} RequestDeathNotification invalid handle {}: {:?}",
                proc.pid,
                thread.tid,
                handle.0,
                e
            );
            return;
        }
    };
    let node = &nref.node;
    let mut st = node.state.lock().unwrap();
    let me = Arc::as_ptr(&nref);
    let Some(idx) =
        st.refs.iter().position(|b| core::ptr::eq(b.node_ref.as_ptr(), me))
    else {
        log::error!("ref {} missing its node binding", nref.debug_id);
        return;
    };
    if st.refs[idx].death.is_some() {
        log::warn!(
            "{}:{} death notification already set on handle {}",
            proc.pid,
            thread.tid,
            handle.0
        );
        return;
    }
    let death = DeathRecord::new(cookie);
    st.refs[idx].death = Some(Arc::clone(&death));
    if st.owner.is_none() {
        // Already dead at registration time: notify immediately, on the
        // calling thread if it serves work, else on the process queue.
        if thread.is_looper() {
            death.state.lock().unwrap().queued_on =
                Some(WorkSite::Thread(thread.tid));
            crate::work::push_thread(thread, Work::Death(death), false);
        } else {
            death.state.lock().unwrap().queued_on = Some(WorkSite::Proc);
            crate::work::push_proc(proc, Work::Death(death), true);
        }
    }
}

/// Clears a death registration, handling the race where the death has
/// already been queued or delivered: in that case the record is transmuted
/// so the reader emits the death first and the clear-done on
/// acknowledgement.
fn clear_death(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    handle: Handle,
    cookie: Cookie,
) {
    let nref = match proc.get_ref(handle, false) {
        Ok(r) => r,
        Err(e) => {
            log::warn!(
                "{}:{} ClearDeathNotification invalid handle {}: {:?}",
                proc.pid,
                thread.tid,
                handle.0,
                e
            );
            return;
        }
    };
    let node = &nref.node;
    let mut st = node.state.lock().unwrap();
    let me = Arc::as_ptr(&nref);
    let Some(idx) =
        st.refs.iter().position(|b| core::ptr::eq(b.node_ref.as_ptr(), me))
    else {
        return;
    };
    let Some(death) = st.refs[idx].death.clone() else {
        log::warn!(
            "{}:{} ClearDeathNotification not active on handle {}",
            proc.pid,
            thread.tid,
            handle.0
        );
        return;
    };
    if death.cookie != cookie {
        log::warn!(
            "{}:{} ClearDeathNotification cookie mismatch {:#x} != {:#x}",
            proc.pid,
            thread.tid,
            death.cookie.0,
            cookie.0
        );
        return;
    }
    st.refs[idx].death = None;
    drop(st);

    let mut ds = death.state.lock().unwrap();
    if ds.queued_on.is_none() && !ds.delivered {
        ds.kind = DeathKind::Clear;
        if thread.is_looper() {
            ds.queued_on = Some(WorkSite::Thread(thread.tid));
            drop(ds);
            crate::work::push_thread(thread, Work::Death(death), false);
        } else {
            ds.queued_on = Some(WorkSite::Proc);
            drop(ds);
            crate::work::push_proc(proc, Work::Death(death), true);
        }
    } else {
        assert_eq!(ds.kind, DeathKind::Dead);
        ds.kind = DeathKind::DeadAndClear;
    }
}

/// Handles `DeadBinderDone`: removes the delivered entry and, if a clear
/// raced in while the death was outstanding, schedules the clear-done
/// record.
fn dead_binder_done(proc: &Arc<Process>, thread: &Arc<Thread>, cookie: Cookie) {
    let death = {
        let mut inner = proc.inner.lock().unwrap();
        let idx = inner
            .delivered_death
            .iter()
            .position(|d| d.cookie == cookie);
        idx.map(|i| inner.delivered_death.remove(i))
    };
    let Some(death) = death else {
        log::warn!(
            "{}:{} DeadBinderDone {:#x} not found",
            proc.pid,
            thread.tid,
            cookie.0
        );
        return;
    };
    let mut ds = death.state.lock().unwrap();
    ds.delivered = false;
    if ds.kind == DeathKind::DeadAndClear {
        ds.kind = DeathKind::Clear;
        if thread.is_looper() {
            ds.queued_on = Some(WorkSite::Thread(thread.tid));
            drop(ds);
            crate::work::push_thread(thread, Work::Death(death), false);
        } else {
            ds.queued_on = Some(WorkSite::Proc);
            drop(ds);
            crate::work::push_proc(proc, Work::Death(death), true);
        }
    }
}

/// Removes a death record from whatever queue it sits on; used when its
/// reference goes away.
pub(crate) fn dequeue_death(proc: &Arc<Process>, death: &Arc<DeathRecord>) {
    let site = death.state.lock().unwrap().queued_on;
    match site {
        None => {}
        Some(WorkSite::Proc) => {
            let mut inner = proc.inner.lock().unwrap();
            inner.todo.retain(|w| {
                !matches!(w, Work::Death(d) if Arc::ptr_eq(d, death))
            });
        }
        Some(WorkSite::Thread(tid)) => {
            let thread = {
                let outer = proc.outer.lock().unwrap();
                outer.threads.get(&tid).cloned()
            };
            if let Some(t) = thread {
                let mut st = t.state.lock().unwrap();
                st.todo.retain(|w| {
                    !matches!(w, Work::Death(d) if Arc::ptr_eq(d, death))
                });
            }
        }
    }
    let mut inner = proc.inner.lock().unwrap();
    inner.delivered_death.retain(|d| !Arc::ptr_eq(d, death));
    drop(inner);
    let mut ds = death.state.lock().unwrap();
    ds.queued_on = None;
    ds.delivered = false;
}

fn has_proc_work(proc: &Process, thread: &Thread) -> bool {
    !proc.inner.lock().unwrap().todo.is_empty()
        || thread.needs_return.load(Ordering::Relaxed)
}

fn has_thread_work(thread: &Thread) -> bool {
    !thread.state.lock().unwrap().todo.is_empty()
        || thread.needs_return.load(Ordering::Relaxed)
}

/// Non-blocking readiness check backing `poll`.
pub(crate) fn work_pending(proc: &Arc<Process>, thread: &Arc<Thread>) -> bool {
    let wait_for_proc = {
        let st = thread.state.lock().unwrap();
        st.stack.is_none() && st.todo.is_empty()
    };
    if wait_for_proc {
        has_proc_work(proc, thread)
    } else {
        has_thread_work(thread)
    }
}

fn push_record(out: &mut Vec<u8>, code: Return) {
    out.extend_from_slice(&(code as u32).to_le_bytes());
}

fn push_payload<T: IntoBytes + Immutable>(out: &mut Vec<u8>, payload: &T) {
    out.extend_from_slice(payload.as_bytes());
}

/// Executes the read half of a `WriteRead`: blocks until work arrives (or
/// returns `WouldBlock` for a non-blocking caller), then drains work into
/// `out` up to `capacity` bytes.
pub(crate) fn thread_read(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    out: &mut Vec<u8>,
    capacity: usize,
    non_block: bool,
) -> Result<(), IoctlError> {
    // Leading marker; may be upgraded to SpawnLooper below.
    push_record(out, Return::Noop);

    'retry: loop {
        let wait_for_proc = {
            let st = thread.state.lock().unwrap();
            st.stack.is_none() && st.todo.is_empty()
        };

        {
            let mut st = thread.state.lock().unwrap();
            st.looper |= LooperFlags::WAITING;
            if wait_for_proc {
                // Between dispatches the worker runs at the process
                // default.
                st.nice = proc.default_nice;
            }
        }
        if wait_for_proc {
            if !thread.is_looper() {
                log::warn!(
                    "{}:{} waiting for process work before looper \
                     registration",
                    proc.pid,
                    thread.tid
                );
            }
            let mut inner = proc.inner.lock().unwrap();
            inner.ready_threads += 1;
            if non_block {
                let ready = !inner.todo.is_empty()
                    || thread.needs_return.load(Ordering::Relaxed);
                if !ready {
                    inner.ready_threads -= 1;
                    drop(inner);
                    thread.state.lock().unwrap().looper &=
                        !LooperFlags::WAITING;
                    return Err(IoctlError::WouldBlock);
                }
            } else {
                while inner.todo.is_empty()
                    && !thread.needs_return.load(Ordering::Relaxed)
                {
                    inner = proc.wait.wait(inner).unwrap();
                }
            }
            inner.ready_threads -= 1;
        } else {
            let mut st = thread.state.lock().unwrap();
            if non_block {
                let ready = !st.todo.is_empty()
                    || thread.needs_return.load(Ordering::Relaxed);
                if !ready {
                    st.looper &= !LooperFlags::WAITING;
                    return Err(IoctlError::WouldBlock);
                }
            } else {
                while st.todo.is_empty()
                    && !thread.needs_return.load(Ordering::Relaxed)
                {
                    st = thread.wait.wait(st).unwrap();
                }
            }
        }
        thread.state.lock().unwrap().looper &= !LooperFlags::WAITING;

        loop {
            // Keep room for the largest record before dequeuing anything.
            let record_room =
                4 + core::mem::size_of::<TransactionData>();
            if capacity.saturating_sub(out.len()) < record_room {
                break 'retry;
            }

            let work = {
                let mut st = thread.state.lock().unwrap();
                match st.todo.pop_front() {
                    Some(w) => Some(w),
                    None => {
                        drop(st);
                        if wait_for_proc {
                            proc.inner.lock().unwrap().todo.pop_front()
                        } else {
                            None
                        }
                    }
                }
            };
            let Some(work) = work else {
                // Nothing left. If we produced nothing but the marker and
                // nobody is kicking us out, go back to sleep.
                if out.len() == 4
                    && !thread.needs_return.load(Ordering::Relaxed)
                {
                    continue 'retry;
                }
                break 'retry;
            };

            match work {
                Work::Error(slot) => {
                    let code = {
                        let mut st = thread.state.lock().unwrap();
                        match slot {
                            ErrorSlot::Origin => st.return_error.take(),
                            ErrorSlot::Reply => st.reply_error.take(),
                        }
                    };
                    match code {
                        Some(e) => {
                            push_record(out, e.code);
                            if e.code == Return::Error {
                                out.extend_from_slice(
                                    &e.param.to_le_bytes(),
                                );
                            }
                        }
                        None => log::error!(
                            "{}:{} error work with empty slot",
                            proc.pid,
                            thread.tid
                        ),
                    }
                }
                Work::TransactionComplete => {
                    push_record(out, Return::TransactionComplete);
                    log::debug!(
                        "{}:{} TransactionComplete",
                        proc.pid,
                        thread.tid
                    );
                }
                Work::Node(node) => {
                    do_node_work(proc, thread, &node, out);
                }
                Work::Death(death) => {
                    let kind = {
                        let mut ds = death.state.lock().unwrap();
                        ds.queued_on = None;
                        ds.kind
                    };
                    let code = match kind {
                        DeathKind::Clear => {
                            Return::ClearDeathNotificationDone
                        }
                        _ => Return::DeadBinder,
                    };
                    push_record(out, code);
                    out.extend_from_slice(&death.cookie.0.to_le_bytes());
                    log::debug!(
                        "{}:{} {:?} {:#x}",
                        proc.pid,
                        thread.tid,
                        code,
                        death.cookie.0
                    );
                    if code == Return::DeadBinder {
                        death.state.lock().unwrap().delivered = true;
                        proc.inner
                            .lock()
                            .unwrap()
                            .delivered_death
                            .push(death);
                        // Death notifications can cause transactions.
                        break 'retry;
                    }
                }
                Work::Transaction(t) => {
                    let stop = deliver_transaction(proc, thread, t, out);
                    if stop {
                        break 'retry;
                    }
                }
            }
        }
    }

    // If every worker is busy and the cap allows, ask for another thread
    // by upgrading the leading marker.
    let spawn = {
        let looper_ok = thread.is_looper();
        let mut inner = proc.inner.lock().unwrap();
        if inner.requested_threads == 0
            && inner.ready_threads == 0
            && inner.requested_started < inner.max_threads
            && looper_ok
        {
            inner.requested_threads += 1;
            true
        } else {
            false
        }
    };
    if spawn {
        log::debug!("{}:{} SpawnLooper", proc.pid, thread.tid);
        out[0..4].copy_from_slice(&(Return::SpawnLooper as u32).to_le_bytes());
    }
    Ok(())
}

/// Emits the records for one node-notification work item and advances the
/// per-direction state machines.
fn do_node_work(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    node: &Arc<Node>,
    out: &mut Vec<u8>,
) {
    let mut st = node.state.lock().unwrap();
    st.queued = false;
    let (strong, weak) = Node::compute_need(&st);
    let had_strong = st.has_strong;
    let had_weak = st.has_weak;

    if weak && !had_weak {
        st.has_weak = true;
        st.pending_weak = true;
        // The owner now holds a weak ref on the driver's behalf until it
        // acknowledges.
        st.local_weak += 1;
    }
    if strong && !had_strong {
        st.has_strong = true;
        st.pending_strong = true;
        st.local_strong += 1;
    }
    if !strong && had_strong {
        st.has_strong = false;
    }
    if !weak && had_weak {
        st.has_weak = false;
    }
    let gone = !strong && !weak;
    let owner = st.owner.clone();
    drop(st);

    let rec = NodeRecord { ptr: node.ptr, cookie: node.cookie };
    let mut emitted = false;
    if weak && !had_weak {
        push_record(out, Return::IncRefs);
        push_payload(out, &rec);
        emitted = true;
    }
    if strong && !had_strong {
        push_record(out, Return::Acquire);
        push_payload(out, &rec);
        emitted = true;
    }
    if !strong && had_strong {
        push_record(out, Return::Release);
        push_payload(out, &rec);
        emitted = true;
    }
    if !weak && had_weak {
        push_record(out, Return::DecRefs);
        push_payload(out, &rec);
        emitted = true;
    }
    if !emitted {
        log::debug!(
            "{}:{} node {} state unchanged",
            proc.pid,
            thread.tid,
            node.debug_id
        );
    }
    if gone {
        if let Some(owner) = owner {
            node.reap_from_owner(&owner);
        }
    }
}

/// Emits a `Transaction` or `Reply` record, applying the priority rule and
/// pushing a synchronous incoming frame onto this thread's stack. Returns
/// whether the read should stop so the caller can act.
fn deliver_transaction(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    t: Arc<crate::transaction::Transaction>,
    out: &mut Vec<u8>,
) -> bool {
    let Some(buffer) = t.buffer.lock().unwrap().clone() else {
        // The transaction lost its buffer to teardown; nothing to show.
        log::debug!("transaction {} without buffer dropped", t.debug_id);
        return false;
    };
    let target_node = buffer.target_node.lock().unwrap().clone();
    let oneway = t.is_oneway();

    let (code, target, cookie) = match &target_node {
        Some(node) => {
            let min = node.policy.min_nice;
            let mut st = thread.state.lock().unwrap();
            let saved = st.nice;
            t.set_saved_nice(saved);
            if t.priority.is_better_than(min) && !oneway {
                st.nice = t.priority;
            } else if !oneway || min.is_better_than(saved) {
                st.nice = min;
            }
            (Return::Transaction, node.ptr.0, node.cookie)
        }
        None => (Return::Reply, 0, ferry_abi::Cookie(0)),
    };

    let sender_pid = match t.from_thread() {
        Some(from) => {
            let pid = from.proc.pid;
            from.tmp_dec();
            pid
        }
        None => 0,
    };

    let rec = TransactionData {
        target,
        cookie,
        code: t.code,
        flags: t.flags.bits(),
        sender_pid,
        sender_euid: t.sender_euid,
        data_size: buffer.data_size,
        offsets_size: buffer.offsets_size,
        data_ptr: buffer.data_addr(),
        offsets_ptr: buffer.offsets_addr(),
    };
    push_record(out, code);
    push_payload(out, &rec);

    log::debug!(
        "{}:{} {:?} {} size {}-{}",
        proc.pid,
        thread.tid,
        code,
        t.debug_id,
        buffer.data_size,
        buffer.offsets_size
    );

    buffer.set_user_free(true);
    if code == Return::Transaction && !oneway {
        // Incoming synchronous frame: park it on our stack until the
        // reply goes out.
        let mut st = thread.state.lock().unwrap();
        let mut peers = t.peers.lock().unwrap();
        peers.to_parent = st.stack.take();
        peers.to_thread = Some(Arc::clone(thread));
        drop(peers);
        st.stack = Some(Arc::clone(&t));
    } else {
        t.free();
    }
    true
}

/// Tears down a thread's bookkeeping: repairs every in-flight transaction
/// that names it, fails the outstanding incoming call if any, and releases
/// undelivered work. Returns the number of repaired transactions.
pub(crate) fn release_thread(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
) -> u32 {
    proc.tmp_inc();
    thread.tmp_inc();
    {
        let mut outer = proc.outer.lock().unwrap();
        outer.threads.remove(&thread.tid);
    }

    let top = {
        let mut st = thread.state.lock().unwrap();
        st.is_dead = true;
        st.stack.take()
    };
    let send_reply = top.as_ref().and_then(|t| {
        let peers = t.peers.lock().unwrap();
        peers
            .to_thread
            .as_ref()
            .is_some_and(|tt| Arc::ptr_eq(tt, thread))
            .then(|| Arc::clone(t))
    });

    let mut active = 0;
    let mut cur = top;
    while let Some(t) = cur {
        active += 1;
        let mut peers = t.peers.lock().unwrap();
        let incoming = peers
            .to_thread
            .as_ref()
            .is_some_and(|tt| Arc::ptr_eq(tt, thread));
        log::debug!(
            "release {}:{} transaction {} {}, still active",
            proc.pid,
            thread.tid,
            t.debug_id,
            if incoming { "in" } else { "out" }
        );
        let next = if incoming {
            peers.to_proc = None;
            peers.to_thread = None;
            peers.to_parent.clone()
        } else {
            peers.from = None;
            peers.from_parent.clone()
        };
        drop(peers);
        if incoming {
            t.detach_buffer();
        }
        cur = next;
    }

    if let Some(t) = send_reply {
        crate::transaction::send_failed_reply(t, Return::DeadReply);
    }

    let leftover: Vec<Work> = {
        let mut st = thread.state.lock().unwrap();
        st.todo.drain(..).collect()
    };
    crate::process::release_work(proc, leftover);

    thread.tmp_dec();
    proc.tmp_dec();
    active
}

/// Sets `needs-return` on every thread of the process and wakes all
/// waiters, forcing them back to user space at the next boundary.
pub(crate) fn flush_threads(proc: &Arc<Process>) {
    let threads: Vec<Arc<Thread>> = {
        let outer = proc.outer.lock().unwrap();
        outer.threads.values().cloned().collect()
    };
    let mut woken = 0;
    for t in &threads {
        t.needs_return.store(true, Ordering::Relaxed);
        // Take the wait mutex before notifying so a thread between its
        // wait-predicate check and its sleep cannot miss the wakeup.
        let waiting = {
            let st = t.state.lock().unwrap();
            st.looper.contains(LooperFlags::WAITING)
        };
        if waiting {
            t.wait.notify_all();
            woken += 1;
        }
    }
    let _inner = proc.inner.lock().unwrap();
    proc.wait.notify_all();
    drop(_inner);
    log::debug!("flush {}: woke {} threads", proc.pid, woken);
}
