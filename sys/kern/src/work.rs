// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Work items and the queues that carry them.
//!
//! There are separate work lists for processes, threads, and nodes (async).
//! All are FIFO. A process-queue wake uses a wake-one discipline: any one
//! waiting thread may pick the item up.

use std::sync::Arc;

use crate::node::{DeathRecord, Node};
use crate::process::Process;
use crate::thread::Thread;
use crate::transaction::Transaction;

/// Which preallocated error slot of a thread a queued error record reads
/// from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ErrorSlot {
    /// Errors this thread originated.
    Origin,
    /// Reply errors routed to this thread from a callee.
    Reply,
}

/// One entry on a todo list.
#[derive(Clone)]
pub(crate) enum Work {
    /// Deliver a transaction or reply.
    Transaction(Arc<Transaction>),
    /// Tell the thread its last send was accepted.
    TransactionComplete,
    /// Emit and clear one of the thread's error slots.
    Error(ErrorSlot),
    /// Re-derive a node's reference-notification state and emit the
    /// resulting records.
    Node(Arc<Node>),
    /// Death-notification delivery; the record's own state distinguishes
    /// dead, dead-and-clear, and clear-acknowledged.
    Death(Arc<DeathRecord>),
}

impl core::fmt::Debug for Work {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Transaction(t) => write!(f, "Transaction({})", t.debug_id),
            Self::TransactionComplete => write!(f, "TransactionComplete"),
            Self::Error(slot) => write!(f, "Error({slot:?})"),
            Self::Node(n) => write!(f, "Node({})", n.debug_id),
            Self::Death(d) => write!(f, "Death({:#x})", d.cookie.0),
        }
    }
}

/// Where a work item should land.
#[derive(Clone)]
pub(crate) enum WorkTarget {
    Proc(Arc<Process>),
    Thread(Arc<Thread>),
}

impl WorkTarget {
    pub(crate) fn push(&self, work: Work, wake: bool) {
        match self {
            Self::Proc(p) => push_proc(p, work, wake),
            Self::Thread(t) => push_thread(t, work, wake),
        }
    }
}

/// Enqueues onto a process's shared todo list, optionally waking one
/// waiting thread.
pub(crate) fn push_proc(proc: &Process, work: Work, wake: bool) {
    let mut inner = proc.inner.lock().unwrap();
    inner.todo.push_back(work);
    if wake {
        proc.wait.notify_one();
    }
}

/// Enqueues onto a thread's private todo list, optionally waking it.
pub(crate) fn push_thread(thread: &Thread, work: Work, wake: bool) {
    let mut state = thread.state.lock().unwrap();
    state.todo.push_back(work);
    drop(state);
    if wake {
        thread.wait.notify_all();
    }
}

/// Enqueue variant that refuses a dead process. The dead check and the
/// enqueue happen under one lock acquisition so a concurrent release
/// cannot slip between them and strand the work.
pub(crate) fn push_proc_if_alive(proc: &Process, work: Work) -> bool {
    let mut inner = proc.inner.lock().unwrap();
    if inner.is_dead {
        return false;
    }
    inner.todo.push_back(work);
    proc.wait.notify_one();
    true
}

/// Enqueue variant that refuses a dead thread; see
/// [`push_proc_if_alive`].
pub(crate) fn push_thread_if_alive(thread: &Thread, work: Work) -> bool {
    let mut state = thread.state.lock().unwrap();
    if state.is_dead {
        return false;
    }
    state.todo.push_back(work);
    drop(state);
    thread.wait.notify_all();
    true
}
