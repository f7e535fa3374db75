// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processes and the references they hold.
//!
//! One `Process` exists per open of the driver. Its outer lock guards the
//! four index trees (worker threads, owned nodes, references by handle,
//! references by node); its inner lock guards the shared todo queue, the
//! delivered-death list, and the thread-pool accounting. The engine-facing
//! reference operations here keep both reference indexes, the node's
//! binding set, and the node's internal counts in step.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use ferry_abi::{Cookie, Handle, Nice, NodePolicy, ObjPtr, UsageError};

use crate::alloc::Allocator;
use crate::driver::{Context, DriverShared};
use crate::files::FdTable;
use crate::node::{Node, RefBinding};
use crate::thread::Thread;
use crate::umem::AddressSpace;
use crate::work::{Work, WorkTarget};

/// Reference counts of one held reference. Guarded by its own lock, always
/// taken under the holder's outer lock.
#[derive(Debug, Default)]
pub(crate) struct RefCounts {
    pub strong: u32,
    pub weak: u32,
}

/// A capability held by one process against a node (usually in another
/// process).
pub(crate) struct NodeRef {
    pub debug_id: u32,
    pub handle: Handle,
    pub node: Arc<Node>,
    pub counts: Mutex<RefCounts>,
}

/// Snapshot of a reference's identity and counts, for logging and for
/// rewriting wire objects.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RefInfo {
    pub debug_id: u32,
    pub handle: Handle,
    pub strong: u32,
    pub weak: u32,
}

impl NodeRef {
    fn info(&self, counts: &RefCounts) -> RefInfo {
        RefInfo {
            debug_id: self.debug_id,
            handle: self.handle,
            strong: counts.strong,
            weak: counts.weak,
        }
    }
}

pub(crate) struct ProcIndexes {
    pub threads: BTreeMap<u32, Arc<Thread>>,
    pub nodes: BTreeMap<ObjPtr, Arc<Node>>,
    pub refs_by_handle: BTreeMap<u32, Arc<NodeRef>>,
    /// Keyed by target node debug id, for lookup when re-sending the same
    /// object.
    pub refs_by_node: BTreeMap<u32, Arc<NodeRef>>,
}

pub(crate) struct ProcInner {
    pub todo: VecDeque<Work>,
    pub delivered_death: Vec<Arc<crate::node::DeathRecord>>,
    pub is_dead: bool,
    /// Transient uses of this process by in-flight operations; blocks the
    /// final free while nonzero.
    pub tmp_refs: u32,
    pub max_threads: u32,
    pub requested_threads: u32,
    pub requested_started: u32,
    pub ready_threads: u32,
}

pub struct Process {
    pub pid: u32,
    pub euid: u32,
    pub(crate) driver: Arc<DriverShared>,
    pub(crate) context: Arc<Context>,
    pub(crate) outer: Mutex<ProcIndexes>,
    pub(crate) inner: Mutex<ProcInner>,
    /// Paired with `inner`; threads in proc-work mode sleep here.
    pub(crate) wait: Condvar,
    pub vm: AddressSpace,
    pub(crate) alloc: Allocator,
    pub files: FdTable,
    pub default_nice: Nice,
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

impl Process {
    pub(crate) fn new(
        driver: Arc<DriverShared>,
        context: Arc<Context>,
        pid: u32,
        euid: u32,
        default_nice: Nice,
        scratch_size: usize,
        fd_limit: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            euid,
            driver,
            context,
            outer: Mutex::new(ProcIndexes {
                threads: BTreeMap::new(),
                nodes: BTreeMap::new(),
                refs_by_handle: BTreeMap::new(),
                refs_by_node: BTreeMap::new(),
            }),
            inner: Mutex::new(ProcInner {
                todo: VecDeque::new(),
                delivered_death: Vec::new(),
                is_dead: false,
                tmp_refs: 0,
                max_threads: 0,
                requested_threads: 0,
                requested_started: 0,
                ready_threads: 0,
            }),
            wait: Condvar::new(),
            vm: AddressSpace::new(scratch_size),
            alloc: Allocator::new(),
            files: FdTable::new(fd_limit),
            default_nice,
        })
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.inner.lock().unwrap().is_dead
    }

    /// Finds or registers the worker-thread record for OS thread `tid`.
    pub(crate) fn get_thread(self: &Arc<Self>, tid: u32) -> Arc<Thread> {
        let mut outer = self.outer.lock().unwrap();
        if let Some(t) = outer.threads.get(&tid) {
            return Arc::clone(t);
        }
        let thread = Thread::new(Arc::clone(self), tid, self.default_nice);
        outer.threads.insert(tid, Arc::clone(&thread));
        thread
    }

    /// Looks up an owned node by exported pointer, taking a transient pin.
    pub(crate) fn find_node(&self, ptr: ObjPtr) -> Option<Arc<Node>> {
        let outer = self.outer.lock().unwrap();
        let node = outer.nodes.get(&ptr)?;
        node.tmp_inc();
        Some(Arc::clone(node))
    }

    /// Looks up or creates the node for an exported object. The returned
    /// node carries a transient pin either way.
    pub(crate) fn node_for_ptr(
        self: &Arc<Self>,
        ptr: ObjPtr,
        cookie: Cookie,
        policy: NodePolicy,
        is_manager: bool,
    ) -> Arc<Node> {
        let mut outer = self.outer.lock().unwrap();
        if let Some(node) = outer.nodes.get(&ptr) {
            node.tmp_inc();
            return Arc::clone(node);
        }
        let node = Node::new(
            self,
            ptr,
            cookie,
            policy,
            is_manager,
            self.driver.next_id(),
            Arc::clone(&self.driver.dead_nodes),
        );
        outer.nodes.insert(ptr, Arc::clone(&node));
        node
    }

    /// Resolves a handle to the reference it names. `need_strong` enforces
    /// the weak-as-strong check.
    pub(crate) fn get_ref(
        &self,
        handle: Handle,
        need_strong: bool,
    ) -> Result<Arc<NodeRef>, UsageError> {
        let outer = self.outer.lock().unwrap();
        Self::get_ref_locked(&outer, handle, need_strong)
    }

    fn get_ref_locked(
        outer: &ProcIndexes,
        handle: Handle,
        need_strong: bool,
    ) -> Result<Arc<NodeRef>, UsageError> {
        let r = outer
            .refs_by_handle
            .get(&handle.0)
            .ok_or(UsageError::BadHandle(handle.0))?;
        if need_strong && r.counts.lock().unwrap().strong == 0 {
            log::warn!("tried to use weak ref {} as strong", handle.0);
            return Err(UsageError::WeakAsStrong(handle.0));
        }
        Ok(Arc::clone(r))
    }

    /// Smallest unused handle, with 0 reserved for the context-manager
    /// node.
    fn alloc_handle(outer: &ProcIndexes, is_manager: bool) -> Handle {
        if is_manager {
            return Handle::CONTEXT_MANAGER;
        }
        let mut h = 1;
        for k in outer.refs_by_handle.keys() {
            if *k < h {
                continue;
            } else if *k == h {
                h += 1;
            } else {
                break;
            }
        }
        Handle(h)
    }

    /// Increments this process's reference to `node`, creating the
    /// reference (with the smallest unused handle) if none exists yet.
    /// `target` is the queue on which any resulting node-notification work
    /// is delivered.
    pub(crate) fn inc_ref_for_node(
        self: &Arc<Self>,
        node: &Arc<Node>,
        strong: bool,
        target: Option<&WorkTarget>,
    ) -> Result<RefInfo, UsageError> {
        let mut outer = self.outer.lock().unwrap();
        let nref = match outer.refs_by_node.get(&node.debug_id) {
            Some(r) => Arc::clone(r),
            None => {
                let handle = Self::alloc_handle(&outer, node.is_manager);
                let nref = Arc::new(NodeRef {
                    debug_id: self.driver.next_id(),
                    handle,
                    node: Arc::clone(node),
                    counts: Mutex::new(RefCounts::default()),
                });
                outer.refs_by_handle.insert(handle.0, Arc::clone(&nref));
                outer.refs_by_node.insert(node.debug_id, Arc::clone(&nref));
                let mut st = node.state.lock().unwrap();
                st.refs.push(RefBinding {
                    holder: Arc::downgrade(self),
                    holder_pid: self.pid,
                    node_ref: Arc::downgrade(&nref),
                    death: None,
                });
                drop(st);
                log::debug!(
                    "{}: new ref {} handle {} for node {}",
                    self.pid,
                    nref.debug_id,
                    handle.0,
                    node.debug_id
                );
                nref
            }
        };

        let mut counts = nref.counts.lock().unwrap();
        if strong {
            if counts.strong == 0 {
                nref.node.inc(true, true, target)?;
            }
            counts.strong += 1;
        } else {
            if counts.weak == 0 {
                nref.node.inc(false, true, target)?;
            }
            counts.weak += 1;
        }
        Ok(nref.info(&counts))
    }

    /// Applies a user-requested increment or decrement to the reference
    /// named by `handle`. Handle 0 increments resolve through the context
    /// manager, creating the reference on first use.
    pub(crate) fn update_ref_for_handle(
        self: &Arc<Self>,
        handle: Handle,
        increment: bool,
        strong: bool,
    ) -> Result<RefInfo, UsageError> {
        if increment && handle.is_context_manager() {
            let manager =
                self.context.manager_node().ok_or(UsageError::BadHandle(0))?;
            let info = self.inc_ref_for_node(&manager, strong, None)?;
            manager.tmp_dec();
            return info_check(handle, info);
        }

        if increment {
            let outer = self.outer.lock().unwrap();
            let nref = Self::get_ref_locked(&outer, handle, strong)?;
            let mut counts = nref.counts.lock().unwrap();
            if strong {
                if counts.strong == 0 {
                    nref.node.inc(true, true, None)?;
                }
                counts.strong += 1;
            } else {
                if counts.weak == 0 {
                    nref.node.inc(false, true, None)?;
                }
                counts.weak += 1;
            }
            return Ok(nref.info(&counts));
        }

        // Decrement. Count updates and index removal happen under the
        // outer lock; the node-side effects run after it drops, so that a
        // reap never takes two processes' outer locks at once.
        let (nref, info, strong_zeroed, dead_ref) = {
            let mut outer = self.outer.lock().unwrap();
            let nref = Self::get_ref_locked(&outer, handle, strong)?;
            let mut counts = nref.counts.lock().unwrap();
            if strong {
                if counts.strong == 0 {
                    log::warn!(
                        "{}: invalid dec strong, ref {} handle {}",
                        self.pid,
                        nref.debug_id,
                        handle.0
                    );
                    return Err(UsageError::BadDecrement);
                }
                counts.strong -= 1;
            } else {
                if counts.weak == 0 {
                    log::warn!(
                        "{}: invalid dec weak, ref {} handle {}",
                        self.pid,
                        nref.debug_id,
                        handle.0
                    );
                    return Err(UsageError::BadDecrement);
                }
                counts.weak -= 1;
            }
            let strong_zeroed = strong && counts.strong == 0;
            let dead_ref = counts.strong == 0 && counts.weak == 0;
            if dead_ref {
                outer.refs_by_handle.remove(&nref.handle.0);
                outer.refs_by_node.remove(&nref.node.debug_id);
            }
            let info = nref.info(&counts);
            drop(counts);
            (nref, info, strong_zeroed, dead_ref)
        };

        if strong_zeroed && !dead_ref {
            nref.node.dec(true, true);
        }
        if dead_ref {
            cleanup_ref(self, &nref, strong_zeroed);
        }
        Ok(info)
    }

    /// Enqueues deferred-release bookkeeping; see [`Process::release`].
    pub(crate) fn tmp_inc(&self) {
        self.inner.lock().unwrap().tmp_refs += 1;
    }

    pub(crate) fn tmp_dec(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tmp_refs = inner.tmp_refs.saturating_sub(1);
        if inner.is_dead && inner.tmp_refs == 0 {
            log::debug!("{}: process bookkeeping complete", self.pid);
        }
    }

    /// Full teardown, run from the deferred-release worker once the client
    /// file is closed. Safe to call once; later calls are no-ops.
    pub(crate) fn release(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_dead {
                return;
            }
            inner.is_dead = true;
            inner.tmp_refs += 1;
        }
        log::debug!("{}: release", self.pid);

        // The context-manager slot reopens if we held it.
        self.context.clear_manager_if_owned(self);

        // Kick any thread still blocked in the driver.
        crate::thread::flush_threads(self);

        // Threads first: repair transaction stacks and fail outstanding
        // synchronous calls.
        loop {
            let thread = {
                let outer = self.outer.lock().unwrap();
                outer.threads.values().next().cloned()
            };
            match thread {
                Some(t) => {
                    crate::thread::release_thread(self, &t);
                }
                None => break,
            }
        }

        // Nodes: detach each one; survivors with remote refs move to the
        // dead-nodes list and fire death notifications.
        loop {
            let node = {
                let mut outer = self.outer.lock().unwrap();
                let first = outer.nodes.keys().next().copied();
                first.map(|ptr| {
                    let n = outer.nodes.remove(&ptr).unwrap();
                    n.tmp_inc();
                    n
                })
            };
            match node {
                Some(n) => {
                    n.release(self);
                    n.tmp_dec();
                }
                None => break,
            }
        }

        // References we hold on other processes' nodes.
        let refs: Vec<Arc<NodeRef>> = {
            let mut outer = self.outer.lock().unwrap();
            outer.refs_by_node.clear();
            core::mem::take(&mut outer.refs_by_handle)
                .into_values()
                .collect()
        };
        for nref in refs {
            let strong_held = nref.counts.lock().unwrap().strong > 0;
            cleanup_ref(self, &nref, strong_held);
        }

        // Work that never got delivered.
        let todo: Vec<Work> = {
            let mut inner = self.inner.lock().unwrap();
            inner.delivered_death.clear();
            inner.todo.drain(..).collect()
        };
        release_work(self, todo);

        // Buffers still sitting in the mapping. Their target nodes are our
        // own and have already been detached above, so the admission counts
        // they carry die with them.
        for buffer in self.alloc.release() {
            if let Some(txn) = buffer.transaction.lock().unwrap().upgrade() {
                txn.clear_buffer();
            }
            let _ = buffer.target_node.lock().unwrap().take();
        }

        self.tmp_dec();
    }
}

/// Final unbinding of a reference from its node: removes the binding,
/// releases the counts the reference contributed, and discards any death
/// registration. Called with no engine locks held.
pub(crate) fn cleanup_ref(
    holder: &Arc<Process>,
    nref: &Arc<NodeRef>,
    strong_held: bool,
) {
    log::debug!(
        "{}: delete ref {} handle {} for node {}",
        holder.pid,
        nref.debug_id,
        nref.handle.0,
        nref.node.debug_id
    );
    let death = {
        let mut st = nref.node.state.lock().unwrap();
        let me = Arc::as_ptr(nref);
        let idx = st
            .refs
            .iter()
            .position(|b| core::ptr::eq(b.node_ref.as_ptr(), me));
        idx.map(|i| st.refs.remove(i)).and_then(|b| b.death)
    };
    if strong_held {
        nref.node.dec(true, true);
    }
    nref.node.dec(false, true);

    if let Some(death) = death {
        log::debug!(
            "{}: ref {} had death registration",
            holder.pid,
            nref.debug_id
        );
        crate::thread::dequeue_death(holder, &death);
    }
}

/// Disposes of work entries on a dying queue. Synchronous transactions
/// whose sender is still waiting get a dead reply; everything else is
/// dropped.
pub(crate) fn release_work(proc: &Arc<Process>, work: Vec<Work>) {
    for w in work {
        match w {
            Work::Transaction(t) => {
                if t.is_request() && !t.is_oneway() {
                    crate::transaction::send_failed_reply(
                        t,
                        ferry_abi::Return::DeadReply,
                    );
                } else {
                    log::debug!(
                        "{}: undelivered transaction {}",
                        proc.pid,
                        t.debug_id
                    );
                    t.free();
                }
            }
            Work::TransactionComplete | Work::Error(_) => {
                log::debug!("{}: undelivered completion/error", proc.pid);
            }
            Work::Node(node) => {
                node.state.lock().unwrap().queued = false;
            }
            Work::Death(death) => {
                log::debug!(
                    "{}: undelivered death notification {:#x}",
                    proc.pid,
                    death.cookie.0
                );
                death.state.lock().unwrap().queued_on = None;
            }
        }
    }
}

fn info_check(
    handle: Handle,
    info: RefInfo,
) -> Result<RefInfo, UsageError> {
    if info.handle != handle {
        log::warn!(
            "acquire on handle {} resolved to handle {}",
            handle.0,
            info.handle.0
        );
    }
    Ok(info)
}
