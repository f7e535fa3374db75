// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes: the engine-side representation of objects exported by a process.
//!
//! A node's identity is (owner process, user-space pointer). Its lifetime is
//! governed by four counters -- strong references held by other processes
//! through live references (`internal_strong`), strong and weak references
//! held by the owner's own user space (`local_strong`/`local_weak`), and
//! transient engine-only pins (`tmp_refs`) -- plus the set of cross-process
//! reference bindings. A node is destroyed only when all four counters are
//! zero *and* no bindings remain.
//!
//! When the owner process dies while remote references still exist, the
//! node is detached from its owner and parked on the global [`DeadNodes`]
//! list until the last remote reference and transient pin drop.
//!
//! Userspace-visible notification of count transitions runs through a
//! four-state machine per direction (clear -> pending -> held ->
//! pending-clear -> clear), driven by two inputs: the current refcount need
//! and acknowledgement from user space. The state lives in the `has_*` /
//! `pending_*` bits below; the transition-and-emit step is in the thread
//! read pump.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use ferry_abi::{Cookie, NodePolicy, ObjPtr, UsageError};

use crate::process::{NodeRef, Process};
use crate::work::{Work, WorkTarget};

/// Global list of nodes whose owner has exited but which are still pinned
/// by remote references or transient pins. Also serves as the fallback
/// serialization point for such nodes.
#[derive(Default)]
pub(crate) struct DeadNodes {
    list: Mutex<Vec<Arc<Node>>>,
}

impl DeadNodes {
    pub(crate) fn add(&self, node: Arc<Node>) {
        self.list.lock().unwrap().push(node);
    }

    fn remove(&self, node: &Node) {
        let mut list = self.list.lock().unwrap();
        if let Some(i) = list.iter().position(|n| n.debug_id == node.debug_id)
        {
            list.remove(i);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }
}

/// A cross-process edge: some process holds a reference to this node. Kept
/// as (peer, handle) rather than a direct pointer into the peer's tables;
/// the binding is traversed only under this node's lock.
pub(crate) struct RefBinding {
    pub holder: Weak<Process>,
    pub holder_pid: u32,
    pub node_ref: Weak<NodeRef>,
    /// Death registration attached to this binding's reference, if any.
    /// Guarded by the node lock, so owner-death broadcast and
    /// request/clear serialize against each other.
    pub death: Option<Arc<DeathRecord>>,
}

/// Which queue a death record currently sits on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WorkSite {
    Proc,
    Thread(u32),
}

/// What a queued death record will tell the reader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeathKind {
    /// The watched node's owner died.
    Dead,
    /// The owner died, and the holder also cleared the registration before
    /// delivery; the reader emits the death now and the clear-done on
    /// acknowledgement.
    DeadAndClear,
    /// The registration was cleared before any death.
    Clear,
}

#[derive(Debug)]
pub(crate) struct DeathState {
    pub kind: DeathKind,
    pub queued_on: Option<WorkSite>,
    /// Emitted to the holder but not yet acknowledged; sits on the
    /// holder's delivered-death list.
    pub delivered: bool,
}

/// A death-notification registration: links a reference to a user-supplied
/// cookie. Lives on exactly one work list at a time, or on none (idle /
/// delivered).
pub(crate) struct DeathRecord {
    pub cookie: Cookie,
    pub state: Mutex<DeathState>,
}

impl DeathRecord {
    pub(crate) fn new(cookie: Cookie) -> Arc<Self> {
        Arc::new(Self {
            cookie,
            state: Mutex::new(DeathState {
                kind: DeathKind::Dead,
                queued_on: None,
                delivered: false,
            }),
        })
    }
}

pub(crate) struct NodeState {
    /// Cleared when the owner exits; from then on the node is reachable
    /// only through the dead list and remote references.
    pub owner: Option<Arc<Process>>,
    pub internal_strong: u32,
    pub local_strong: u32,
    pub local_weak: u32,
    pub tmp_refs: u32,
    pub has_strong: bool,
    pub pending_strong: bool,
    pub has_weak: bool,
    pub pending_weak: bool,
    /// Whether this node's notification work is currently on a todo list.
    pub queued: bool,
    /// An async transaction is queued or in flight to this node.
    pub has_async_txn: bool,
    /// Async work parked behind the one in flight.
    pub async_todo: VecDeque<Work>,
    pub refs: Vec<RefBinding>,
}

/// Action a count decrement may require once the node's lock is released.
enum PostDec {
    None,
    /// Unlink the node from this owner's index (the node drained while
    /// still owned).
    Reap(Arc<Process>),
}

pub struct Node {
    pub debug_id: u32,
    pub ptr: ObjPtr,
    pub cookie: Cookie,
    pub policy: NodePolicy,
    /// The context-manager node is strongly referenced at birth by fiat and
    /// exempt from the 0->1 notification requirement.
    pub(crate) is_manager: bool,
    pub(crate) dead_nodes: Arc<DeadNodes>,
    pub(crate) state: Mutex<NodeState>,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("debug_id", &self.debug_id)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl Node {
    /// Creates a node owned by `owner`, with one transient pin held by the
    /// creating code path.
    pub(crate) fn new(
        owner: &Arc<Process>,
        ptr: ObjPtr,
        cookie: Cookie,
        policy: NodePolicy,
        is_manager: bool,
        debug_id: u32,
        dead_nodes: Arc<DeadNodes>,
    ) -> Arc<Self> {
        log::debug!(
            "{}: node {} u{:#x} c{:#x} created",
            owner.pid,
            debug_id,
            ptr.0,
            cookie.0
        );
        Arc::new(Self {
            debug_id,
            ptr,
            cookie,
            policy,
            is_manager,
            dead_nodes,
            state: Mutex::new(NodeState {
                owner: Some(Arc::clone(owner)),
                internal_strong: 0,
                local_strong: 0,
                local_weak: 0,
                tmp_refs: 1,
                has_strong: false,
                pending_strong: false,
                has_weak: false,
                pending_weak: false,
                queued: false,
                has_async_txn: false,
                async_todo: VecDeque::new(),
                refs: Vec::new(),
            }),
        })
    }

    /// Sets up the inflated initial state of the context-manager node: both
    /// directions held and acknowledged, so no bootstrap notification is
    /// required.
    pub(crate) fn prime_as_manager(&self) {
        let mut st = self.state.lock().unwrap();
        st.local_weak += 1;
        st.local_strong += 1;
        st.has_strong = true;
        st.has_weak = true;
    }

    /// Computes the current notification need from the counters: whether
    /// the owner must hold a strong ref, and whether it must remain
    /// addressable (weak).
    pub(crate) fn compute_need(st: &NodeState) -> (bool, bool) {
        let strong = st.internal_strong > 0 || st.local_strong > 0;
        let weak = !st.refs.is_empty()
            || st.local_weak > 0
            || st.tmp_refs > 0
            || strong;
        (strong, weak)
    }

    /// Increments a reference count.
    ///
    /// `internal` counts track remote holders (references); local counts
    /// track the owner's own user space. A strong internal 0->1 transition
    /// requires a queue to deliver the now-strongly-referenced notification
    /// on, except for the context-manager node.
    pub(crate) fn inc(
        self: &Arc<Self>,
        strong: bool,
        internal: bool,
        target: Option<&WorkTarget>,
    ) -> Result<(), UsageError> {
        let mut st = self.state.lock().unwrap();
        if strong {
            if internal {
                let manager_exempt =
                    self.is_manager && st.has_strong && st.owner.is_some();
                if target.is_none()
                    && st.internal_strong == 0
                    && !manager_exempt
                {
                    log::error!(
                        "invalid inc strong for node {}",
                        self.debug_id
                    );
                    return Err(UsageError::BadObject);
                }
                st.internal_strong += 1;
            } else {
                st.local_strong += 1;
            }
            if !st.has_strong && !st.queued {
                if let Some(target) = target {
                    st.queued = true;
                    target.push(Work::Node(Arc::clone(self)), false);
                }
            }
        } else {
            if !internal {
                st.local_weak += 1;
            }
            if !st.has_weak && !st.queued {
                let target = target.ok_or_else(|| {
                    log::error!(
                        "invalid inc weak for node {}",
                        self.debug_id
                    );
                    UsageError::BadObject
                })?;
                st.queued = true;
                target.push(Work::Node(Arc::clone(self)), false);
            }
        }
        Ok(())
    }

    /// Decrements a reference count and runs the teardown checks: a
    /// transition through zero enqueues notification work on the owner,
    /// and a fully-drained node is unlinked and dropped.
    pub(crate) fn dec(self: &Arc<Self>, strong: bool, internal: bool) {
        let action = {
            let mut st = self.state.lock().unwrap();
            self.dec_locked(&mut st, strong, internal)
        };
        if let PostDec::Reap(owner) = action {
            self.reap_from_owner(&owner);
        }
    }

    fn sub(count: &mut u32, what: &str, debug_id: u32) {
        if *count == 0 {
            log::warn!("node {debug_id}: {what} underflow");
        } else {
            *count -= 1;
        }
    }

    /// Shared tail of [`Node::dec`] and [`Node::tmp_dec`]; `st` is this
    /// node's own state guard. The returned action must be performed after
    /// the guard is released, since unlinking takes the owner's outer lock.
    fn dec_locked(
        self: &Arc<Self>,
        st: &mut NodeState,
        strong: bool,
        internal: bool,
    ) -> PostDec {
        if strong {
            if internal {
                Self::sub(
                    &mut st.internal_strong,
                    "internal strong",
                    self.debug_id,
                );
            } else {
                Self::sub(&mut st.local_strong, "local strong", self.debug_id);
            }
            if st.local_strong > 0 || st.internal_strong > 0 {
                return PostDec::None;
            }
        } else {
            if !internal {
                Self::sub(&mut st.local_weak, "local weak", self.debug_id);
            }
            if st.local_weak > 0 || st.tmp_refs > 0 || !st.refs.is_empty() {
                return PostDec::None;
            }
        }

        if st.owner.is_some() && (st.has_strong || st.has_weak) {
            // The owner has been told it holds this ref; it must be told to
            // let go. The reader re-derives the exact records from current
            // counters.
            if !st.queued {
                st.queued = true;
                let owner = st.owner.as_ref().unwrap();
                crate::work::push_proc(
                    owner,
                    Work::Node(Arc::clone(self)),
                    true,
                );
            }
        } else if st.refs.is_empty()
            && st.local_strong == 0
            && st.local_weak == 0
            && st.tmp_refs == 0
        {
            match st.owner.clone() {
                Some(owner) => {
                    if !st.queued {
                        return PostDec::Reap(owner);
                    }
                }
                None => {
                    self.dead_nodes.remove(self);
                    log::debug!("dead node {} deleted", self.debug_id);
                }
            }
        }
        PostDec::None
    }

    /// Acknowledges a delivered `IncRefs`/`Acquire` notification: clears
    /// the pending bit and releases the local count the driver parked on
    /// the owner's behalf when it sent the notification.
    pub(crate) fn ack_ref_done(
        self: &Arc<Self>,
        strong: bool,
    ) -> Result<(), UsageError> {
        let action = {
            let mut st = self.state.lock().unwrap();
            let pending = if strong {
                &mut st.pending_strong
            } else {
                &mut st.pending_weak
            };
            if !*pending {
                return Err(UsageError::NoPendingAck);
            }
            *pending = false;
            self.dec_locked(&mut st, strong, false)
        };
        if let PostDec::Reap(owner) = action {
            self.reap_from_owner(&owner);
        }
        Ok(())
    }

    /// Unlinks a fully-drained node from its owner's index. Takes the
    /// owner's outer lock first and rechecks, since the counters may have
    /// moved while no lock was held.
    pub(crate) fn reap_from_owner(self: &Arc<Self>, owner: &Arc<Process>) {
        let mut outer = owner.outer.lock().unwrap();
        let st = self.state.lock().unwrap();
        let drained = st.refs.is_empty()
            && st.internal_strong == 0
            && st.local_strong == 0
            && st.local_weak == 0
            && st.tmp_refs == 0
            && !st.queued;
        let still_owned =
            st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, owner));
        if drained && still_owned {
            outer.nodes.remove(&self.ptr);
            log::debug!("refless node {} deleted", self.debug_id);
        }
    }

    /// Snapshots the owning process, if it is still alive.
    pub(crate) fn owner(&self) -> Option<Arc<Process>> {
        self.state.lock().unwrap().owner.clone()
    }

    /// Takes a transient engine-only pin, blocking destruction while a code
    /// path traverses to this node outside its usual lock scope.
    pub(crate) fn tmp_inc(&self) {
        self.state.lock().unwrap().tmp_refs += 1;
    }

    /// Releases a transient pin and re-runs the teardown checks.
    pub(crate) fn tmp_dec(self: &Arc<Self>) {
        let action = {
            let mut st = self.state.lock().unwrap();
            Self::sub(&mut st.tmp_refs, "tmp ref", self.debug_id);
            // Weak-internal decrement releases no actual count; it exists
            // to run the free check above.
            self.dec_locked(&mut st, false, true)
        };
        if let PostDec::Reap(owner) = action {
            self.reap_from_owner(&owner);
        }
    }

    /// Called with the owner dying: detaches the node, parks it on the
    /// dead list if remote references remain, and queues death
    /// notifications for every binding that registered one. Returns the
    /// number of surviving remote references.
    ///
    /// The caller must hold a transient pin.
    pub(crate) fn release(self: &Arc<Self>, owner: &Arc<Process>) -> usize {
        // Async work parked on this node dies with it.
        let parked: Vec<Work> = {
            let mut st = self.state.lock().unwrap();
            st.async_todo.drain(..).collect()
        };
        crate::process::release_work(owner, parked);

        let mut st = self.state.lock().unwrap();
        st.queued = false;
        if st.refs.is_empty() && st.tmp_refs == 1 {
            // No remote holders; the caller's pin is the last thing keeping
            // the node and its drop will free it.
            return 0;
        }

        st.owner = None;
        st.local_strong = 0;
        st.local_weak = 0;
        self.dead_nodes.add(Arc::clone(self));

        let mut refs = 0;
        let mut deaths = 0;
        for binding in &st.refs {
            refs += 1;
            let Some(death) = binding.death.as_ref() else {
                continue;
            };
            deaths += 1;
            let Some(holder) = binding.holder.upgrade() else {
                continue;
            };
            {
                let mut ds = death.state.lock().unwrap();
                assert!(
                    ds.queued_on.is_none(),
                    "death record queued before owner death"
                );
                ds.queued_on = Some(WorkSite::Proc);
            }
            crate::work::push_proc(
                &holder,
                Work::Death(Arc::clone(death)),
                true,
            );
        }
        log::debug!(
            "node {} now dead, refs {}, death {}",
            self.debug_id,
            refs,
            deaths
        );
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn need_computation() {
        let mut st = NodeState {
            owner: None,
            internal_strong: 0,
            local_strong: 0,
            local_weak: 0,
            tmp_refs: 0,
            has_strong: false,
            pending_strong: false,
            has_weak: false,
            pending_weak: false,
            queued: false,
            has_async_txn: false,
            async_todo: VecDeque::new(),
            refs: Vec::new(),
        };
        assert_eq!(Node::compute_need(&st), (false, false));
        st.tmp_refs = 1;
        assert_eq!(Node::compute_need(&st), (false, true));
        st.internal_strong = 1;
        assert_eq!(Node::compute_need(&st), (true, true));
        st.internal_strong = 0;
        st.local_strong = 2;
        assert_eq!(Node::compute_need(&st), (true, true));
    }
}
