// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The driver surface: contexts, clients, the ioctl entry points, and
//! deferred cleanup.
//!
//! A [`Driver`] owns everything global -- the naming domains (contexts),
//! the process registry, the dead-node list, and a single-threaded
//! deferred-release worker that tears processes down out of band once
//! their clients close. A [`Client`] is one open of the driver: it owns a
//! [`Process`] and exposes the ioctl set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use ferry_abi::{
    Cookie, Nice, NodePolicy, ObjPtr, WriteRead, PROTOCOL_VERSION,
};

use crate::err::IoctlError;
use crate::files::{FdTable, File};
use crate::node::{DeadNodes, Node};
use crate::process::Process;
use crate::thread::Thread;
use crate::umem::AddressSpace;

/// Security-policy predicates consulted at transfer points. All default to
/// allow.
pub trait Policy: Send + Sync {
    fn may_transfer_binder(&self, _src: &Process, _dst: &Process) -> bool {
        true
    }
    fn may_transfer_file(
        &self,
        _src: &Process,
        _dst: &Process,
        _file: &File,
    ) -> bool {
        true
    }
    fn may_set_context_mgr(&self, _proc: &Process) -> bool {
        true
    }
    fn may_transact(&self, _src: &Process, _dst: &Process) -> bool {
        true
    }
}

struct AllowAll;

impl Policy for AllowAll {}

struct ManagerSlot {
    node: Option<Arc<Node>>,
    /// Euid that first claimed the role; later claims by anyone else are
    /// rejected even after the slot reopens.
    uid: Option<u32>,
}

/// A naming domain. Exactly one node per context may be the context
/// manager; it is what handle 0 resolves to for every process opened on
/// this context.
pub(crate) struct Context {
    pub name: String,
    manager: Mutex<ManagerSlot>,
}

impl Context {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            manager: Mutex::new(ManagerSlot { node: None, uid: None }),
        })
    }

    /// Current manager node, pinned with a transient ref.
    pub(crate) fn manager_node(&self) -> Option<Arc<Node>> {
        let slot = self.manager.lock().unwrap();
        let node = slot.node.clone()?;
        node.tmp_inc();
        Some(node)
    }

    /// Reopens the slot when its owner exits.
    pub(crate) fn clear_manager_if_owned(&self, proc: &Arc<Process>) {
        let mut slot = self.manager.lock().unwrap();
        let owned = slot
            .node
            .as_ref()
            .and_then(|n| n.owner())
            .is_some_and(|o| Arc::ptr_eq(&o, proc));
        if owned {
            log::debug!("{}: context manager gone", proc.pid);
            slot.node = None;
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) struct DeferredFlags: u32 {
        const FLUSH = 1 << 0;
        const RELEASE = 1 << 1;
    }
}

struct DeferredState {
    queue: Vec<(Arc<Process>, DeferredFlags)>,
    shutdown: bool,
}

/// State shared by the driver, its contexts, and every process.
pub(crate) struct DriverShared {
    last_id: AtomicU32,
    last_pid: AtomicU32,
    pub(crate) dead_nodes: Arc<DeadNodes>,
    procs: Mutex<Vec<Weak<Process>>>,
    contexts: Mutex<BTreeMap<String, Arc<Context>>>,
    pub(crate) policy: Box<dyn Policy>,
    /// Diagnostics latch: at level >= 2 the ioctl entry blocks.
    stop_level: Mutex<u32>,
    stop_wait: Condvar,
    deferred: Mutex<DeferredState>,
    deferred_wait: Condvar,
}

impl DriverShared {
    pub(crate) fn next_id(&self) -> u32 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn gate(&self) {
        let mut level = self.stop_level.lock().unwrap();
        while *level >= 2 {
            level = self.stop_wait.wait(level).unwrap();
        }
    }

    pub(crate) fn defer(
        &self,
        proc: &Arc<Process>,
        flags: DeferredFlags,
    ) {
        let mut st = self.deferred.lock().unwrap();
        match st.queue.iter_mut().find(|(p, _)| Arc::ptr_eq(p, proc)) {
            Some((_, f)) => *f |= flags,
            None => st.queue.push((Arc::clone(proc), flags)),
        }
        self.deferred_wait.notify_one();
    }
}

/// Parameters of one open of the driver.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// Naming domain to bind to.
    pub context: String,
    /// Effective uid the process presents.
    pub euid: u32,
    /// Default scheduling nicety of the process's workers.
    pub nice: Nice,
    /// Size of the process's user-writable scratch region.
    pub scratch_size: usize,
    /// Descriptor-table limit.
    pub fd_limit: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            context: DEFAULT_CONTEXT.to_owned(),
            euid: 0,
            nice: Nice(0),
            scratch_size: 256 * 1024,
            fd_limit: crate::files::DEFAULT_RLIMIT,
        }
    }
}

pub(crate) const DEFAULT_CONTEXT: &str = "ferry";

pub struct Driver {
    shared: Arc<DriverShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub fn new() -> Self {
        Self::with_policy(Box::new(AllowAll))
    }

    pub fn with_policy(policy: Box<dyn Policy>) -> Self {
        let shared = Arc::new(DriverShared {
            last_id: AtomicU32::new(0),
            last_pid: AtomicU32::new(0),
            dead_nodes: Arc::new(DeadNodes::default()),
            procs: Mutex::new(Vec::new()),
            contexts: Mutex::new(BTreeMap::new()),
            policy,
            stop_level: Mutex::new(0),
            stop_wait: Condvar::new(),
            deferred: Mutex::new(DeferredState {
                queue: Vec::new(),
                shutdown: false,
            }),
            deferred_wait: Condvar::new(),
        });
        shared
            .contexts
            .lock()
            .unwrap()
            .insert(DEFAULT_CONTEXT.to_owned(), Context::new(DEFAULT_CONTEXT));

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("ferry-deferred".to_owned())
            .spawn(move || deferred_worker(worker_shared))
            .expect("spawning deferred-release worker");

        Self { shared, worker: Mutex::new(Some(worker)) }
    }

    /// Creates a driver hosting the default context plus the named naming
    /// domains.
    pub fn with_contexts(names: &[&str]) -> Self {
        let driver = Self::new();
        {
            let mut contexts = driver.shared.contexts.lock().unwrap();
            for name in names {
                contexts
                    .entry((*name).to_owned())
                    .or_insert_with(|| Context::new(name));
            }
        }
        driver
    }

    pub fn open(&self) -> Arc<Client> {
        self.open_with(OpenOptions::default())
            .expect("default context always exists")
    }

    /// Opens a client bound to the named context.
    pub fn open_on(&self, name: &str) -> Result<Arc<Client>, IoctlError> {
        self.open_with(OpenOptions {
            context: name.to_owned(),
            ..OpenOptions::default()
        })
    }

    pub fn open_with(
        &self,
        opts: OpenOptions,
    ) -> Result<Arc<Client>, IoctlError> {
        let context = self
            .shared
            .contexts
            .lock()
            .unwrap()
            .get(&opts.context)
            .cloned()
            .ok_or(IoctlError::BadRequest)?;
        let pid = self.shared.last_pid.fetch_add(1, Ordering::Relaxed) + 1;
        let proc = Process::new(
            Arc::clone(&self.shared),
            context,
            pid,
            opts.euid,
            opts.nice,
            opts.scratch_size,
            opts.fd_limit,
        );
        log::debug!("open: {}", pid);
        let mut procs = self.shared.procs.lock().unwrap();
        procs.retain(|w| w.strong_count() > 0);
        procs.push(Arc::downgrade(&proc));
        drop(procs);
        Ok(Arc::new(Client {
            proc,
            shared: Arc::clone(&self.shared),
            nonblocking: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Diagnostics latch; level >= 2 blocks every ioctl entry until
    /// lowered.
    pub fn set_stop_on_user_error(&self, level: u32) {
        *self.shared.stop_level.lock().unwrap() = level;
        self.shared.stop_wait.notify_all();
    }

    /// Number of nodes orphaned by dead owners but kept alive by remote
    /// references.
    pub fn dead_node_count(&self) -> usize {
        self.shared.dead_nodes.len()
    }

    /// Number of live opens.
    pub fn proc_count(&self) -> usize {
        let mut procs = self.shared.procs.lock().unwrap();
        procs.retain(|w| w.strong_count() > 0);
        procs.len()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        {
            let mut st = self.shared.deferred.lock().unwrap();
            st.shutdown = true;
            self.shared.deferred_wait.notify_one();
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn deferred_worker(shared: Arc<DriverShared>) {
    loop {
        let item = {
            let mut st = shared.deferred.lock().unwrap();
            loop {
                if !st.queue.is_empty() {
                    break Some(st.queue.remove(0));
                }
                if st.shutdown {
                    break None;
                }
                st = shared.deferred_wait.wait(st).unwrap();
            }
        };
        let Some((proc, flags)) = item else {
            return;
        };
        if flags.contains(DeferredFlags::FLUSH) {
            crate::thread::flush_threads(&proc);
        }
        if flags.contains(DeferredFlags::RELEASE) {
            proc.release();
        }
    }
}

static NEXT_TID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CURRENT_TID: u32 = NEXT_TID.fetch_add(1, Ordering::Relaxed) + 1;
}

/// Stable small id of the calling OS thread.
pub(crate) fn current_tid() -> u32 {
    CURRENT_TID.with(|t| *t)
}

/// One open of the driver, backing one process.
pub struct Client {
    proc: Arc<Process>,
    shared: Arc<DriverShared>,
    nonblocking: AtomicBool,
    closed: AtomicBool,
}

impl Client {
    fn enter(&self) -> Arc<Thread> {
        self.shared.gate();
        self.proc.get_thread(current_tid())
    }

    fn exit(thread: &Thread) {
        thread.needs_return.store(false, Ordering::Relaxed);
    }

    pub fn pid(&self) -> u32 {
        self.proc.pid
    }

    /// The process's address space; the embedding program stages command
    /// streams and payloads here.
    pub fn vm(&self) -> &AddressSpace {
        &self.proc.vm
    }

    /// The process's descriptor table.
    pub fn files(&self) -> &FdTable {
        &self.proc.files
    }

    /// Whether reads error with `WouldBlock` instead of sleeping.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// Installs the shared mapping. Returns its base and effective size;
    /// oversize requests are truncated.
    pub fn mmap(&self, size: u64) -> Result<(u64, u64), IoctlError> {
        self.proc.alloc.mmap(&self.proc.vm, size)
    }

    /// The `WriteRead` ioctl: executes the write buffer as a command
    /// stream, then drains work into the read buffer. Both halves may be
    /// empty.
    pub fn write_read(&self, wr: &mut WriteRead) -> Result<(), IoctlError> {
        let thread = self.enter();
        log::debug!(
            "{}:{} write {} at {:#x}, read {} at {:#x}",
            self.proc.pid,
            thread.tid,
            wr.write_size,
            wr.write_buffer,
            wr.read_size,
            wr.read_buffer
        );

        if wr.write_size > wr.write_consumed {
            let stream = self
                .proc
                .vm
                .read(wr.write_buffer, wr.write_size)
                .map_err(|_| {
                    Self::exit(&thread);
                    IoctlError::Fault
                })?;
            let mut consumed = wr.write_consumed;
            let res = crate::thread::thread_write(
                &self.proc,
                &thread,
                &stream,
                &mut consumed,
            );
            wr.write_consumed = consumed;
            if let Err(e) = res {
                wr.read_consumed = 0;
                Self::exit(&thread);
                return Err(e);
            }
        }

        if wr.read_size > 0 {
            let mut out = Vec::new();
            let res = crate::thread::thread_read(
                &self.proc,
                &thread,
                &mut out,
                wr.read_size as usize,
                self.nonblocking.load(Ordering::Relaxed),
            );
            if !out.is_empty() {
                self.proc
                    .vm
                    .write_privileged(wr.read_buffer, &out)
                    .map_err(|_| {
                        Self::exit(&thread);
                        IoctlError::Fault
                    })?;
            }
            wr.read_consumed = out.len() as u64;
            // Work may have arrived for other waiters while we drained.
            if !self.proc.inner.lock().unwrap().todo.is_empty() {
                self.proc.wait.notify_one();
            }
            if let Err(e) = res {
                Self::exit(&thread);
                return Err(e);
            }
        }
        Self::exit(&thread);
        Ok(())
    }

    /// Caps the process's worker-thread pool for spawn hints.
    pub fn set_max_threads(&self, max: u32) {
        let thread = self.enter();
        self.proc.inner.lock().unwrap().max_threads = max;
        Self::exit(&thread);
    }

    /// Claims the context-manager role for this process's context.
    pub fn set_context_mgr(&self) -> Result<(), IoctlError> {
        let thread = self.enter();
        let res = self.set_context_mgr_inner();
        Self::exit(&thread);
        res
    }

    fn set_context_mgr_inner(&self) -> Result<(), IoctlError> {
        let context = &self.proc.context;
        let mut slot = context.manager.lock().unwrap();
        if slot.node.is_some() {
            log::warn!("set_context_mgr: already set");
            return Err(IoctlError::Busy);
        }
        if !self.shared.policy.may_set_context_mgr(&self.proc) {
            return Err(IoctlError::Denied);
        }
        match slot.uid {
            Some(uid) if uid != self.proc.euid => {
                log::warn!(
                    "set_context_mgr: bad uid {} != {}",
                    self.proc.euid,
                    uid
                );
                return Err(IoctlError::Denied);
            }
            Some(_) => {}
            None => slot.uid = Some(self.proc.euid),
        }
        let node = self.proc.node_for_ptr(
            ObjPtr(0),
            Cookie(0),
            NodePolicy { min_nice: Nice(0), accepts_fds: false },
            true,
        );
        node.prime_as_manager();
        slot.node = Some(Arc::clone(&node));
        node.tmp_dec();
        log::debug!(
            "{}: context manager of {:?}",
            self.proc.pid,
            context.name
        );
        Ok(())
    }

    /// Tears down the calling thread's bookkeeping.
    pub fn thread_exit(&self) {
        let thread = self.enter();
        log::debug!("{}:{} exit", self.proc.pid, thread.tid);
        crate::thread::release_thread(&self.proc, &thread);
    }

    /// Reports the supported protocol version.
    pub fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Whether a read right now would deliver work without sleeping.
    pub fn poll_readable(&self) -> bool {
        let thread = self.proc.get_thread(current_tid());
        crate::thread::work_pending(&self.proc, &thread)
    }

    /// Forces every thread of the process out of the driver at the next
    /// boundary.
    pub fn flush(&self) {
        self.shared.defer(&self.proc, DeferredFlags::FLUSH);
    }

    /// Closes the client: the process is torn down by the deferred worker
    /// once all transient uses drain. Idempotent; also run on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.shared.defer(&self.proc, DeferredFlags::RELEASE);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::umem::SCRATCH_BASE;
    use ferry_userlib::{
        CommandWriter, Handle, ReturnReader, ReturnRecord, TransactionData,
        TxnFlags,
    };

    const READ_AT: u64 = SCRATCH_BASE + 0x4000;

    fn one_io(client: &Client, cmds: CommandWriter) -> Vec<ReturnRecord> {
        let stream = cmds.finish();
        client.vm().write(SCRATCH_BASE, &stream).unwrap();
        let mut wr = WriteRead {
            write_buffer: SCRATCH_BASE,
            write_size: stream.len() as u64,
            write_consumed: 0,
            read_buffer: READ_AT,
            read_size: 1024,
            read_consumed: 0,
        };
        client.write_read(&mut wr).unwrap();
        let out = client.vm().read(READ_AT, wr.read_consumed).unwrap();
        ReturnReader::new(&out).collect_all().unwrap()
    }

    #[test]
    fn dead_target_after_admission_completes_then_dead_replies() {
        let driver = Driver::new();
        let p1 = driver.open();
        p1.mmap(1 << 16).unwrap();
        p1.set_context_mgr().unwrap();
        let p2 = driver.open();
        p2.mmap(1 << 16).unwrap();

        // Hit the window between admission and enqueue: the manager node
        // still resolves, but the dispatch-time dead check fires.
        p1.proc.inner.lock().unwrap().is_dead = true;

        let mut w = CommandWriter::new();
        w.transaction(&TransactionData {
            target: u64::from(Handle::CONTEXT_MANAGER.0),
            cookie: ferry_abi::Cookie(0),
            code: 1,
            flags: TxnFlags::empty().bits(),
            sender_pid: 0,
            sender_euid: 0,
            data_size: 0,
            offsets_size: 0,
            data_ptr: SCRATCH_BASE,
            offsets_ptr: SCRATCH_BASE,
        });
        let records = one_io(&p2, w);
        let meaningful: Vec<_> = records
            .into_iter()
            .filter(|r| !matches!(r, ReturnRecord::Noop))
            .collect();
        assert_eq!(
            meaningful,
            vec![
                ReturnRecord::TransactionComplete,
                ReturnRecord::DeadReply,
            ]
        );
    }

    #[test]
    fn spawn_looper_hint_upgrades_the_marker() {
        let driver = Driver::new();
        let p = driver.open();
        p.mmap(1 << 16).unwrap();
        p.set_max_threads(2);

        let mut w = CommandWriter::new();
        w.enter_looper();
        let records = one_io(&p, w);
        assert_eq!(records, vec![ReturnRecord::SpawnLooper]);
        assert_eq!(p.proc.inner.lock().unwrap().requested_threads, 1);

        // The spawned worker registers, consuming the request. Write-only,
        // so the read side doesn't immediately ask for another thread.
        let mut w = CommandWriter::new();
        w.register_looper();
        let stream = w.finish();
        p.vm().write(SCRATCH_BASE, &stream).unwrap();
        let mut wr = WriteRead {
            write_buffer: SCRATCH_BASE,
            write_size: stream.len() as u64,
            ..Default::default()
        };
        p.write_read(&mut wr).unwrap();
        let inner = p.proc.inner.lock().unwrap();
        assert_eq!(inner.requested_threads, 0);
        assert_eq!(inner.requested_started, 1);
    }

    #[test]
    fn ioctl_entry_gates_on_the_stop_latch() {
        let driver = Driver::new();
        let p = driver.open();
        p.mmap(1 << 16).unwrap();
        driver.set_stop_on_user_error(2);

        let (tx, rx) = std::sync::mpsc::channel();
        let pc = Arc::clone(&p);
        let blocked = std::thread::spawn(move || {
            let mut wr = WriteRead::default();
            pc.write_read(&mut wr).unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(100))
            .is_err());
        driver.set_stop_on_user_error(0);
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        blocked.join().unwrap();
    }
}
