// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driven through the client surface: bootstrap via
//! the context manager, object round trips, one-way ordering, death
//! notifications, and failure unwinding.

use std::sync::Arc;
use std::time::Duration;

use ferry_kern::umem::SCRATCH_BASE;
use ferry_kern::{Client, Driver, OpenOptions};
use ferry_userlib::{
    BufferFlags, BufferObject, CommandWriter, Cookie, FlatObject, Handle,
    NodePolicy, ObjPtr, ObjectKind, ReturnReader, ReturnRecord,
    TransactionData, TransactionDataSg, TxnFlags, WriteRead,
};
use zerocopy::{FromBytes, IntoBytes};

const CMD_AT: u64 = SCRATCH_BASE;
const READ_AT: u64 = SCRATCH_BASE + 0x8000;
const DATA_AT: u64 = SCRATCH_BASE + 0x10000;
const OFFS_AT: u64 = SCRATCH_BASE + 0x18000;
const EXTRA_AT: u64 = SCRATCH_BASE + 0x20000;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Stages a command stream and performs one `WriteRead`, returning the
/// decoded read records (including the leading marker).
fn io(client: &Client, cmds: Option<CommandWriter>, read: bool) -> Vec<ReturnRecord> {
    let mut wr = WriteRead::default();
    if let Some(cmds) = cmds {
        let stream = cmds.finish();
        client.vm().write(CMD_AT, &stream).unwrap();
        wr.write_buffer = CMD_AT;
        wr.write_size = stream.len() as u64;
    }
    if read {
        wr.read_buffer = READ_AT;
        wr.read_size = 0x4000;
    }
    client.write_read(&mut wr).unwrap();
    if read {
        let out = client.vm().read(READ_AT, wr.read_consumed).unwrap();
        ReturnReader::new(&out).collect_all().unwrap()
    } else {
        Vec::new()
    }
}

fn write_cmds(client: &Client, cmds: CommandWriter) {
    io(client, Some(cmds), false);
}

/// Reads until at least one non-marker record shows up. Later iterations
/// block, so this is also the cross-thread rendezvous.
fn read_records(client: &Client) -> Vec<ReturnRecord> {
    loop {
        let records: Vec<ReturnRecord> = io(client, None, true)
            .into_iter()
            .filter(|r| !matches!(r, ReturnRecord::Noop))
            .collect();
        if !records.is_empty() {
            return records;
        }
    }
}

fn send_txn(
    target: Handle,
    code: u32,
    flags: TxnFlags,
    data: &[u8],
    offsets: &[u64],
) -> TransactionData {
    TransactionData {
        target: u64::from(target.0),
        cookie: Cookie(0),
        code,
        flags: flags.bits(),
        sender_pid: 0,
        sender_euid: 0,
        data_size: data.len() as u64,
        offsets_size: (offsets.len() * 8) as u64,
        data_ptr: DATA_AT,
        offsets_ptr: OFFS_AT,
    }
}

fn stage_payload(client: &Client, data: &[u8], offsets: &[u64]) {
    client.vm().write(DATA_AT, data).unwrap();
    let mut offs = Vec::new();
    for o in offsets {
        offs.extend_from_slice(&o.to_le_bytes());
    }
    client.vm().write(OFFS_AT, &offs).unwrap();
}

fn open_pair(driver: &Driver) -> (Arc<Client>, Arc<Client>) {
    let p1 = driver.open();
    let p2 = driver.open();
    p1.mmap(1 << 20).unwrap();
    p2.mmap(1 << 20).unwrap();
    p1.set_context_mgr().unwrap();
    (p1, p2)
}

#[test]
fn bootstrap_call_and_reply() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    assert_eq!(p1.version(), ferry_userlib::PROTOCOL_VERSION);

    // P2 takes a weak ref on the context manager and calls it.
    let mut w = CommandWriter::new();
    w.inc_refs(Handle::CONTEXT_MANAGER);
    w.transaction(&send_txn(
        Handle::CONTEXT_MANAGER,
        1,
        TxnFlags::empty(),
        &[],
        &[],
    ));
    stage_payload(&p2, &[], &[]);
    let records = io(&p2, Some(w), true);
    assert!(records.contains(&ReturnRecord::TransactionComplete));

    // The manager sees the inbound call addressed as its own null object.
    let records = read_records(&p1);
    let tr = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    assert_eq!(tr.target, 0);
    assert_eq!(tr.cookie, Cookie(0));
    assert_eq!(tr.code, 1);
    assert_eq!(tr.sender_pid, p2.pid());

    // Reply with empty payload; the caller resumes.
    let mut w = CommandWriter::new();
    stage_payload(&p1, &[], &[]);
    w.reply(&send_txn(Handle(0), 0, TxnFlags::empty(), &[], &[]));
    write_cmds(&p1, w);

    let records = read_records(&p2);
    assert!(
        matches!(records[0], ReturnRecord::Reply(_)),
        "expected reply, got {records:?}"
    );
}

/// Sends one binder object from `from` to the context manager and returns
/// the handle the manager received, after acknowledging the refcount
/// notifications on the sender side.
fn export_node(
    from: &Client,
    mgr: &Client,
    ptr: u64,
    cookie: u64,
    policy: NodePolicy,
) -> Handle {
    let obj = FlatObject {
        kind: ObjectKind::Binder as u32,
        flags: policy.to_wire(),
        a: ptr,
        cookie: Cookie(cookie),
    };
    stage_payload(from, obj.as_bytes(), &[0]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(
        Handle::CONTEXT_MANAGER,
        7,
        TxnFlags::empty(),
        obj.as_bytes(),
        &[0],
    ));
    let records = io(from, Some(w), true);
    // The sender is told it now holds refs on its exported node.
    let mut acks = CommandWriter::new();
    for r in &records {
        match r {
            ReturnRecord::IncRefs(n) => {
                acks.inc_refs_done(n.ptr, n.cookie);
            }
            ReturnRecord::Acquire(n) => {
                acks.acquire_done(n.ptr, n.cookie);
            }
            _ => {}
        }
    }
    assert!(records.contains(&ReturnRecord::TransactionComplete));
    write_cmds(from, acks);

    // The manager reads the delivered payload out of its mapping.
    let records = read_records(mgr);
    let tr = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    let data = mgr.vm().read(tr.data_ptr, tr.data_size).unwrap();
    let fp = FlatObject::read_from_bytes(&data).unwrap();
    assert_eq!(fp.kind, ObjectKind::Handle as u32);

    // Reply so the sender is not left blocked.
    let mut w = CommandWriter::new();
    stage_payload(mgr, &[], &[]);
    w.reply(&send_txn(Handle(0), 0, TxnFlags::empty(), &[], &[]));
    write_cmds(mgr, w);
    let records = read_records(from);
    assert!(
        records.iter().any(|r| matches!(r, ReturnRecord::Reply(_))),
        "sender never resumed: {records:?}"
    );
    fp.handle()
}

#[test]
fn binder_object_round_trips_to_identity() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);

    // P2 exports object (ptr=0x5000, cookie=0xC0) to P1.
    let h = export_node(
        &p2,
        &p1,
        0x5000,
        0xC0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );
    assert_eq!(h, Handle(1));

    // P1 relays the handle straight back to its owner: the object must
    // collapse to the original pointer/cookie pair.
    let obj = FlatObject {
        kind: ObjectKind::Handle as u32,
        flags: 0,
        a: u64::from(h.0),
        cookie: Cookie(0),
    };
    stage_payload(&p1, obj.as_bytes(), &[0]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(h, 9, TxnFlags::empty(), obj.as_bytes(), &[0]));
    let records = io(&p1, Some(w), true);
    assert!(records.contains(&ReturnRecord::TransactionComplete));

    let records = read_records(&p2);
    let tr = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    assert_eq!(tr.code, 9);
    let data = p2.vm().read(tr.data_ptr, tr.data_size).unwrap();
    let fp = FlatObject::read_from_bytes(&data).unwrap();
    assert_eq!(fp.kind, ObjectKind::Binder as u32);
    assert_eq!(fp.a, 0x5000);
    assert_eq!(fp.cookie, Cookie(0xC0));
}

#[test]
fn handles_are_smallest_free() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let nice = ferry_userlib::Nice(0);
    let policy = NodePolicy { min_nice: nice, accepts_fds: false };

    assert_eq!(export_node(&p2, &p1, 0x100, 0, policy), Handle(1));
    assert_eq!(export_node(&p2, &p1, 0x200, 0, policy), Handle(2));
    assert_eq!(export_node(&p2, &p1, 0x300, 0, policy), Handle(3));

    // Dropping handle 2 frees the slot for the next allocation.
    let mut w = CommandWriter::new();
    w.release(Handle(2));
    write_cmds(&p1, w);
    assert_eq!(export_node(&p2, &p1, 0x400, 0, policy), Handle(2));
}

#[test]
fn refcount_notifications_follow_the_state_machine() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);

    let obj = FlatObject {
        kind: ObjectKind::Binder as u32,
        flags: 0,
        a: 0x9000,
        cookie: Cookie(0x11),
    };
    stage_payload(&p2, obj.as_bytes(), &[0]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(
        Handle::CONTEXT_MANAGER,
        1,
        TxnFlags::empty(),
        obj.as_bytes(),
        &[0],
    ));
    let records = io(&p2, Some(w), true);

    // The export produces exactly one weak and one strong notification,
    // before the completion.
    let increfs_at = records
        .iter()
        .position(|r| matches!(r, ReturnRecord::IncRefs(_)))
        .expect("no IncRefs");
    let acquire_at = records
        .iter()
        .position(|r| matches!(r, ReturnRecord::Acquire(_)))
        .expect("no Acquire");
    let complete_at = records
        .iter()
        .position(|r| matches!(r, ReturnRecord::TransactionComplete))
        .unwrap();
    assert!(increfs_at < acquire_at && acquire_at < complete_at);

    let mut acks = CommandWriter::new();
    acks.inc_refs_done(ObjPtr(0x9000), Cookie(0x11));
    acks.acquire_done(ObjPtr(0x9000), Cookie(0x11));
    write_cmds(&p2, acks);

    // Drain the manager side and answer.
    let records = read_records(&p1);
    let ReturnRecord::Transaction(_) = records[0] else {
        panic!("expected transaction");
    };
    let mut w = CommandWriter::new();
    stage_payload(&p1, &[], &[]);
    w.reply(&send_txn(Handle(0), 0, TxnFlags::empty(), &[], &[]));
    write_cmds(&p1, w);
    read_records(&p2);

    // Dropping the only remote ref walks the machine back down.
    let mut w = CommandWriter::new();
    w.release(Handle(1));
    write_cmds(&p1, w);

    let records = read_records(&p2);
    let release_at = records
        .iter()
        .position(|r| {
            matches!(r, ReturnRecord::Release(n) if n.ptr == ObjPtr(0x9000))
        })
        .expect("no Release");
    let decrefs_at = records
        .iter()
        .position(|r| {
            matches!(r, ReturnRecord::DecRefs(n) if n.ptr == ObjPtr(0x9000))
        })
        .expect("no DecRefs");
    assert!(release_at < decrefs_at);
}

#[test]
fn nested_call_lands_on_the_original_thread() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);

    let (tx, rx) = std::sync::mpsc::channel();
    let p1c = Arc::clone(&p1);
    let caller = std::thread::spawn(move || {
        // T1: call out to P2 (via a handle exported below), then service
        // whatever comes back on this same thread.
        let h: Handle = rx.recv().unwrap();
        stage_payload(&p1c, &[], &[]);
        let mut w = CommandWriter::new();
        w.transaction(&send_txn(h, 41, TxnFlags::empty(), &[], &[]));
        let mut records = io(&p1c, Some(w), true);
        assert!(records.contains(&ReturnRecord::TransactionComplete));
        loop {
            for r in &records {
                if let ReturnRecord::Transaction(tr) = r {
                    // The nested call came back to us, not to some other
                    // worker of P1.
                    assert_eq!(tr.code, 42);
                    return;
                }
            }
            records = read_records(&p1c);
        }
    });

    // P2 exports a node so P1 has something to call.
    let h = export_node(
        &p2,
        &p1,
        0x7000,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );
    tx.send(h).unwrap();

    // P2 services the outer call, then calls back into P1 (handle 0)
    // while the caller is still blocked.
    let records = read_records(&p2);
    assert!(
        records
            .iter()
            .any(|r| matches!(r, ReturnRecord::Transaction(tr) if tr.code == 41)),
        "outer call not delivered: {records:?}"
    );
    stage_payload(&p2, &[], &[]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(
        Handle::CONTEXT_MANAGER,
        42,
        TxnFlags::empty(),
        &[],
        &[],
    ));
    let records = io(&p2, Some(w), true);
    assert!(records.contains(&ReturnRecord::TransactionComplete));

    caller.join().unwrap();
}

#[test]
fn async_sends_to_one_node_run_in_order() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0x6000,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    // Two one-way sends before the receiver frees anything.
    for code in [100, 101] {
        stage_payload(&p1, &[code as u8], &[]);
        let mut w = CommandWriter::new();
        w.transaction(&send_txn(h, code, TxnFlags::ONE_WAY, &[0], &[]));
        let records = io(&p1, Some(w), true);
        assert!(records.contains(&ReturnRecord::TransactionComplete));
    }

    // Receiver sees #1 only; #2 is parked behind it.
    let records = read_records(&p2);
    let first = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    assert_eq!(first.code, 100);
    assert!(!p2.poll_readable(), "second one-way delivered too early");

    // Freeing #1's buffer promotes #2.
    let mut w = CommandWriter::new();
    w.free_buffer(first.data_ptr);
    write_cmds(&p2, w);
    let records = read_records(&p2);
    let second = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    assert_eq!(second.code, 101);
}

#[test]
fn death_notification_fires_once_and_is_acknowledged() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0x4000,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    let mut w = CommandWriter::new();
    w.request_death_notification(h, Cookie(0xAA));
    write_cmds(&p1, w);

    p2.close();
    let records = read_records(&p1);
    assert_eq!(records[0], ReturnRecord::DeadBinder(Cookie(0xAA)));

    let mut w = CommandWriter::new();
    w.dead_binder_done(Cookie(0xAA));
    write_cmds(&p1, w);

    // A send to the dead owner now fails fast.
    stage_payload(&p1, &[], &[]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(h, 1, TxnFlags::empty(), &[], &[]));
    let records = io(&p1, Some(w), true);
    assert!(
        records.contains(&ReturnRecord::DeadReply),
        "expected dead reply, got {records:?}"
    );
}

#[test]
fn clear_before_death_yields_only_clear_done() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0x4100,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    let mut w = CommandWriter::new();
    w.request_death_notification(h, Cookie(0xBB));
    w.clear_death_notification(h, Cookie(0xBB));
    let records = io(&p1, Some(w), true);
    let clears = records
        .iter()
        .filter(|r| {
            matches!(
                r,
                ReturnRecord::ClearDeathNotificationDone(Cookie(0xBB))
            )
        })
        .count();
    assert_eq!(clears, 1);
    assert!(!records
        .iter()
        .any(|r| matches!(r, ReturnRecord::DeadBinder(_))));

    // Owner death after the clear produces nothing further. The node
    // landing on the dead list is the sign that the release has run.
    p2.close();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while driver.dead_node_count() == 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "release never ran"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!p1.poll_readable());
}

#[test]
fn fd_payloads_install_duplicates_in_the_target() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    // P2 accepts fds on this node.
    let h = export_node(
        &p2,
        &p1,
        0x8000,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: true },
    );

    let file = ferry_kern::files::File::new();
    let src_fd = p1.files().install(Arc::clone(&file)).unwrap();

    let obj = ferry_userlib::FdObject::new(src_fd);
    stage_payload(&p1, obj.as_bytes(), &[0]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(h, 5, TxnFlags::empty(), obj.as_bytes(), &[0]));
    let records = io(&p1, Some(w), true);
    assert!(records.contains(&ReturnRecord::TransactionComplete));

    let records = read_records(&p2);
    let tr = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    let data = p2.vm().read(tr.data_ptr, tr.data_size).unwrap();
    let fp = ferry_userlib::FdObject::read_from_bytes(&data).unwrap();
    // Duplicate of the same file, close-on-exec, in P2's table.
    let dup = p2.files().get(fp.fd).expect("fd not installed");
    assert!(Arc::ptr_eq(&dup, &file));
    assert_eq!(p2.files().cloexec(fp.fd), Some(true));
}

#[test]
fn fd_to_non_accepting_node_fails_cleanly() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0x8100,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    let src_fd = p1.files().install(ferry_kern::files::File::new()).unwrap();
    let before = p2.files().len();

    let obj = ferry_userlib::FdObject::new(src_fd);
    stage_payload(&p1, obj.as_bytes(), &[0]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(h, 5, TxnFlags::empty(), obj.as_bytes(), &[0]));
    let records = io(&p1, Some(w), true);
    assert!(
        records.contains(&ReturnRecord::FailedReply),
        "expected failed reply, got {records:?}"
    );
    assert_eq!(p2.files().len(), before);
    assert!(!p2.poll_readable());
}

#[test]
fn out_of_order_fixups_are_rejected() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0x8200,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    // Parent buffer A, then children at decreasing parent offsets: C's
    // fixup (offset 8) starts below B's (offset 16).
    let parent_payload = [0u8; 32];
    let child_payload = [1u8; 8];
    p1.vm().write(EXTRA_AT, &parent_payload).unwrap();
    p1.vm().write(EXTRA_AT + 0x100, &child_payload).unwrap();

    let a = BufferObject {
        kind: ObjectKind::Ptr as u32,
        flags: 0,
        buffer: EXTRA_AT,
        length: 32,
        parent: 0,
        parent_offset: 0,
    };
    let b = BufferObject {
        kind: ObjectKind::Ptr as u32,
        flags: BufferFlags::HAS_PARENT.bits(),
        buffer: EXTRA_AT + 0x100,
        length: 8,
        parent: 0,
        parent_offset: 16,
    };
    let c = BufferObject {
        kind: ObjectKind::Ptr as u32,
        flags: BufferFlags::HAS_PARENT.bits(),
        buffer: EXTRA_AT + 0x100,
        length: 8,
        parent: 0,
        parent_offset: 8,
    };
    let mut data = Vec::new();
    data.extend_from_slice(a.as_bytes());
    data.extend_from_slice(b.as_bytes());
    data.extend_from_slice(c.as_bytes());
    let offsets = [0u64, 40, 80];
    stage_payload(&p1, &data, &offsets);

    let mut tr = send_txn(h, 6, TxnFlags::empty(), &data, &offsets);
    tr.data_size = data.len() as u64;
    let sg = TransactionDataSg { data: tr, extras_size: 48 };
    let mut w = CommandWriter::new();
    w.transaction_sg(&sg);
    let records = io(&p1, Some(w), true);
    assert!(
        records.contains(&ReturnRecord::FailedReply),
        "expected failed reply, got {records:?}"
    );
    // Nothing was installed in the target.
    assert!(!p2.poll_readable());
}

#[test]
fn scatter_gather_fixups_patch_the_parent() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0x8300,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    let parent_payload = [0u8; 16];
    let child_payload = *b"childchi";
    p1.vm().write(EXTRA_AT, &parent_payload).unwrap();
    p1.vm().write(EXTRA_AT + 0x100, &child_payload).unwrap();

    let a = BufferObject {
        kind: ObjectKind::Ptr as u32,
        flags: 0,
        buffer: EXTRA_AT,
        length: 16,
        parent: 0,
        parent_offset: 0,
    };
    let b = BufferObject {
        kind: ObjectKind::Ptr as u32,
        flags: BufferFlags::HAS_PARENT.bits(),
        buffer: EXTRA_AT + 0x100,
        length: 8,
        parent: 0,
        parent_offset: 8,
    };
    let mut data = Vec::new();
    data.extend_from_slice(a.as_bytes());
    data.extend_from_slice(b.as_bytes());
    let offsets = [0u64, 40];
    stage_payload(&p1, &data, &offsets);

    let sg = TransactionDataSg {
        data: send_txn(h, 6, TxnFlags::empty(), &data, &offsets),
        extras_size: 24,
    };
    let mut w = CommandWriter::new();
    w.transaction_sg(&sg);
    let records = io(&p1, Some(w), true);
    assert!(records.contains(&ReturnRecord::TransactionComplete));

    let records = read_records(&p2);
    let tr = match &records[0] {
        ReturnRecord::Transaction(tr) => *tr,
        other => panic!("expected transaction, got {other:?}"),
    };
    let delivered = p2.vm().read(tr.data_ptr, tr.data_size).unwrap();
    let a2 = BufferObject::read_from_bytes(&delivered[..40]).unwrap();
    let b2 = BufferObject::read_from_bytes(&delivered[40..80]).unwrap();
    // Parent contents landed in P2's mapping, with the child's new
    // address patched in at offset 8.
    let parent_bytes = p2.vm().read(a2.buffer, a2.length).unwrap();
    let patched = u64::from_le_bytes(parent_bytes[8..16].try_into().unwrap());
    assert_eq!(patched, b2.buffer);
    assert_eq!(p2.vm().read(b2.buffer, 8).unwrap(), child_payload);
}

#[test]
fn async_budget_is_enforced_per_mapping() {
    init_logs();
    let driver = Driver::new();
    let p1 = driver.open();
    let p2 = driver.open_with(OpenOptions::default()).unwrap();
    p1.mmap(1 << 20).unwrap();
    p2.mmap(8192).unwrap();
    p1.set_context_mgr().unwrap();

    let h = export_node(
        &p2,
        &p1,
        0xA000,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    // Larger than half the mapping: refused as a one-way, fine as a
    // synchronous call.
    let big = vec![7u8; 5000];
    stage_payload(&p1, &big, &[]);
    let mut w = CommandWriter::new();
    w.transaction(&send_txn(h, 1, TxnFlags::ONE_WAY, &big, &[]));
    let records = io(&p1, Some(w), true);
    assert!(
        records.contains(&ReturnRecord::FailedReply),
        "async over budget must fail: {records:?}"
    );

    let mut w = CommandWriter::new();
    w.transaction(&send_txn(h, 1, TxnFlags::empty(), &big, &[]));
    let records = io(&p1, Some(w), true);
    assert!(records.contains(&ReturnRecord::TransactionComplete));
}

#[test]
fn thread_exit_fails_outstanding_calls() {
    init_logs();
    let driver = Driver::new();
    let (p1, p2) = open_pair(&driver);
    let h = export_node(
        &p2,
        &p1,
        0xB000,
        0,
        NodePolicy { min_nice: ferry_userlib::Nice(0), accepts_fds: false },
    );

    let p1c = Arc::clone(&p1);
    let caller = std::thread::spawn(move || {
        stage_payload(&p1c, &[], &[]);
        let mut w = CommandWriter::new();
        w.transaction(&send_txn(h, 1, TxnFlags::empty(), &[], &[]));
        let mut records = io(&p1c, Some(w), true);
        assert!(records.contains(&ReturnRecord::TransactionComplete));
        loop {
            if records.contains(&ReturnRecord::DeadReply) {
                return;
            }
            assert!(
                !records.iter().any(|r| matches!(r, ReturnRecord::Reply(_))),
                "got a real reply from a dead thread"
            );
            records = read_records(&p1c);
        }
    });

    // P2 picks the call up, then its servicing thread dies.
    let records = read_records(&p2);
    assert!(records
        .iter()
        .any(|r| matches!(r, ReturnRecord::Transaction(_))));
    p2.thread_exit();

    caller.join().unwrap();
}

#[test]
fn second_context_manager_is_rejected_until_slot_clears() {
    init_logs();
    let driver = Driver::new();
    let p1 = driver.open();
    let p2 = driver.open();
    p1.mmap(4096).unwrap();
    p2.mmap(4096).unwrap();
    p1.set_context_mgr().unwrap();
    assert!(p2.set_context_mgr().is_err());

    p1.close();
    // The slot reopens once the deferred release runs.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if p2.set_context_mgr().is_ok() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "manager slot never cleared"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn manager_euid_is_pinned_to_the_first_claimant() {
    init_logs();
    let driver = Driver::new();
    let p1 = driver
        .open_with(OpenOptions { euid: 42, ..OpenOptions::default() })
        .unwrap();
    p1.mmap(4096).unwrap();
    p1.set_context_mgr().unwrap();

    let p2 = driver
        .open_with(OpenOptions { euid: 1000, ..OpenOptions::default() })
        .unwrap();
    p2.mmap(4096).unwrap();
    assert_eq!(
        p2.set_context_mgr().unwrap_err(),
        ferry_kern::err::IoctlError::Busy
    );

    p1.close();
    // Once the slot reopens, a different euid is still refused: the role
    // stays pinned to whoever claimed it first.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match p2.set_context_mgr() {
            Err(ferry_kern::err::IoctlError::Busy) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "manager slot never cleared"
                );
                std::thread::sleep(Duration::from_millis(10));
            }
            other => {
                assert_eq!(
                    other.unwrap_err(),
                    ferry_kern::err::IoctlError::Denied
                );
                break;
            }
        }
    }

    // The pinned euid may take the role again.
    let p3 = driver
        .open_with(OpenOptions { euid: 42, ..OpenOptions::default() })
        .unwrap();
    p3.mmap(4096).unwrap();
    p3.set_context_mgr().unwrap();
}

#[test]
fn contexts_are_independent_naming_domains() {
    init_logs();
    let driver = Driver::with_contexts(&["net"]);
    let p1 = driver.open();
    p1.mmap(4096).unwrap();
    p1.set_context_mgr().unwrap();

    // The default context's manager does not occupy this domain's slot.
    let p2 = driver.open_on("net").unwrap();
    p2.mmap(4096).unwrap();
    p2.set_context_mgr().unwrap();

    // Unregistered domains are refused at open.
    assert!(driver.open_on("usb").is_err());
}

#[test]
fn nonblocking_read_reports_would_block() {
    init_logs();
    let driver = Driver::new();
    let p1 = driver.open();
    p1.mmap(4096).unwrap();
    p1.set_nonblocking(true);
    // Consume the fresh-thread early return first.
    let mut wr = WriteRead::default();
    wr.read_buffer = READ_AT;
    wr.read_size = 256;
    p1.write_read(&mut wr).unwrap();
    let err = p1.write_read(&mut wr).unwrap_err();
    assert_eq!(err, ferry_kern::err::IoctlError::WouldBlock);
}

#[test]
fn oversize_mapping_is_truncated() {
    init_logs();
    let driver = Driver::new();
    let p1 = driver.open();
    let (_base, size) = p1.mmap(64 << 20).unwrap();
    assert_eq!(size, 4 << 20);
    assert!(p1.mmap(4096).is_err());
}
