// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ferry wire protocol definitions, shared between the engine and its
//! clients.
//!
//! Everything in here describes bytes as they cross the driver boundary: the
//! tagged records of the command (write) and return (read) streams, the flat
//! object layouts embedded in transaction payloads, and the handful of
//! newtypes that keep handles, object pointers and cookies from being mixed
//! up in engine code.
//!
//! All wire structs are `#[repr(C)]` with explicit padding and derive the
//! `zerocopy` traits, so both sides can materialize them directly over
//! untrusted byte buffers and let validation happen at the field level.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Version reported by the `Version` ioctl. Bump on any incompatible change
/// to the record streams or the flat object layouts.
pub const PROTOCOL_VERSION: u32 = 1;

/// Width of one entry of a transaction's offsets array, in bytes. The offsets
/// half of a payload must be a multiple of this.
pub const OFFSET_WORD: u64 = 8;

/// Required alignment (and granularity) of the extra-buffers region of a
/// scatter-gather transaction.
pub const EXTRAS_ALIGN: u64 = 8;

/// A per-process numeric name for a reference to a remote node.
///
/// Handle 0 is reserved: in every process it names the context manager of
/// that process's naming domain. All other handles are densely allocated
/// starting at 1.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    /// The reserved rendezvous handle.
    pub const CONTEXT_MANAGER: Self = Self(0);

    pub fn is_context_manager(&self) -> bool {
        self.0 == 0
    }
}

/// Userspace pointer identifying an exported object within its owner
/// process. Opaque to the engine except as a lookup key.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ObjPtr(pub u64);

/// Userspace cookie carried alongside an object pointer. Fully opaque; the
/// engine only ever compares it for equality.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Cookie(pub u64);

/// Scheduling nicety. Numerically lower is better, as with POSIX nice
/// values.
///
/// This type *deliberately* does not implement `PartialOrd`/`Ord`, to keep us
/// from confusing ourselves on whether `>` means numerically greater / less
/// urgent, or more urgent / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Nice(pub i8);

impl Nice {
    /// Checks if `self` is strictly more urgent than `other` (numerically
    /// smaller).
    pub fn is_better_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

bitflags::bitflags! {
    /// Flag bits of a transaction request.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TxnFlags: u32 {
        /// One-way call: no reply, sender does not block.
        const ONE_WAY = 1 << 0;
        /// The sender of this request is willing to receive file
        /// descriptors in the reply.
        const ACCEPT_FDS = 1 << 4;
    }
}

/// Per-node policy bits carried in the `flags` word of a binder-typed flat
/// object when the node is first exported.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodePolicy {
    /// Minimum scheduling nicety applied to threads handling inbound calls.
    pub min_nice: Nice,
    /// Whether payloads carrying file descriptors are accepted.
    pub accepts_fds: bool,
}

impl NodePolicy {
    const NICE_MASK: u32 = 0xff;
    const ACCEPTS_FDS: u32 = 1 << 8;

    pub fn from_wire(flags: u32) -> Self {
        Self {
            min_nice: Nice((flags & Self::NICE_MASK) as u8 as i8),
            accepts_fds: flags & Self::ACCEPTS_FDS != 0,
        }
    }

    pub fn to_wire(self) -> u32 {
        let mut flags = u32::from(self.min_nice.0 as u8);
        if self.accepts_fds {
            flags |= Self::ACCEPTS_FDS;
        }
        flags
    }
}

/// Tags of the command (write) stream. Each record is the tag as a
/// little-endian `u32` followed by the fixed payload noted per variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    /// `u32` handle. Weak increment on a held reference.
    IncRefs = 1,
    /// `u32` handle. Strong increment on a held reference.
    Acquire = 2,
    /// `u32` handle. Strong decrement.
    Release = 3,
    /// `u32` handle. Weak decrement.
    DecRefs = 4,
    /// [`NodeRecord`]. Acknowledges a delivered `IncRefs` return.
    IncRefsDone = 5,
    /// [`NodeRecord`]. Acknowledges a delivered `Acquire` return.
    AcquireDone = 6,
    /// Reserved, never implemented. Always an error.
    AttemptAcquire = 7,
    /// Reserved, never implemented. Always an error.
    AcquireResult = 8,
    /// `u64` user pointer. Returns a delivered payload buffer to the
    /// allocator.
    FreeBuffer = 9,
    /// [`TransactionData`]. Synchronous or one-way call.
    Transaction = 10,
    /// [`TransactionData`]. Reply to the top of the caller stack.
    Reply = 11,
    /// [`TransactionDataSg`]. Call with an extra-buffers region.
    TransactionSg = 12,
    /// [`TransactionDataSg`]. Reply with an extra-buffers region.
    ReplySg = 13,
    /// No payload. Registers a spawned worker thread (in response to a
    /// `SpawnLooper` return).
    RegisterLooper = 14,
    /// No payload. Registers a caller-owned worker thread.
    EnterLooper = 15,
    /// No payload. Marks the thread as leaving its loop.
    ExitLooper = 16,
    /// [`DeathRequest`]. Asks for notification when the referenced node's
    /// owner dies.
    RequestDeathNotification = 17,
    /// [`DeathRequest`]. Cancels a previous request.
    ClearDeathNotification = 18,
    /// `u64` cookie. Acknowledges a delivered `DeadBinder` return.
    DeadBinderDone = 19,
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        Ok(match v {
            1 => Self::IncRefs,
            2 => Self::Acquire,
            3 => Self::Release,
            4 => Self::DecRefs,
            5 => Self::IncRefsDone,
            6 => Self::AcquireDone,
            7 => Self::AttemptAcquire,
            8 => Self::AcquireResult,
            9 => Self::FreeBuffer,
            10 => Self::Transaction,
            11 => Self::Reply,
            12 => Self::TransactionSg,
            13 => Self::ReplySg,
            14 => Self::RegisterLooper,
            15 => Self::EnterLooper,
            16 => Self::ExitLooper,
            17 => Self::RequestDeathNotification,
            18 => Self::ClearDeathNotification,
            19 => Self::DeadBinderDone,
            _ => return Err(v),
        })
    }
}

/// Tags of the return (read) stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Return {
    /// Leading marker emitted once per read buffer. No payload.
    Noop = 1,
    /// [`TransactionData`]: an inbound call to service.
    Transaction = 2,
    /// [`TransactionData`]: the reply to the caller's outstanding call.
    Reply = 3,
    /// No payload. The thread's most recent send was accepted.
    TransactionComplete = 4,
    /// [`NodeRecord`]. First weak reference appeared; acknowledge with
    /// `IncRefsDone`.
    IncRefs = 5,
    /// [`NodeRecord`]. First strong reference appeared; acknowledge with
    /// `AcquireDone`.
    Acquire = 6,
    /// [`NodeRecord`]. Last strong reference went away.
    Release = 7,
    /// [`NodeRecord`]. Last weak reference went away.
    DecRefs = 8,
    /// No payload. The process should start another worker thread.
    SpawnLooper = 9,
    /// `u64` cookie. A node with a death registration lost its owner;
    /// acknowledge with `DeadBinderDone`.
    DeadBinder = 10,
    /// `u64` cookie. A `ClearDeathNotification` finished.
    ClearDeathNotificationDone = 11,
    /// No payload. The target of the thread's send was dead.
    DeadReply = 12,
    /// No payload. The thread's send failed and was unwound.
    FailedReply = 13,
    /// `u32` error code. Driver-level failure unrelated to a send.
    Error = 14,
}

impl TryFrom<u32> for Return {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        Ok(match v {
            1 => Self::Noop,
            2 => Self::Transaction,
            3 => Self::Reply,
            4 => Self::TransactionComplete,
            5 => Self::IncRefs,
            6 => Self::Acquire,
            7 => Self::Release,
            8 => Self::DecRefs,
            9 => Self::SpawnLooper,
            10 => Self::DeadBinder,
            11 => Self::ClearDeathNotificationDone,
            12 => Self::DeadReply,
            13 => Self::FailedReply,
            14 => Self::Error,
            _ => return Err(v),
        })
    }
}

/// Payload of the node-reference returns (`IncRefs`/`Acquire`/`Release`/
/// `DecRefs`) and of the `IncRefsDone`/`AcquireDone` acknowledgement
/// commands.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct NodeRecord {
    pub ptr: ObjPtr,
    pub cookie: Cookie,
}

/// Payload of `RequestDeathNotification` / `ClearDeathNotification`.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct DeathRequest {
    pub handle: Handle,
    pub _pad: u32,
    pub cookie: Cookie,
}

impl DeathRequest {
    pub fn new(handle: Handle, cookie: Cookie) -> Self {
        Self { handle, _pad: 0, cookie }
    }
}

/// The fixed-layout descriptor of a call or reply, both on the send side
/// (embedded in `Transaction`/`Reply` command records) and on the delivery
/// side (embedded in `Transaction`/`Reply` return records).
///
/// On send, `target` is the handle being called (as a zero-extended `u32`)
/// and the data/offsets pointers lie in the sender's address space. On
/// delivery, `target` and `cookie` identify the called node in the owner's
/// terms, `sender_pid`/`sender_euid` identify the caller, and the pointers
/// lie in the receiver's read-only mapping.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TransactionData {
    pub target: u64,
    pub cookie: Cookie,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: u32,
    pub sender_euid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub data_ptr: u64,
    pub offsets_ptr: u64,
}

impl TransactionData {
    pub fn txn_flags(&self) -> TxnFlags {
        TxnFlags::from_bits_truncate(self.flags)
    }
}

/// Scatter-gather variant of [`TransactionData`], carrying the total size of
/// the extra-buffers region reachable through embedded `Ptr` objects.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TransactionDataSg {
    pub data: TransactionData,
    pub extras_size: u64,
}

/// Argument block of the `WriteRead` ioctl. All addresses are in the calling
/// process's address space.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct WriteRead {
    pub write_buffer: u64,
    pub write_size: u64,
    pub write_consumed: u64,
    pub read_buffer: u64,
    pub read_size: u64,
    pub read_consumed: u64,
}

/// Kinds of typed objects that may be embedded in a transaction payload,
/// indexed by the offsets array.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ObjectKind {
    /// Sender exports an object it owns (strong).
    Binder = 1,
    /// Sender exports an object it owns (weak).
    WeakBinder = 2,
    /// Sender passes a strong handle it holds.
    Handle = 3,
    /// Sender passes a weak handle it holds.
    WeakHandle = 4,
    /// Sender passes an open file.
    Fd = 5,
    /// Pointer-with-length into the extra-buffers region.
    Ptr = 6,
    /// Array of file descriptors stored inside a previously fixed-up
    /// parent buffer.
    FdArray = 7,
}

impl TryFrom<u32> for ObjectKind {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        Ok(match v {
            1 => Self::Binder,
            2 => Self::WeakBinder,
            3 => Self::Handle,
            4 => Self::WeakHandle,
            5 => Self::Fd,
            6 => Self::Ptr,
            7 => Self::FdArray,
            _ => return Err(v),
        })
    }
}

impl ObjectKind {
    /// Size in bytes of the wire struct for this kind.
    pub fn wire_size(self) -> u64 {
        match self {
            Self::Binder | Self::WeakBinder | Self::Handle
            | Self::WeakHandle => core::mem::size_of::<FlatObject>() as u64,
            Self::Fd => core::mem::size_of::<FdObject>() as u64,
            Self::Ptr => core::mem::size_of::<BufferObject>() as u64,
            Self::FdArray => core::mem::size_of::<FdArrayObject>() as u64,
        }
    }
}

/// Wire form of `Binder`/`WeakBinder`/`Handle`/`WeakHandle` objects.
///
/// For binder kinds `a` is the exported object pointer and `cookie` travels
/// with it; for handle kinds `a` is the handle zero-extended to 64 bits and
/// `cookie` must be zero.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct FlatObject {
    pub kind: u32,
    pub flags: u32,
    pub a: u64,
    pub cookie: Cookie,
}

impl FlatObject {
    pub fn binder(ptr: ObjPtr, cookie: Cookie, policy: NodePolicy) -> Self {
        Self {
            kind: ObjectKind::Binder as u32,
            flags: policy.to_wire(),
            a: ptr.0,
            cookie,
        }
    }

    pub fn handle(&self) -> Handle {
        Handle(self.a as u32)
    }
}

/// Wire form of an `Fd` object.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct FdObject {
    pub kind: u32,
    pub _pad: u32,
    pub fd: u32,
    pub _pad2: u32,
    pub cookie: Cookie,
}

impl FdObject {
    pub fn new(fd: u32) -> Self {
        Self {
            kind: ObjectKind::Fd as u32,
            _pad: 0,
            fd,
            _pad2: 0,
            cookie: Cookie(0),
        }
    }
}

bitflags::bitflags! {
    /// Flag bits of a [`BufferObject`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct BufferFlags: u32 {
        /// The object's storage lives inside another `Ptr` object's buffer
        /// and the parent must be patched with this buffer's translated
        /// address.
        const HAS_PARENT = 1 << 0;
    }
}

/// Wire form of a `Ptr` (pointer-with-length) object.
///
/// `parent` is an index into the offsets array naming an earlier `Ptr`
/// object; `parent_offset` is the byte offset inside that parent's buffer at
/// which this buffer's translated address gets patched. Both are ignored
/// unless [`BufferFlags::HAS_PARENT`] is set.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct BufferObject {
    pub kind: u32,
    pub flags: u32,
    pub buffer: u64,
    pub length: u64,
    pub parent: u64,
    pub parent_offset: u64,
}

impl BufferObject {
    pub fn buffer_flags(&self) -> BufferFlags {
        BufferFlags::from_bits_truncate(self.flags)
    }
}

/// Wire form of an `FdArray` object. The descriptors themselves are `u32`s
/// stored at `parent_offset` inside the named parent buffer.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct FdArrayObject {
    pub kind: u32,
    pub _pad: u32,
    pub num_fds: u64,
    pub parent: u64,
    pub parent_offset: u64,
}

/// An error committed by user code while interacting with the driver.
///
/// These are the recoverable conditions of the protocol: they are logged,
/// the offending command is skipped or the offending transaction unwound,
/// and the stream carries on. They never poison engine state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// Command tag not recognized (fatal for the ioctl, per protocol).
    BadCommand(u32),
    /// Reserved command tag issued.
    ReservedCommand(u32),
    /// Handle does not name a reference held by this process.
    BadHandle(u32),
    /// A weak-only reference was used where a strong one is required.
    WeakAsStrong(u32),
    /// Ref-count decrement with no matching increment.
    BadDecrement,
    /// `IncRefsDone`/`AcquireDone` for a node with no pending
    /// notification.
    NoPendingAck,
    /// Cookie does not match the node or registration it names.
    CookieMismatch,
    /// Reply issued with no incoming transaction on the thread's stack, or
    /// with a stack top addressed to a different thread.
    BadReplyTarget,
    /// Embedded object has an unknown kind, overlaps another, or extends
    /// past the payload.
    BadObject,
    /// Offsets array not a multiple of the offset word, extras region
    /// misaligned, or an offset out of increasing order.
    BadAlignment,
    /// A `Ptr`/`FdArray` fixup named a parent out of monotonic order.
    FixupOutOfOrder,
    /// A `Ptr`/`FdArray` parent reference was invalid or too small.
    BadParent,
    /// Payload carried an fd but the target does not accept fds.
    FdNotAccepted,
    /// Payload named an fd the sender does not hold.
    BadFd(u32),
    /// `FreeBuffer` pointer does not name a live delivered buffer.
    BadFreeAddress,
    /// `FreeBuffer` on a buffer the driver has not handed out.
    NotUserFreeable,
    /// A user-supplied address range fell outside the process's address
    /// space or crossed a region boundary.
    BadAddress,
    /// Looper lifecycle command out of order.
    LooperState,
    /// Death registration already exists, or clear/ack for an unknown
    /// registration.
    DeathRegistration,
    /// Extra-buffers region too small for the payload's `Ptr` objects.
    ExtrasExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes_are_stable() {
        // These sizes are ABI; a change here breaks every client.
        assert_eq!(core::mem::size_of::<FlatObject>(), 24);
        assert_eq!(core::mem::size_of::<FdObject>(), 24);
        assert_eq!(core::mem::size_of::<BufferObject>(), 40);
        assert_eq!(core::mem::size_of::<FdArrayObject>(), 32);
        assert_eq!(core::mem::size_of::<TransactionData>(), 64);
        assert_eq!(core::mem::size_of::<TransactionDataSg>(), 72);
        assert_eq!(core::mem::size_of::<WriteRead>(), 48);
        assert_eq!(core::mem::size_of::<NodeRecord>(), 16);
        assert_eq!(core::mem::size_of::<DeathRequest>(), 16);
    }

    #[test]
    fn command_tags_round_trip() {
        for tag in 1..=19u32 {
            let cmd = Command::try_from(tag).unwrap();
            assert_eq!(cmd as u32, tag);
        }
        assert!(Command::try_from(0).is_err());
        assert!(Command::try_from(20).is_err());
    }

    #[test]
    fn return_tags_round_trip() {
        for tag in 1..=14u32 {
            let ret = Return::try_from(tag).unwrap();
            assert_eq!(ret as u32, tag);
        }
        assert!(Return::try_from(15).is_err());
    }

    #[test]
    fn node_policy_wire_round_trip() {
        let p = NodePolicy { min_nice: Nice(-4), accepts_fds: true };
        assert_eq!(NodePolicy::from_wire(p.to_wire()), p);
        let q = NodePolicy { min_nice: Nice(10), accepts_fds: false };
        assert_eq!(NodePolicy::from_wire(q.to_wire()), q);
    }
}
