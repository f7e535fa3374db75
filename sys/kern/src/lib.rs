// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ferry transaction engine.
//!
//! This is the in-kernel half of a capability-based IPC subsystem: processes
//! open the driver, register worker threads, and exchange typed transaction
//! payloads referring to engine-managed object handles. One distinguished
//! process per naming domain registers as the *context manager*; everyone
//! else bootstraps by sending to handle zero.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled engine, there are some basic ideas
//! that appear consistently.
//!
//! 1. Untrusted input everywhere. Every address, handle, cookie and record
//!    arriving from a client is an allegation, validated at the point of use
//!    and answered with a recoverable error when it lies.
//! 2. Fine-grained locking with a fixed global order. Per-process and
//!    per-object locks are small and held briefly; see below.
//! 3. A strong preference for explicit state machines over clever
//!    bookkeeping. Reference-count notifications, looper lifecycle and death
//!    registrations are all enum- or flag-driven transitions.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//!
//! # Lock order
//!
//! Locks nest in one global order, outermost first:
//!
//! 1. process outer (index trees: threads, nodes, refs by handle/node)
//! 2. reference counts
//! 3. node state
//! 4. process inner (todo queue, delivered deaths, thread accounting)
//! 5. thread state (private todo, looper flags, transaction stack)
//! 6. transaction peers
//! 7. leaves: dead-node list, death records, address spaces, allocators,
//!    descriptor tables
//!
//! Taking a lock of process B while holding a lock of process A is permitted
//! only when B's lock sits at a *later* level than every held lock of A.
//! Skipping levels is fine; going backwards is not.
//!
//! Mutex poisoning is treated as a driver bug: a panic while holding an
//! engine lock means the invariants above are already gone, so lock
//! acquisitions unwrap and let the poison propagate.

pub mod alloc;
pub mod driver;
pub mod err;
pub mod files;
pub mod node;
pub mod process;
pub mod thread;
pub mod transaction;
pub mod umem;
pub mod work;

pub use driver::{Client, Driver, OpenOptions, Policy};
