// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reference implementation of the per-process buffer allocator.
//!
//! The transaction engine treats this as an external collaborator: given a
//! process's single read-only mapping, it reserves and frees sized regions
//! inside that mapping and translates between engine bookkeeping and
//! user-visible addresses. The engine consumes only `alloc_buf`, `free_buf`,
//! `prepare_to_free` and the mapping geometry.
//!
//! Allocation is a best-fit free list. Half of the mapping is reserved as a
//! budget for asynchronous transactions so that a flood of one-way sends
//! cannot starve synchronous traffic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ferry_abi::UsageError;

use crate::node::Node;
use crate::transaction::Transaction;
use crate::umem::{AddressSpace, RegionAttributes, MAPPING_BASE};

/// Hard cap on the size of a process's mapping; larger requests are
/// truncated.
pub const MAPPING_CAP: u64 = 4 * 1024 * 1024;

pub(crate) fn align8(x: u64) -> u64 {
    (x + 7) & !7
}

/// One payload region handed out by the allocator. Lives until the
/// receiving process frees it (or its process is torn down).
pub struct Buffer {
    pub debug_id: u32,
    user_addr: u64,
    total: u64,
    pub data_size: u64,
    pub offsets_size: u64,
    pub extras_size: u64,
    pub is_async: bool,
    /// The user may only free buffers the driver has handed out.
    allow_user_free: AtomicBool,
    /// Back-pointer to the in-flight transaction, cleared when either side
    /// lets go first.
    pub(crate) transaction: Mutex<Weak<Transaction>>,
    /// Strong count holder for the recipient-side dec on free.
    pub(crate) target_node: Mutex<Option<Arc<Node>>>,
}

impl Buffer {
    /// User address of the data half.
    pub fn data_addr(&self) -> u64 {
        self.user_addr
    }

    /// User address of the offsets array, data padded to the offset word.
    pub fn offsets_addr(&self) -> u64 {
        self.user_addr + align8(self.data_size)
    }

    /// User address of the extra-buffers region.
    pub fn extras_addr(&self) -> u64 {
        self.offsets_addr() + align8(self.offsets_size)
    }

    pub(crate) fn set_user_free(&self, allow: bool) {
        self.allow_user_free.store(allow, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("debug_id", &self.debug_id)
            .field("user_addr", &format_args!("{:#x}", self.user_addr))
            .field("data_size", &self.data_size)
            .field("offsets_size", &self.offsets_size)
            .field("extras_size", &self.extras_size)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Why an allocation could not be satisfied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AllocError {
    /// No mapping installed (or already torn down); the target cannot
    /// receive anything.
    NotMapped,
    /// Not enough contiguous space.
    Exhausted,
    /// The async half of the mapping is spoken for.
    AsyncBudget,
}

#[derive(Copy, Clone, Debug)]
struct Extent {
    off: u64,
    len: u64,
}

#[derive(Default)]
struct AllocInner {
    base: u64,
    size: u64,
    mapped: bool,
    free: Vec<Extent>,
    async_free: u64,
    buffers: BTreeMap<u64, Arc<Buffer>>,
}

/// Per-process allocator state. Interior-locked leaf.
#[derive(Default)]
pub struct Allocator {
    inner: Mutex<AllocInner>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the mapping: reserves `requested` bytes (capped at
    /// [`MAPPING_CAP`]) at [`MAPPING_BASE`] in `vm`, read-only to the user.
    /// Returns the base and effective size.
    pub(crate) fn mmap(
        &self,
        vm: &AddressSpace,
        requested: u64,
    ) -> Result<(u64, u64), crate::err::IoctlError> {
        let size = requested.min(MAPPING_CAP);
        if size == 0 {
            return Err(crate::err::IoctlError::BadRequest);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.mapped {
            return Err(crate::err::IoctlError::AlreadyMapped);
        }
        vm.add_region(MAPPING_BASE, size as usize, RegionAttributes::READ);
        inner.base = MAPPING_BASE;
        inner.size = size;
        inner.mapped = true;
        inner.free = vec![Extent { off: 0, len: size }];
        inner.async_free = size / 2;
        Ok((MAPPING_BASE, size))
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.inner.lock().unwrap().mapped
    }

    /// Reserves a region sized for `data + padded offsets + extras`.
    pub(crate) fn alloc_buf(
        &self,
        debug_id: u32,
        data_size: u64,
        offsets_size: u64,
        extras_size: u64,
        is_async: bool,
    ) -> Result<Arc<Buffer>, AllocError> {
        let total =
            align8(data_size) + align8(offsets_size) + align8(extras_size);
        // Zero-sized payloads still need a distinct address.
        let total = total.max(8);

        let mut inner = self.inner.lock().unwrap();
        if !inner.mapped {
            return Err(AllocError::NotMapped);
        }
        if is_async && inner.async_free < total {
            log::warn!(
                "alloc {}: async budget exhausted ({} < {})",
                debug_id,
                inner.async_free,
                total
            );
            return Err(AllocError::AsyncBudget);
        }

        // Best fit: smallest free extent that can hold the request.
        let slot = inner
            .free
            .iter()
            .enumerate()
            .filter(|(_, e)| e.len >= total)
            .min_by_key(|(_, e)| e.len)
            .map(|(i, _)| i)
            .ok_or(AllocError::Exhausted)?;

        let extent = inner.free[slot];
        if extent.len == total {
            inner.free.remove(slot);
        } else {
            inner.free[slot] =
                Extent { off: extent.off + total, len: extent.len - total };
        }
        if is_async {
            inner.async_free -= total;
        }

        let buffer = Arc::new(Buffer {
            debug_id,
            user_addr: inner.base + extent.off,
            total,
            data_size,
            offsets_size,
            extras_size,
            is_async,
            allow_user_free: AtomicBool::new(false),
            transaction: Mutex::new(Weak::new()),
            target_node: Mutex::new(None),
        });
        inner.buffers.insert(extent.off, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Validates a `FreeBuffer` pointer and detaches the buffer from the
    /// allocator's live set. The caller unwinds the buffer's references and
    /// then calls [`Allocator::free_buf`].
    pub(crate) fn prepare_to_free(
        &self,
        user_ptr: u64,
    ) -> Result<Arc<Buffer>, UsageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.mapped || user_ptr < inner.base {
            return Err(UsageError::BadFreeAddress);
        }
        let off = user_ptr - inner.base;
        let buffer = match inner.buffers.get(&off) {
            Some(b) => Arc::clone(b),
            None => return Err(UsageError::BadFreeAddress),
        };
        if !buffer.allow_user_free.load(Ordering::Relaxed) {
            return Err(UsageError::NotUserFreeable);
        }
        inner.buffers.remove(&off);
        Ok(buffer)
    }

    /// Returns a buffer's extent to the free list.
    pub(crate) fn free_buf(&self, buffer: &Buffer) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.mapped {
            return;
        }
        let off = buffer.user_addr - inner.base;
        inner.buffers.remove(&off);
        if buffer.is_async {
            inner.async_free += buffer.total;
        }
        // Insert sorted and coalesce with neighbors.
        let pos = inner
            .free
            .iter()
            .position(|e| e.off > off)
            .unwrap_or(inner.free.len());
        inner.free.insert(pos, Extent { off, len: buffer.total });
        let mut i = pos.saturating_sub(1);
        while i + 1 < inner.free.len() {
            let (a, b) = (inner.free[i], inner.free[i + 1]);
            if a.off + a.len == b.off {
                inner.free[i].len += b.len;
                inner.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Tears the allocator down on process release, returning every live
    /// buffer so the caller can unwind their reference effects.
    pub(crate) fn release(&self) -> Vec<Arc<Buffer>> {
        let mut inner = self.inner.lock().unwrap();
        inner.mapped = false;
        inner.free.clear();
        let buffers = core::mem::take(&mut inner.buffers);
        buffers.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(size: u64) -> (Allocator, AddressSpace) {
        let alloc = Allocator::new();
        let vm = AddressSpace::new(0x100);
        alloc.mmap(&vm, size).unwrap();
        (alloc, vm)
    }

    #[test]
    fn second_mmap_is_rejected() {
        let (alloc, vm) = mapped(0x1000);
        assert!(matches!(
            alloc.mmap(&vm, 0x1000),
            Err(crate::err::IoctlError::AlreadyMapped)
        ));
    }

    #[test]
    fn oversize_mapping_is_truncated() {
        let alloc = Allocator::new();
        let vm = AddressSpace::new(0x100);
        let (_, size) = alloc.mmap(&vm, MAPPING_CAP * 4).unwrap();
        assert_eq!(size, MAPPING_CAP);
    }

    #[test]
    fn alloc_free_reuses_space() {
        let (alloc, _vm) = mapped(0x100);
        let a = alloc.alloc_buf(1, 0x80, 0, 0, false).unwrap();
        // Only 0x80 left; another 0x80 fits, a byte more does not.
        assert!(alloc.alloc_buf(2, 0x81, 0, 0, false).is_err());
        let b = alloc.alloc_buf(3, 0x80, 0, 0, false).unwrap();
        assert_ne!(a.data_addr(), b.data_addr());
        alloc.free_buf(&a);
        alloc.free_buf(&b);
        // Coalesced back into one extent.
        alloc.alloc_buf(4, 0x100, 0, 0, false).unwrap();
    }

    #[test]
    fn async_budget_is_half_the_mapping() {
        let (alloc, _vm) = mapped(0x100);
        let a = alloc.alloc_buf(1, 0x80, 0, 0, true).unwrap();
        // Budget drained; even a minimal async alloc fails now.
        assert_eq!(
            alloc.alloc_buf(2, 8, 0, 0, true).unwrap_err(),
            AllocError::AsyncBudget
        );
        // Synchronous allocation is unaffected.
        alloc.alloc_buf(3, 0x78, 0, 0, false).unwrap();
        alloc.free_buf(&a);
        alloc.alloc_buf(4, 8, 0, 0, true).unwrap();
    }

    #[test]
    fn user_free_gating() {
        let (alloc, _vm) = mapped(0x100);
        let a = alloc.alloc_buf(1, 16, 8, 0, false).unwrap();
        assert_eq!(
            alloc.prepare_to_free(a.data_addr()).unwrap_err(),
            UsageError::NotUserFreeable
        );
        a.set_user_free(true);
        let b = alloc.prepare_to_free(a.data_addr()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // Second free of the same pointer no longer matches anything.
        assert_eq!(
            alloc.prepare_to_free(a.data_addr()).unwrap_err(),
            UsageError::BadFreeAddress
        );
    }

    #[test]
    fn layout_is_data_offsets_extras() {
        let (alloc, _vm) = mapped(0x1000);
        let b = alloc.alloc_buf(1, 12, 8, 24, false).unwrap();
        assert_eq!(b.offsets_addr(), b.data_addr() + 16);
        assert_eq!(b.extras_addr(), b.data_addr() + 24);
    }
}
