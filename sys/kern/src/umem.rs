// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! Every process the driver serves owns an [`AddressSpace`]: a flat,
//! permission-checked memory in which all user-visible pointers live. Two
//! regions exist -- a scratch region the process reads and writes freely
//! (command streams, payload staging, read buffers), and the driver mapping
//! installed by `mmap`, which the engine fills with delivered payloads and
//! the process may only read.
//!
//! A [`USlice`] is passed into the engine by a client and is intended to
//! refer to memory that client controls. The `USlice` type itself simply
//! represents an *allegation* that a section of address space is suitable;
//! it does not demonstrate that the process has access to that memory. To
//! actually touch the bytes, hand it to one of the `AddressSpace` accessors,
//! which validate it against the region table.

use std::sync::Mutex;

use ferry_abi::UsageError;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Base address of the scratch region of every process.
pub const SCRATCH_BASE: u64 = 0x1000;

/// Base address at which the driver mapping is installed.
pub const MAPPING_BASE: u64 = 0x1000_0000;

bitflags::bitflags! {
    /// Access rights of a region, from the owning process's point of view.
    /// The engine itself may always read, and may write any region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RegionAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A (user, untrusted, unprivileged) slice: base address and length in
/// bytes, with overflow ruled out at construction.
#[derive(Copy, Clone, Debug)]
pub struct USlice {
    base: u64,
    len: u64,
}

impl USlice {
    /// Constructs a `USlice` from untrusted base/length words. Fails only if
    /// the described range would wrap the address space.
    pub fn from_raw(base: u64, len: u64) -> Result<Self, UsageError> {
        let highest_possible_base = u64::MAX - len;
        if base <= highest_possible_base {
            Ok(Self { base, len })
        } else {
            Err(UsageError::BadAddress)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base_addr(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Address one past the final byte.
    pub fn end_addr(&self) -> u64 {
        self.base + self.len
    }
}

struct Region {
    base: u64,
    attrs: RegionAttributes,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn contains(&self, s: &USlice) -> bool {
        s.base_addr() >= self.base && s.end_addr() <= self.end()
    }
}

/// One process's flat memory. Interior-locked; this is a leaf lock in the
/// engine's global order.
pub struct AddressSpace {
    regions: Mutex<Vec<Region>>,
}

impl AddressSpace {
    /// Creates a space with a scratch region of `scratch_size` bytes at
    /// [`SCRATCH_BASE`].
    pub fn new(scratch_size: usize) -> Self {
        Self {
            regions: Mutex::new(vec![Region {
                base: SCRATCH_BASE,
                attrs: RegionAttributes::READ | RegionAttributes::WRITE,
                data: vec![0; scratch_size],
            }]),
        }
    }

    /// Installs a region. Used by the allocator to set up the mapping.
    pub(crate) fn add_region(
        &self,
        base: u64,
        size: usize,
        attrs: RegionAttributes,
    ) {
        let mut regions = self.regions.lock().unwrap();
        regions.push(Region { base, attrs, data: vec![0; size] });
    }

    fn access<R>(
        &self,
        slice: &USlice,
        required: RegionAttributes,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, UsageError> {
        if slice.is_empty() {
            // Empty slices are opted out of access checking so clients can
            // pass null/zero for absent halves.
            return Ok(f(&mut []));
        }
        let mut regions = self.regions.lock().unwrap();
        let region = regions
            .iter_mut()
            .find(|r| r.contains(slice))
            .ok_or(UsageError::BadAddress)?;
        if !region.attrs.contains(required) {
            return Err(UsageError::BadAddress);
        }
        let off = (slice.base_addr() - region.base) as usize;
        Ok(f(&mut region.data[off..off + slice.len() as usize]))
    }

    /// Reads bytes as the owning process: the range must be user-readable.
    pub fn read(&self, addr: u64, len: u64) -> Result<Vec<u8>, UsageError> {
        let slice = USlice::from_raw(addr, len)?;
        self.access(&slice, RegionAttributes::READ, |b| b.to_vec())
    }

    /// Writes bytes as the owning process: the range must be user-writable.
    /// In particular this refuses writes into the driver mapping.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), UsageError> {
        let slice = USlice::from_raw(addr, bytes.len() as u64)?;
        self.access(&slice, RegionAttributes::WRITE, |b| {
            b.copy_from_slice(bytes)
        })
    }

    /// Writes bytes with engine privilege, ignoring user access rights. The
    /// range must still fall inside a single region.
    pub(crate) fn write_privileged(
        &self,
        addr: u64,
        bytes: &[u8],
    ) -> Result<(), UsageError> {
        let slice = USlice::from_raw(addr, bytes.len() as u64)?;
        self.access(&slice, RegionAttributes::empty(), |b| {
            b.copy_from_slice(bytes)
        })
    }

    /// Reads a fixed-layout value as the owning process.
    pub fn read_obj<T: FromBytes>(&self, addr: u64) -> Result<T, UsageError> {
        let bytes = self.read(addr, core::mem::size_of::<T>() as u64)?;
        T::read_from_bytes(&bytes).map_err(|_| UsageError::BadAddress)
    }

    /// Writes a fixed-layout value as the owning process.
    pub fn write_obj<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        value: &T,
    ) -> Result<(), UsageError> {
        self.write(addr, value.as_bytes())
    }

    /// Writes a fixed-layout value with engine privilege.
    pub(crate) fn write_obj_privileged<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        value: &T,
    ) -> Result<(), UsageError> {
        self.write_privileged(addr, value.as_bytes())
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let regions = self.regions.lock().unwrap();
        let mut d = f.debug_list();
        for r in regions.iter() {
            d.entry(&format_args!(
                "{:#x}..{:#x} {:?}",
                r.base,
                r.end(),
                r.attrs
            ));
        }
        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uslice_rejects_wrapping_ranges() {
        assert!(USlice::from_raw(u64::MAX - 4, 8).is_err());
        assert!(USlice::from_raw(u64::MAX - 8, 8).is_ok());
    }

    #[test]
    fn scratch_round_trip() {
        let vm = AddressSpace::new(0x1000);
        vm.write(SCRATCH_BASE + 16, b"hello").unwrap();
        assert_eq!(vm.read(SCRATCH_BASE + 16, 5).unwrap(), b"hello");
    }

    #[test]
    fn out_of_region_access_faults() {
        let vm = AddressSpace::new(0x100);
        assert_eq!(
            vm.read(SCRATCH_BASE + 0xf8, 16),
            Err(UsageError::BadAddress)
        );
        assert_eq!(vm.write(0, &[1]), Err(UsageError::BadAddress));
    }

    #[test]
    fn mapping_is_read_only_to_the_user() {
        let vm = AddressSpace::new(0x100);
        vm.add_region(MAPPING_BASE, 0x100, RegionAttributes::READ);
        assert_eq!(
            vm.write(MAPPING_BASE, &[1, 2, 3]),
            Err(UsageError::BadAddress)
        );
        vm.write_privileged(MAPPING_BASE, &[1, 2, 3]).unwrap();
        assert_eq!(vm.read(MAPPING_BASE, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn access_must_stay_within_one_region() {
        let vm = AddressSpace::new(0x100);
        vm.add_region(MAPPING_BASE, 0x100, RegionAttributes::READ);
        // A range spanning from scratch into unmapped space.
        assert!(vm.read(SCRATCH_BASE, 0x200).is_err());
    }

    #[test]
    fn empty_slices_always_pass() {
        let vm = AddressSpace::new(0x10);
        vm.read(0xdead_beef, 0).unwrap();
        vm.write(0xdead_beef, &[]).unwrap();
    }
}
