// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-process file-descriptor table.
//!
//! The engine's contract with the descriptor table is narrow: acquire an
//! unused descriptor under the process's limit, install a duplicate of a
//! source file object into it, and close an installed descriptor. To let a
//! failing transaction back out cleanly, installation is two-phase: a
//! reservation pins the descriptor number, and the file is committed only
//! once the whole payload has translated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// An open file object. Opaque to the engine; transferring one duplicates
/// the `Arc`, so both processes end up with descriptors naming the same
/// object.
#[derive(Debug)]
pub struct File {
    pub debug_id: u32,
}

static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(1);

impl File {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            debug_id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
        })
    }
}

#[derive(Debug)]
enum Entry {
    Reserved,
    Open { file: Arc<File>, cloexec: bool },
}

#[derive(Debug)]
struct TableInner {
    entries: BTreeMap<u32, Entry>,
    limit: u32,
}

/// The descriptor table. Interior-locked leaf.
#[derive(Debug)]
pub struct FdTable {
    inner: Mutex<TableInner>,
}

/// Descriptors 0-2 are considered taken, as in any reasonable process.
const FIRST_FD: u32 = 3;

pub(crate) const DEFAULT_RLIMIT: u32 = 256;

impl FdTable {
    pub fn new(limit: u32) -> Self {
        Self {
            inner: Mutex::new(TableInner { entries: BTreeMap::new(), limit }),
        }
    }

    fn lowest_free(inner: &TableInner) -> Option<u32> {
        let mut fd = FIRST_FD;
        for k in inner.entries.keys() {
            if *k == fd {
                fd += 1;
            } else if *k > fd {
                break;
            }
        }
        (fd < inner.limit).then_some(fd)
    }

    /// Opens `file` at the lowest free descriptor. This is the user-side
    /// `open`; the engine uses [`FdTable::reserve`]/[`FdTable::commit`].
    pub fn install(&self, file: Arc<File>) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        let fd = Self::lowest_free(&inner)?;
        inner.entries.insert(fd, Entry::Open { file, cloexec: false });
        Some(fd)
    }

    /// Acquires an unused descriptor without making it usable yet.
    pub(crate) fn reserve(&self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        let fd = Self::lowest_free(&inner)?;
        inner.entries.insert(fd, Entry::Reserved);
        Some(fd)
    }

    /// Installs `file` into a previously reserved descriptor.
    pub(crate) fn commit(&self, fd: u32, file: Arc<File>, cloexec: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(&fd) {
            Some(Entry::Reserved) => {
                inner.entries.insert(fd, Entry::Open { file, cloexec });
            }
            other => {
                log::error!("commit of unreserved fd {fd}: {other:?}");
            }
        }
    }

    /// Closes a descriptor (reserved or open). Returns whether it existed.
    pub fn close(&self, fd: u32) -> bool {
        self.inner.lock().unwrap().entries.remove(&fd).is_some()
    }

    pub fn get(&self, fd: u32) -> Option<Arc<File>> {
        match self.inner.lock().unwrap().entries.get(&fd) {
            Some(Entry::Open { file, .. }) => Some(Arc::clone(file)),
            _ => None,
        }
    }

    pub fn cloexec(&self, fd: u32) -> Option<bool> {
        match self.inner.lock().unwrap().entries.get(&fd) {
            Some(Entry::Open { cloexec, .. }) => Some(*cloexec),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new(DEFAULT_RLIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_start_at_three_and_fill_gaps() {
        let t = FdTable::default();
        let a = t.install(File::new()).unwrap();
        let b = t.install(File::new()).unwrap();
        assert_eq!((a, b), (3, 4));
        t.close(a);
        assert_eq!(t.install(File::new()).unwrap(), 3);
    }

    #[test]
    fn reservation_blocks_reuse_until_closed() {
        let t = FdTable::default();
        let fd = t.reserve().unwrap();
        assert_eq!(fd, 3);
        assert_eq!(t.reserve().unwrap(), 4);
        // A reserved fd is not readable.
        assert!(t.get(fd).is_none());
        t.commit(fd, File::new(), true);
        assert!(t.get(fd).is_some());
        assert_eq!(t.cloexec(fd), Some(true));
        t.close(4);
    }

    #[test]
    fn rlimit_bounds_the_table() {
        let t = FdTable::new(5);
        assert_eq!(t.install(File::new()), Some(3));
        assert_eq!(t.install(File::new()), Some(4));
        assert_eq!(t.install(File::new()), None);
    }
}
