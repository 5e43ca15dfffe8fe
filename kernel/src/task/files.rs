//! Per-process open-file table.
//!
//! The core never looks inside a file; it only holds, copies and drops
//! reference-counted handles owned by the file layer. Dropping the last
//! handle closes the file.

use alloc::sync::Arc;
use core::fmt::Debug;

use crate::config::NOFILE;

/// An open file or directory, as seen by the process core.
pub trait FileObject: Send + Sync + Debug {}

/// Shared handle to an open file.
pub type FileRef = Arc<dyn FileObject>;

/// Fixed-size descriptor table. `Clone` duplicates every handle, which is
/// what `fork` needs.
#[derive(Debug, Default, Clone)]
pub struct FileTable {
    slots: [Option<FileRef>; NOFILE],
}

impl FileTable {
    /// Puts `file` in the lowest free descriptor.
    pub fn install(&mut self, file: FileRef) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(file);
        Some(fd)
    }

    pub fn close(&mut self, fd: usize) -> Option<FileRef> {
        self.slots.get_mut(fd)?.take()
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
