//! The file interface the memory subsystem consumes.
//!
//! Paging needs very little from a filesystem: positioned reads to load
//! file-backed pages, positioned writes to flush dirty mappings, and a way to
//! recover a handle that went stale between the time a segment was mapped and
//! the time it faults in. [`FileOps`] captures exactly that contract;
//! [`FileRef`] is the shared handle page descriptors hold.

pub mod mem_file;

pub use mem_file::MemFile;

use crate::sync::Mutex;
use alloc::sync::Arc;
use core::fmt;

pub trait FileOps: Send {
    /// Reads up to `buf.len()` bytes at byte `offset` into `buf`, returning
    /// the number of bytes read. Short reads happen at end of file or on a
    /// stale handle.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes `buf` at byte `offset`, growing the file if needed. Returns the
    /// number of bytes written.
    fn write_at(&mut self, buf: &[u8], offset: usize) -> usize;

    /// Re-acquires the underlying inode after a stale handle was detected.
    fn reopen(&mut self);

    fn is_writable(&self) -> bool;

    /// Current length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cloneable, thread-safe handle to an open file.
#[derive(Clone)]
pub struct FileRef(Arc<Mutex<dyn FileOps>>);

impl FileRef {
    pub fn new<F: FileOps + 'static>(file: F) -> Self {
        let inner: Arc<Mutex<dyn FileOps>> = Arc::new(Mutex::new(file));
        FileRef(inner)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.0.lock().read_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.0.lock().write_at(buf, offset)
    }

    pub fn reopen(&self) {
        self.0.lock().reopen();
    }

    pub fn is_writable(&self) -> bool {
        self.0.lock().is_writable()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FileRef(len: {})", self.len())
    }
}
