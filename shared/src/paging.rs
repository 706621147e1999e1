//! Software page tables.
//!
//! Each address space owns a [`PageDirectory`] mapping virtual pages to frame
//! numbers. Entries carry the protection and hardware-tracking bits an x86
//! page table would: the layout of [`PageTableEntry`] follows the 32-bit PTE
//! format, with the frame number in the top twenty bits. The walk itself is
//! done in software here; the memory subsystem only relies on the contract of
//! install/clear/query operations.

use crate::mem::is_page_aligned;
use alloc::collections::BTreeMap;
use arbitrary_int::u20;
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    writable: bool,
    #[bit(2, rw)]
    user: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    frame: u20,
}

/// Per-address-space translation table.
#[derive(Default)]
pub struct PageDirectory {
    entries: BTreeMap<usize, PageTableEntry>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `vpage` to `frame` with the given write permission. The accessed
    /// and dirty bits of the new entry start clear.
    pub fn install(&mut self, vpage: usize, frame: usize, writable: bool) {
        assert!(is_page_aligned(vpage), "unaligned vpage {:#x}", vpage);
        let entry = PageTableEntry::default()
            .with_present(true)
            .with_writable(writable)
            .with_user(true)
            .with_frame(u20::new(frame as u32));
        self.entries.insert(vpage, entry);
    }

    /// Removes the mapping for `vpage`, if any.
    pub fn clear(&mut self, vpage: usize) {
        self.entries.remove(&vpage);
    }

    /// Frame number `vpage` maps to, or `None` if unmapped.
    pub fn frame(&self, vpage: usize) -> Option<usize> {
        self.lookup(vpage).map(|e| e.frame().value() as usize)
    }

    pub fn is_mapped(&self, vpage: usize) -> bool {
        self.lookup(vpage).is_some()
    }

    pub fn is_writable(&self, vpage: usize) -> bool {
        self.lookup(vpage).is_some_and(|e| e.writable())
    }

    pub fn is_accessed(&self, vpage: usize) -> bool {
        self.lookup(vpage).is_some_and(|e| e.accessed())
    }

    pub fn set_accessed(&mut self, vpage: usize, accessed: bool) {
        self.update(vpage, |e| e.with_accessed(accessed));
    }

    pub fn is_dirty(&self, vpage: usize) -> bool {
        self.lookup(vpage).is_some_and(|e| e.dirty())
    }

    pub fn set_dirty(&mut self, vpage: usize, dirty: bool) {
        self.update(vpage, |e| e.with_dirty(dirty));
    }

    fn lookup(&self, vpage: usize) -> Option<PageTableEntry> {
        self.entries.get(&vpage).copied().filter(|e| e.present())
    }

    fn update(&mut self, vpage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.get_mut(&vpage) {
            *entry = f(*entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PAGE_FRAME_SIZE;

    #[test]
    fn install_and_query() {
        let mut dir = PageDirectory::new();
        let vpage = 4 * PAGE_FRAME_SIZE;
        assert!(!dir.is_mapped(vpage));

        dir.install(vpage, 7, true);
        assert_eq!(dir.frame(vpage), Some(7));
        assert!(dir.is_writable(vpage));
        assert!(!dir.is_accessed(vpage));
        assert!(!dir.is_dirty(vpage));

        dir.set_accessed(vpage, true);
        dir.set_dirty(vpage, true);
        assert!(dir.is_accessed(vpage));
        assert!(dir.is_dirty(vpage));

        dir.clear(vpage);
        assert!(!dir.is_mapped(vpage));
        assert!(!dir.is_dirty(vpage));
    }

    #[test]
    fn reinstall_clears_tracking_bits() {
        let mut dir = PageDirectory::new();
        let vpage = PAGE_FRAME_SIZE;
        dir.install(vpage, 1, false);
        dir.set_accessed(vpage, true);
        dir.install(vpage, 2, false);
        assert_eq!(dir.frame(vpage), Some(2));
        assert!(!dir.is_accessed(vpage));
        assert!(!dir.is_writable(vpage));
    }

    #[test]
    #[should_panic]
    fn unaligned_install_panics() {
        let mut dir = PageDirectory::new();
        dir.install(0x1234, 0, false);
    }
}
