//! Per-process page bookkeeping.
//!
//! The supplemental page table is a sparse map from virtual page address to
//! [`PageDescriptor`]. A descriptor records what backs the page and where its
//! content currently is; the hardware-facing translation entries in
//! [`PageDirectory`] are derived state, installed by the fault path and torn
//! down at eviction.

use crate::fs::FileRef;
use crate::sync::Mutex;
use crate::vm::swap::SwapSlot;
use crate::vm::{Aid, Vm};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use huronos_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE, USER_STACK_TOP};
use huronos_shared::paging::PageDirectory;
use log::debug;

/// What stands behind a virtual page when it is not resident.
///
/// The eviction rules differ per case, so code switching on this is expected
/// to match exhaustively rather than probe flags.
#[derive(Clone)]
pub enum PageBacking {
    /// Anonymous memory, zero-filled on first touch.
    Zero,
    /// Stack page: zero-filled on first touch. Evicted content always goes
    /// to swap, never to a file and never discarded.
    Stack,
    /// Loaded from `len` bytes of `file` starting at `offset`. Never written
    /// back; once dirtied and evicted the content lives in swap.
    File {
        file: FileRef,
        offset: usize,
        len: usize,
    },
    /// Memory-mapped file region: dirty content is written back to the file
    /// on eviction.
    Mmap {
        file: FileRef,
        offset: usize,
        len: usize,
    },
}

impl PageBacking {
    pub fn is_mmap(&self) -> bool {
        matches!(self, PageBacking::Mmap { .. })
    }
}

/// Where a page's content is right now.
///
/// A descriptor moves `Unbacked → Resident` on its first fault and bounces
/// `Resident ↔ InSwap` from then on; it never holds a frame and a swap slot
/// at the same time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Residency {
    /// Never faulted in.
    Unbacked,
    /// Occupying the frame with this index.
    Resident(usize),
    /// Written out to this swap slot.
    InSwap(SwapSlot),
}

/// One virtual page of one process.
pub struct PageDescriptor {
    pub(crate) writable: bool,
    pub(crate) backing: PageBacking,
    pub(crate) residency: Residency,
}

pub(crate) struct AspaceInner {
    pub(crate) pages: BTreeMap<usize, PageDescriptor>,
    pub(crate) pagedir: PageDirectory,
    /// Lowest user stack pointer seen so far; faults above it may grow the
    /// stack.
    pub(crate) stack_low: usize,
}

/// One process's virtual address space: supplemental page table plus
/// translation tables, guarded by a single lock.
///
/// Fault servicing, descriptor destruction, and pin acquisition for pages of
/// this space all serialize on that lock.
pub struct AddressSpace {
    aid: Aid,
    pub(crate) inner: Mutex<AspaceInner>,
}

impl AddressSpace {
    pub(crate) fn new(aid: Aid) -> Self {
        Self {
            aid,
            inner: Mutex::new(AspaceInner {
                pages: BTreeMap::new(),
                pagedir: PageDirectory::new(),
                stack_low: USER_STACK_TOP,
            }),
        }
    }

    pub fn aid(&self) -> Aid {
        self.aid
    }

    /// Records the user stack pointer observed at kernel entry; feeds the
    /// stack-growth heuristic.
    pub fn note_stack_pointer(&self, esp: usize) {
        let mut inner = self.inner.lock();
        inner.stack_low = inner.stack_low.min(esp);
    }

    /// Where the content of the page at `vaddr` currently lives, or `None`
    /// if the page was never allocated.
    pub fn residency(&self, vaddr: usize) -> Option<Residency> {
        let vpage = page_round_down(vaddr);
        self.inner.lock().pages.get(&vpage).map(|p| p.residency)
    }

    /// The installed translation for `vaddr` as (frame, writable), if any.
    pub fn translation(&self, vaddr: usize) -> Option<(usize, bool)> {
        let vpage = page_round_down(vaddr);
        let inner = self.inner.lock();
        let frame = inner.pagedir.frame(vpage)?;
        Some((frame, inner.pagedir.is_writable(vpage)))
    }

    pub fn is_accessed(&self, vaddr: usize) -> bool {
        self.inner.lock().pagedir.is_accessed(page_round_down(vaddr))
    }

    pub fn is_dirty(&self, vaddr: usize) -> bool {
        self.inner.lock().pagedir.is_dirty(page_round_down(vaddr))
    }

    /// Sets the accessed bit hardware would set on a touch. The user-copy
    /// paths do this themselves; trap stubs and tests use it directly.
    pub fn set_accessed(&self, vaddr: usize, accessed: bool) {
        self.inner
            .lock()
            .pagedir
            .set_accessed(page_round_down(vaddr), accessed);
    }

    pub fn set_dirty(&self, vaddr: usize, dirty: bool) {
        self.inner
            .lock()
            .pagedir
            .set_dirty(page_round_down(vaddr), dirty);
    }
}

impl Vm {
    /// Claims the page at `vaddr` for `aspace` without making it resident.
    ///
    /// Returns false if the page is already allocated; the existing
    /// descriptor is left untouched.
    pub fn allocate_page(
        &self,
        aspace: &AddressSpace,
        vaddr: usize,
        writable: bool,
        backing: PageBacking,
    ) -> bool {
        let vpage = page_round_down(vaddr);
        let mut inner = aspace.inner.lock();
        if inner.pages.contains_key(&vpage) {
            debug!(
                "aspace {}: cannot allocate {:#x}, address in use",
                aspace.aid(),
                vpage
            );
            return false;
        }
        inner.pages.insert(
            vpage,
            PageDescriptor {
                writable,
                backing,
                residency: Residency::Unbacked,
            },
        );
        true
    }

    /// Releases the page at `vaddr` and everything it holds.
    ///
    /// Panics if the page was never allocated; freeing an unknown address is
    /// a caller bug, not a runtime condition.
    pub fn free_page(&self, aspace: &AddressSpace, vaddr: usize) {
        let vpage = page_round_down(vaddr);
        let residency = match aspace.inner.lock().pages.get(&vpage) {
            Some(desc) => desc.residency,
            None => panic!(
                "aspace {}: no page allocated at {:#x}",
                aspace.aid(),
                vpage
            ),
        };

        match residency {
            Residency::Resident(idx) => {
                self.frames.release(&self.spaces, idx, (aspace.aid(), vpage));
                // The scan can move the page to swap between the residency
                // check above and release taking the pool lock; drop the
                // slot it landed in.
                if let Some(Residency::InSwap(slot)) = aspace.residency(vpage) {
                    self.swap.free(slot);
                }
            }
            Residency::InSwap(slot) => self.swap.free(slot),
            Residency::Unbacked => {}
        }

        let mut inner = aspace.inner.lock();
        inner.pagedir.clear(vpage);
        inner.pages.remove(&vpage);
    }

    /// Tears down every page of `aspace`. Called at process exit.
    pub fn free_all_pages(&self, aspace: &AddressSpace) {
        let vpages: Vec<usize> = aspace.inner.lock().pages.keys().copied().collect();
        for vpage in vpages {
            self.free_page(aspace, vpage);
        }
    }

    /// Stops future write-back for the memory-mapped page at `vaddr`, used
    /// when its backing file is being closed. The page keeps its frame or
    /// swap slot and simply behaves as a plain file-backed page from here
    /// on. Idempotent; returns false if the page was never allocated.
    pub fn unmap_page(&self, aspace: &AddressSpace, vaddr: usize) -> bool {
        let vpage = page_round_down(vaddr);
        let mut inner = aspace.inner.lock();
        let Some(desc) = inner.pages.get_mut(&vpage) else {
            return false;
        };
        if let PageBacking::Mmap { file, offset, len } = &desc.backing {
            let downgraded = PageBacking::File {
                file: file.clone(),
                offset: *offset,
                len: *len,
            };
            desc.backing = downgraded;
        }
        true
    }

    /// Maps the whole of `file` at `base`, one descriptor per page, the last
    /// one covering the file's tail. Returns false (leaving any pages it
    /// already claimed in place) if `base` is unaligned, the file is empty,
    /// or part of the range is taken.
    pub fn map_file(&self, aspace: &AddressSpace, file: &FileRef, base: usize) -> bool {
        if !is_page_aligned(base) || file.is_empty() {
            return false;
        }
        let len = file.len();
        let writable = file.is_writable();
        let mut offset = 0;
        let mut vpage = base;
        while offset < len {
            let chunk = (len - offset).min(PAGE_FRAME_SIZE);
            let backing = PageBacking::Mmap {
                file: file.clone(),
                offset,
                len: chunk,
            };
            if !self.allocate_page(aspace, vpage, writable, backing) {
                return false;
            }
            offset += chunk;
            vpage += PAGE_FRAME_SIZE;
        }
        debug!(
            "aspace {}: mapped {} byte file at {:#x}",
            aspace.aid(),
            len,
            base
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::fs::MemFile;
    use crate::vm::swap::PAGE_SECTORS;

    fn test_vm(frame_count: usize, swap_slots: usize) -> Vm {
        let sectors = (swap_slots * PAGE_SECTORS) as u32;
        let device = Block::new(
            BlockType::Swap,
            "swap0",
            sectors,
            BlockDriver::RamDisk(RamDisk::new(sectors)),
        );
        Vm::new(frame_count, device)
    }

    #[test]
    fn double_allocate_fails_and_keeps_original() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();

        assert!(vm.allocate_page(&aspace, 0x4000, true, PageBacking::Zero));
        assert!(!vm.allocate_page(&aspace, 0x4000, false, PageBacking::Stack));

        // the original descriptor is untouched
        let inner = aspace.inner.lock();
        let desc = inner.pages.get(&0x4000).expect("descriptor missing");
        assert!(desc.writable);
        assert!(matches!(desc.backing, PageBacking::Zero));
        assert_eq!(desc.residency, Residency::Unbacked);
    }

    #[test]
    fn allocate_rounds_to_page() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        assert!(vm.allocate_page(&aspace, 0x4abc, true, PageBacking::Zero));
        assert!(!vm.allocate_page(&aspace, 0x4000, true, PageBacking::Zero));
        assert_eq!(aspace.residency(0x4fff), Some(Residency::Unbacked));
    }

    #[test]
    fn unmap_is_idempotent() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        let file = FileRef::new(MemFile::new(vec![0xcd; 64], true));
        assert!(vm.allocate_page(
            &aspace,
            0x8000,
            true,
            PageBacking::Mmap {
                file,
                offset: 0,
                len: 64,
            },
        ));

        assert!(vm.unmap_page(&aspace, 0x8000));
        assert!(vm.unmap_page(&aspace, 0x8000));
        let inner = aspace.inner.lock();
        let desc = inner.pages.get(&0x8000).expect("descriptor missing");
        assert!(!desc.backing.is_mmap());

        drop(inner);
        assert!(!vm.unmap_page(&aspace, 0x9000));
    }

    #[test]
    #[should_panic]
    fn free_of_unallocated_page_panics() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        vm.free_page(&aspace, 0x4000);
    }

    #[test]
    fn map_file_covers_tail_page() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        let file = FileRef::new(MemFile::new(vec![1; PAGE_FRAME_SIZE + 100], false));

        assert!(vm.map_file(&aspace, &file, 0x10000));
        assert_eq!(aspace.residency(0x10000), Some(Residency::Unbacked));
        assert_eq!(aspace.residency(0x11000), Some(Residency::Unbacked));
        assert_eq!(aspace.residency(0x12000), None);

        let inner = aspace.inner.lock();
        match &inner.pages.get(&0x11000).expect("tail page missing").backing {
            PageBacking::Mmap { offset, len, .. } => {
                assert_eq!(*offset, PAGE_FRAME_SIZE);
                assert_eq!(*len, 100);
            }
            _ => panic!("tail page is not mmap-backed"),
        }
    }

    #[test]
    fn map_file_rejects_overlap_and_empty() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        let empty = FileRef::new(MemFile::new(Vec::new(), false));
        assert!(!vm.map_file(&aspace, &empty, 0x10000));

        assert!(vm.allocate_page(&aspace, 0x11000, true, PageBacking::Zero));
        let file = FileRef::new(MemFile::new(vec![1; 2 * PAGE_FRAME_SIZE], false));
        assert!(!vm.map_file(&aspace, &file, 0x10000));
        // unaligned base
        assert!(!vm.map_file(&aspace, &file, 0x10004));
    }

    #[test]
    fn stack_pointer_only_moves_down() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        aspace.note_stack_pointer(0x7000_0000);
        aspace.note_stack_pointer(0x7000_1000);
        let low = aspace.inner.lock().stack_low;
        assert_eq!(low, 0x7000_0000);
    }
}
