//! Direct access to user memory from kernel code.
//!
//! Syscall handlers that read or write user buffers pin each page for the
//! duration of the byte copy, so the eviction scan cannot take the frame
//! away mid-transfer. The copies maintain the accessed and dirty bits
//! hardware would set on a real touch.

use crate::vm::page::Residency;
use crate::vm::{AddressSpace, Vm, VmError};
use alloc::vec::Vec;
use huronos_shared::mem::{is_user_vaddr, page_round_down, PAGE_FRAME_SIZE};

impl Vm {
    /// Copies `len` bytes at user address `vaddr` into kernel memory,
    /// faulting pages in as needed.
    pub fn copy_from_user(
        &self,
        aspace: &AddressSpace,
        vaddr: usize,
        len: usize,
    ) -> Result<Vec<u8>, VmError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = check_user_range(vaddr, len)?;

        let mut out = Vec::with_capacity(len);
        let mut addr = vaddr;
        while addr < end {
            let vpage = page_round_down(addr);
            let chunk = (vpage + PAGE_FRAME_SIZE).min(end) - addr;
            self.pin_page(aspace, addr, false)?;
            {
                let mut inner = aspace.inner.lock();
                let idx = match inner.pages.get(&vpage).map(|desc| desc.residency) {
                    Some(Residency::Resident(idx)) => idx,
                    other => panic!("pinned page {:#x} not resident: {:?}", vpage, other),
                };
                // SAFETY: the pin gate is held, so the frame stays put.
                let bytes = unsafe { self.frames.frame_bytes(idx) };
                out.extend_from_slice(&bytes[addr - vpage..addr - vpage + chunk]);
                inner.pagedir.set_accessed(vpage, true);
            }
            self.unpin_page(aspace, addr);
            addr += chunk;
        }
        Ok(out)
    }

    /// Copies `data` to user address `vaddr`, faulting pages in as needed.
    /// Fails with [`VmError::ReadOnly`] if any page of the range is not
    /// writable.
    pub fn copy_to_user(
        &self,
        aspace: &AddressSpace,
        vaddr: usize,
        data: &[u8],
    ) -> Result<(), VmError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = check_user_range(vaddr, data.len())?;

        let mut addr = vaddr;
        while addr < end {
            let vpage = page_round_down(addr);
            let chunk = (vpage + PAGE_FRAME_SIZE).min(end) - addr;
            self.pin_page(aspace, addr, true)?;
            {
                let mut inner = aspace.inner.lock();
                let idx = match inner.pages.get(&vpage).map(|desc| desc.residency) {
                    Some(Residency::Resident(idx)) => idx,
                    other => panic!("pinned page {:#x} not resident: {:?}", vpage, other),
                };
                // SAFETY: the pin gate is held, so the frame stays put.
                let bytes = unsafe { self.frames.frame_bytes(idx) };
                let in_page = addr - vpage;
                let taken = addr - vaddr;
                bytes[in_page..in_page + chunk].copy_from_slice(&data[taken..taken + chunk]);
                inner.pagedir.set_accessed(vpage, true);
                inner.pagedir.set_dirty(vpage, true);
            }
            self.unpin_page(aspace, addr);
            addr += chunk;
        }
        Ok(())
    }
}

fn check_user_range(vaddr: usize, len: usize) -> Result<usize, VmError> {
    let end = vaddr.checked_add(len).ok_or(VmError::BadAddress)?;
    if !is_user_vaddr(end - 1) {
        return Err(VmError::BadAddress);
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::vm::swap::PAGE_SECTORS;
    use crate::vm::PageBacking;
    use huronos_shared::mem::OFFSET;

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
    fn copy_spans_a_page_boundary() {
        let vm = test_vm(4, 4);
        let aspace = vm.create_address_space();
        assert!(vm.allocate_page(&aspace, 0x4000, true, PageBacking::Zero));
        assert!(vm.allocate_page(&aspace, 0x5000, true, PageBacking::Zero));

        let data: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        let base = 0x5000 - 100;
        vm.copy_to_user(&aspace, base, &data).expect("copy in failed");
        let back = vm.copy_from_user(&aspace, base, 200).expect("copy out failed");
        assert_eq!(back, data);

        // both pages were faulted in, touched, and left unpinned
        for vaddr in [0x4000, 0x5000] {
            assert!(aspace.is_accessed(vaddr));
            assert!(aspace.is_dirty(vaddr));
            let (idx, _) = aspace.translation(vaddr).expect("page not mapped");
            assert!(!vm.frame_pool().is_pinned(idx));
        }
    }

    #[test]
    fn copy_to_read_only_page_fails() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        assert!(vm.allocate_page(&aspace, 0x4000, false, PageBacking::Zero));
        assert_eq!(
            vm.copy_to_user(&aspace, 0x4000, &[1, 2, 3]),
            Err(VmError::ReadOnly)
        );
        // reading is fine
        let back = vm.copy_from_user(&aspace, 0x4000, 3).expect("copy failed");
        assert_eq!(back, vec![0, 0, 0]);
    }

    #[test]
    fn kernel_range_is_rejected() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        assert_eq!(
            vm.copy_from_user(&aspace, OFFSET, 4),
            Err(VmError::BadAddress)
        );
        // a range that ends in kernel space is just as bad
        assert_eq!(
            vm.copy_from_user(&aspace, OFFSET - 2, 4),
            Err(VmError::BadAddress)
        );
        assert_eq!(vm.copy_from_user(&aspace, usize::MAX, 2), Err(VmError::BadAddress));
    }

    #[test]
    fn unallocated_range_is_not_mapped() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        assert_eq!(
            vm.copy_from_user(&aspace, 0x4000, 8),
            Err(VmError::NotMapped)
        );
    }

    #[test]
    fn empty_copies_do_nothing() {
        let vm = test_vm(2, 4);
        let aspace = vm.create_address_space();
        assert_eq!(vm.copy_from_user(&aspace, 0x4000, 0), Ok(Vec::new()));
        assert_eq!(vm.copy_to_user(&aspace, 0x4000, &[]), Ok(()));
    }
}
