//! The swap store: page-sized slots on a dedicated block device.

use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use crate::vm::VmError;
use huronos_shared::bitmap::Bitmap;
use huronos_shared::mem::PAGE_FRAME_SIZE;
use log::{info, trace};

/// Sectors holding one page.
pub const PAGE_SECTORS: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// A claimed slot in the swap store.
///
/// Slots are single-owner: exactly one page descriptor refers to a used slot,
/// and reading it back releases it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        (self.0 * PAGE_SECTORS) as BlockSector
    }
}

/// Allocator for the swap device.
///
/// The free map and the device sit behind separate locks so slot accounting
/// never waits for a sector transfer.
pub struct SwapStore {
    device: Mutex<Block>,
    free_map: Mutex<Bitmap>,
}

impl SwapStore {
    pub fn new(device: Block) -> Self {
        let slots = device.get_size() as usize / PAGE_SECTORS;
        info!(
            "swap store on \"{}\": {} slots of {} bytes",
            device.get_name(),
            slots,
            PAGE_FRAME_SIZE
        );
        Self {
            device: Mutex::new(device),
            free_map: Mutex::new(Bitmap::new(slots)),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.free_map.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.free_map.lock().count()
    }

    /// Claims a free slot.
    pub fn allocate(&self) -> Result<SwapSlot, VmError> {
        let slot = self
            .free_map
            .lock()
            .scan_and_set()
            .map(SwapSlot)
            .ok_or(VmError::SwapExhausted)?;
        trace!("swap slot {} allocated", slot.index());
        Ok(slot)
    }

    /// Writes one page into `slot`.
    ///
    /// Panics unless `page` is exactly one page, which would be a caller bug.
    pub fn write(&self, slot: SwapSlot, page: &[u8]) -> Result<(), VmError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE, "swap writes whole pages");
        let first = slot.first_sector();
        let mut device = self.device.lock();
        for i in 0..PAGE_SECTORS {
            let bytes = &page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            device.write(first + i as BlockSector, bytes)?;
        }
        Ok(())
    }

    /// Reads `slot` back into `dest` and releases the slot. Swap-in is
    /// one-shot: a slot is never read twice.
    pub fn read(&self, slot: SwapSlot, dest: &mut [u8]) -> Result<(), VmError> {
        assert_eq!(dest.len(), PAGE_FRAME_SIZE, "swap reads whole pages");
        let first = slot.first_sector();
        {
            let mut device = self.device.lock();
            for i in 0..PAGE_SECTORS {
                let bytes = &mut dest[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
                device.read(first + i as BlockSector, bytes)?;
            }
        }
        self.free(slot);
        Ok(())
    }

    /// Releases `slot` without reading it, for descriptors destroyed while
    /// swapped out.
    pub fn free(&self, slot: SwapSlot) {
        trace!("swap slot {} freed", slot.index());
        self.free_map.lock().set(slot.index(), false);
    }

    pub fn is_free(&self, slot: SwapSlot) -> bool {
        !self.free_map.lock().get(slot.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;

    fn test_store(slots: usize) -> SwapStore {
        let sectors = (slots * PAGE_SECTORS) as BlockSector;
        SwapStore::new(Block::new(
            BlockType::Swap,
            "swap0",
            sectors,
            BlockDriver::RamDisk(RamDisk::new(sectors)),
        ))
    }

    #[test]
    fn round_trip_frees_the_slot() {
        let store = test_store(4);
        let slot = store.allocate().expect("allocation failed");

        let mut page = [0u8; PAGE_FRAME_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        store.write(slot, &page).expect("write failed");
        assert!(!store.is_free(slot));

        let mut back = [0u8; PAGE_FRAME_SIZE];
        store.read(slot, &mut back).expect("read failed");
        assert_eq!(page.as_slice(), back.as_slice());
        assert!(store.is_free(slot), "swap-in must release the slot");
    }

    #[test]
    fn exhaustion_is_an_error() {
        let store = test_store(2);
        let a = store.allocate().expect("allocation failed");
        let b = store.allocate().expect("allocation failed");
        assert_ne!(a, b);
        assert_eq!(store.allocate(), Err(VmError::SwapExhausted));

        store.free(a);
        assert_eq!(store.allocate(), Ok(a));
    }

    #[test]
    fn sizing_follows_the_device() {
        let store = test_store(3);
        assert_eq!(store.slot_count(), 3);
        assert_eq!(store.used_slots(), 0);
        let _slot = store.allocate().expect("allocation failed");
        assert_eq!(store.used_slots(), 1);
    }

    #[test]
    #[should_panic]
    fn partial_page_write_panics() {
        let store = test_store(1);
        let slot = store.allocate().expect("allocation failed");
        let half = [0u8; PAGE_FRAME_SIZE / 2];
        let _ = store.write(slot, &half);
    }
}
