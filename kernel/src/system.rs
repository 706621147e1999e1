//! Kernel-wide state, created once at boot.

use crate::block::{Block, BlockDriver, BlockType};
use crate::drivers::ram_disk::RamDisk;
use crate::logging;
use crate::vm::Vm;
use alloc::boxed::Box;
use huronos_shared::sizes::SWAP_SECTORS;
use once_cell::race::OnceBox;

pub struct SystemState {
    pub vm: Vm,
}

static SYSTEM: OnceBox<SystemState> = OnceBox::new();

/// Brings the memory subsystem up with `frame_count` user frames and the
/// given swap device. Panics if called twice.
pub fn system_init(frame_count: usize, swap_device: Block) -> &'static SystemState {
    logging::init();
    let state = Box::new(SystemState {
        vm: Vm::new(frame_count, swap_device),
    });
    if SYSTEM.set(state).is_err() {
        panic!("system already initialized");
    }
    system()
}

/// Boot with the default swap geometry on a RAM-backed device.
pub fn system_init_default(frame_count: usize) -> &'static SystemState {
    let sectors = SWAP_SECTORS as u32;
    let device = Block::new(
        BlockType::Swap,
        "swap0",
        sectors,
        BlockDriver::RamDisk(RamDisk::new(sectors)),
    );
    system_init(frame_count, device)
}

/// The running system. Panics before [`system_init`].
pub fn system() -> &'static SystemState {
    SYSTEM.get().expect("system not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{PageBacking, Residency};

    // The global is process-wide, so one test owns boot.
    #[test]
    fn boots_once_and_serves_faults() {
        let state = system_init_default(8);
        assert!(core::ptr::eq(state, system()));

        let aspace = state.vm.create_address_space();
        assert!(state.vm.allocate_page(&aspace, 0x4000, true, PageBacking::Zero));
        state
            .vm
            .fix_page(&aspace, 0x4000, false, true, false)
            .expect("fault failed");
        assert!(matches!(
            aspace.residency(0x4000),
            Some(Residency::Resident(_))
        ));
        state.vm.destroy_address_space(&aspace);
    }
}
