//! Demand paging for user address spaces.
//!
//! Four pieces cooperate here. Each process owns a supplemental page table
//! ([`page`]) describing where every virtual page's content lives. All
//! processes share one [`frame::FramePool`], which hands out physical frames
//! and reclaims them with a second-chance scan, and one [`swap::SwapStore`],
//! which persists evicted pages on a block device. The fault path ([`fault`])
//! ties them together: it classifies the faulting page, obtains a frame
//! (possibly evicting someone else's), fills it from swap, from a file, or
//! with zeros, and installs the translation.
//!
//! Lock order is pool lock, then address-space lock, then swap store or
//! device locks or a pin gate. Every path below follows it.

pub mod fault;
pub mod frame;
pub mod page;
pub mod swap;
pub mod user;

pub use frame::FramePool;
pub use page::{AddressSpace, PageBacking, PageDescriptor, Residency};
pub use swap::{SwapSlot, SwapStore};

use crate::block::{Block, BlockError};
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use log::info;

/// Identifies one process address space.
pub type Aid = u32;

/// Ways a paging operation can fail.
///
/// Everything here is reported to the syscall layer, which decides the
/// process-visible consequence; none of these abort the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The address has no descriptor and is outside the growable stack region.
    NotMapped,
    /// Write access to a read-only page.
    ReadOnly,
    /// No free swap slot was available for an eviction.
    SwapExhausted,
    /// A file-backed page came up short even after reopening the file.
    ShortRead,
    /// The address is not a user address.
    BadAddress,
    /// The swap device failed.
    Device(BlockError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::NotMapped => write!(f, "address is not mapped"),
            VmError::ReadOnly => write!(f, "write to a read-only page"),
            VmError::SwapExhausted => write!(f, "out of swap slots"),
            VmError::ShortRead => write!(f, "short read from backing file"),
            VmError::BadAddress => write!(f, "not a user address"),
            VmError::Device(err) => write!(f, "swap device: {}", err),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Device(err)
    }
}

/// Lookup table from [`Aid`] to live address spaces, so the eviction path can
/// reach a victim's tables knowing only what the frame records.
pub(crate) struct SpaceRegistry {
    spaces: Mutex<BTreeMap<Aid, Arc<AddressSpace>>>,
}

impl SpaceRegistry {
    fn new() -> Self {
        Self {
            spaces: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn get(&self, aid: Aid) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&aid).cloned()
    }

    fn insert(&self, aspace: Arc<AddressSpace>) {
        self.spaces.lock().insert(aspace.aid(), aspace);
    }

    fn remove(&self, aid: Aid) {
        self.spaces.lock().remove(&aid);
    }
}

/// The memory subsystem: one frame pool and one swap store shared by every
/// address space created through it.
///
/// Built once at boot and handed to the fault and syscall layers by
/// reference. Tests construct private instances with small pools.
pub struct Vm {
    pub(crate) frames: FramePool,
    pub(crate) swap: SwapStore,
    pub(crate) spaces: SpaceRegistry,
    next_aid: AtomicU32,
}

impl Vm {
    /// Claims `frame_count` frames for the user pool and sizes the swap store
    /// from `swap_device`.
    pub fn new(frame_count: usize, swap_device: Block) -> Self {
        Self {
            frames: FramePool::new(frame_count),
            swap: SwapStore::new(swap_device),
            spaces: SpaceRegistry::new(),
            next_aid: AtomicU32::new(1),
        }
    }

    pub fn create_address_space(&self) -> Arc<AddressSpace> {
        let aid = self.next_aid.fetch_add(1, Ordering::Relaxed);
        let aspace = Arc::new(AddressSpace::new(aid));
        self.spaces.insert(Arc::clone(&aspace));
        info!("created address space {}", aid);
        aspace
    }

    /// Tears an address space down at process exit, returning every frame and
    /// swap slot it held.
    pub fn destroy_address_space(&self, aspace: &Arc<AddressSpace>) {
        self.free_all_pages(aspace);
        self.spaces.remove(aspace.aid());
        info!("destroyed address space {}", aspace.aid());
    }

    pub fn frame_pool(&self) -> &FramePool {
        &self.frames
    }

    pub fn swap_store(&self) -> &SwapStore {
        &self.swap
    }
}
