//! The shared pool of physical page frames.
//!
//! Frames are claimed once at boot and only ever change occupant. A frame is
//! borrowed by whichever page descriptor is resident in it; the frame keeps a
//! back-reference of address-space id and virtual page, never a pointer, and
//! the descriptor stays the authority on where its content lives.
//!
//! Reclaiming uses a second-chance scan over a rotating order: a frame whose
//! mapping was accessed since the last pass gives up its chance bit and moves
//! to the back; a frame with no chance left is written out (to its file for
//! dirty mmap pages, to swap for everything else) and handed to the new
//! occupant. Frames whose pin gate is held are invisible to the scan.

use crate::sync::{Mutex, Semaphore};
use crate::vm::page::{AspaceInner, PageBacking, Residency};
use crate::vm::swap::SwapStore;
use crate::vm::{Aid, SpaceRegistry, VmError};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitbybit::bitfield;
use core::ptr::NonNull;
use core::slice;
use huronos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, info, trace, warn};

#[bitfield(u8, default = 0)]
struct FrameFlags {
    #[bit(0, rw)]
    occupied: bool,
    #[bit(1, rw)]
    second_chance: bool,
}

struct Frame {
    flags: FrameFlags,
    /// Descriptor currently borrowing this frame, as (aspace, vpage).
    occupant: Option<(Aid, usize)>,
    /// Held while the frame's bytes are used for direct I/O.
    pin: Semaphore,
}

impl Frame {
    fn new() -> Self {
        Self {
            flags: FrameFlags::default(),
            occupant: None,
            pin: Semaphore::new(1),
        }
    }
}

struct PoolInner {
    frames: Box<[Frame]>,
    /// Scan order; the front is the clock hand.
    order: VecDeque<usize>,
}

/// Fixed pool of user frames shared by all address spaces.
pub struct FramePool {
    inner: Mutex<PoolInner>,
    start: NonNull<u8>,
    frame_count: usize,
}

// SAFETY: the backing region is owned by the pool alone and all access to it
// goes through the pool lock or a held pin gate.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Claims a region for `frame_count` page frames. The region lives for
    /// the rest of the kernel's life; frames are never given back.
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count > 0, "frame pool needs at least one frame");
        let region = Box::leak(
            alloc::vec![0u8; frame_count * PAGE_FRAME_SIZE].into_boxed_slice(),
        );
        let start = NonNull::new(region.as_mut_ptr()).expect("frame region is null");
        let frames: Vec<Frame> = (0..frame_count).map(|_| Frame::new()).collect();
        info!("frame pool ready with {} frames", frame_count);
        Self {
            inner: Mutex::new(PoolInner {
                frames: frames.into_boxed_slice(),
                order: (0..frame_count).collect(),
            }),
            start,
            frame_count,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Descriptor currently borrowing frame `idx`, as (aspace, vpage).
    pub fn occupant(&self, idx: usize) -> Option<(Aid, usize)> {
        self.inner.lock().frames[idx].occupant
    }

    pub fn is_pinned(&self, idx: usize) -> bool {
        self.inner.lock().frames[idx].pin.value() == 0
    }

    /// The bytes of frame `idx`.
    ///
    /// # Safety
    ///
    /// The caller must have the frame to itself: either it holds the pool
    /// lock with the frame's pin gate taken, or it owns the gate outright,
    /// or it holds the address-space lock of a resident occupant it is
    /// filling or flushing.
    pub(crate) unsafe fn frame_bytes(&self, idx: usize) -> &mut [u8] {
        debug_assert!(idx < self.frame_count);
        slice::from_raw_parts_mut(
            self.start.as_ptr().add(idx * PAGE_FRAME_SIZE),
            PAGE_FRAME_SIZE,
        )
    }

    /// Copy of frame `idx`'s current contents, for diagnostics and tests.
    pub fn frame_snapshot(&self, idx: usize) -> Vec<u8> {
        let _guard = self.inner.lock();
        // SAFETY: the pool lock keeps the scan and any release away while we
        // copy.
        unsafe { self.frame_bytes(idx) }.to_vec()
    }

    /// Finds a frame for `occupant`, evicting a current resident if no frame
    /// is free. With `pin` the frame's gate stays held for the caller, which
    /// must release it through [`FramePool::unpin`].
    pub(crate) fn acquire(
        &self,
        spaces: &SpaceRegistry,
        swap: &SwapStore,
        occupant: (Aid, usize),
        pin: bool,
    ) -> Result<usize, VmError> {
        let mut guard = self.inner.lock();
        let pool = &mut *guard;
        loop {
            let idx = pool.order.pop_front().expect("frame pool is empty");
            pool.order.push_back(idx);
            let frame = &mut pool.frames[idx];

            // Busy with direct I/O: invisible to the scan.
            if !frame.pin.try_down() {
                continue;
            }

            if frame.flags.occupied() {
                let (aid, vpage) = frame.occupant.expect("occupied frame without occupant");

                if frame.flags.second_chance() {
                    let accessed = spaces
                        .get(aid)
                        .is_some_and(|aspace| aspace.inner.lock().pagedir.is_accessed(vpage));
                    if accessed {
                        // Recently used: one more trip around the clock.
                        frame.flags = frame.flags.with_second_chance(false);
                        frame.pin.up();
                        continue;
                    }
                }

                match self.evict(frame, idx, spaces, swap) {
                    Ok(true) => {}
                    Ok(false) => {
                        // Mid-fill on another thread; not a candidate.
                        frame.pin.up();
                        continue;
                    }
                    Err(err) => {
                        frame.pin.up();
                        return Err(err);
                    }
                }
            }

            frame.occupant = Some(occupant);
            frame.flags = FrameFlags::default()
                .with_occupied(true)
                .with_second_chance(true);
            if !pin {
                frame.pin.up();
            }
            trace!(
                "frame {} granted to aspace {} page {:#x}",
                idx,
                occupant.0,
                occupant.1
            );
            return Ok(idx);
        }
    }

    /// Writes the occupant of `frame` out and severs it from its descriptor.
    ///
    /// Returns Ok(false) when the occupant is not in a steady resident state
    /// and the frame has to be skipped. On error the occupant is left
    /// untouched.
    fn evict(
        &self,
        frame: &mut Frame,
        idx: usize,
        spaces: &SpaceRegistry,
        swap: &SwapStore,
    ) -> Result<bool, VmError> {
        let (aid, vpage) = frame.occupant.expect("occupied frame without occupant");
        let Some(aspace) = spaces.get(aid) else {
            // Owner finished teardown while we scanned; the frame is free.
            warn!("frame {} occupant aspace {} is gone", idx, aid);
            frame.occupant = None;
            return Ok(true);
        };

        let mut aspace_guard = aspace.inner.lock();
        let AspaceInner { pages, pagedir, .. } = &mut *aspace_guard;

        let desc = match pages.get_mut(&vpage) {
            Some(desc) if desc.residency == Residency::Resident(idx) => desc,
            _ => return Ok(false),
        };

        // SAFETY: pool lock plus the taken pin gate keep everyone else away
        // from the frame's bytes.
        let bytes = unsafe { self.frame_bytes(idx) };
        let dirty = pagedir.is_dirty(vpage);

        match &desc.backing {
            PageBacking::Mmap { file, offset, len } if dirty => {
                debug!(
                    "evict: {:#x} (aspace {}) written back to file, {} bytes",
                    vpage, aid, len
                );
                file.write_at(&bytes[..*len], *offset);
                desc.residency = Residency::Unbacked;
            }
            _ => {
                let slot = swap.allocate()?;
                if let Err(err) = swap.write(slot, bytes) {
                    swap.free(slot);
                    return Err(err);
                }
                debug!(
                    "evict: {:#x} (aspace {}) moved to swap slot {}",
                    vpage,
                    aid,
                    slot.index()
                );
                desc.residency = Residency::InSwap(slot);
            }
        }

        pagedir.clear(vpage);
        frame.occupant = None;
        Ok(true)
    }

    /// Gives frame `idx` back at descriptor destruction. Flushes dirty
    /// writable mmap content, clears the occupant's translation, and leaves
    /// the frame unoccupied with its gate open. A stale call, where the
    /// frame has moved on to another occupant, does nothing.
    pub(crate) fn release(&self, spaces: &SpaceRegistry, idx: usize, expected: (Aid, usize)) {
        let mut guard = self.inner.lock();
        let pool = &mut *guard;
        let frame = &mut pool.frames[idx];
        if !frame.flags.occupied() || frame.occupant != Some(expected) {
            return;
        }
        // The owner must have dropped any pin of its own before teardown.
        let _ = frame.pin.try_down();

        let (aid, vpage) = expected;
        if let Some(aspace) = spaces.get(aid) {
            let mut aspace_guard = aspace.inner.lock();
            let AspaceInner { pages, pagedir, .. } = &mut *aspace_guard;
            if let Some(desc) = pages.get_mut(&vpage) {
                if desc.writable && pagedir.is_dirty(vpage) {
                    if let PageBacking::Mmap { file, offset, len } = &desc.backing {
                        debug!(
                            "release: flushing dirty mmap page {:#x} (aspace {})",
                            vpage, aid
                        );
                        // SAFETY: pool lock held, gate taken just above.
                        let bytes = unsafe { self.frame_bytes(idx) };
                        file.write_at(&bytes[..*len], *offset);
                    }
                }
                desc.residency = Residency::Unbacked;
                pagedir.clear(vpage);
            }
        }

        frame.occupant = None;
        frame.flags = FrameFlags::default();
        if frame.pin.value() == 0 {
            frame.pin.up();
        }
    }

    /// Abandons a frame claimed by [`FramePool::acquire`] whose fill did not
    /// complete. The frame comes back unoccupied with its gate open.
    pub(crate) fn discard(&self, idx: usize) {
        let mut guard = self.inner.lock();
        let frame = &mut guard.frames[idx];
        frame.occupant = None;
        frame.flags = FrameFlags::default();
        if frame.pin.value() == 0 {
            frame.pin.up();
        }
    }

    /// Blocks until frame `idx`'s gate is free and takes it. Going through
    /// the pool lock serializes this against the scan, which may be probing
    /// the same gate.
    pub fn pin(&self, idx: usize) {
        loop {
            {
                let guard = self.inner.lock();
                if guard.frames[idx].pin.try_down() {
                    return;
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Opens frame `idx`'s gate again. Tolerates an already-open gate, like
    /// the teardown path.
    pub fn unpin(&self, idx: usize) {
        let guard = self.inner.lock();
        let frame = &guard.frames[idx];
        if frame.pin.value() == 0 {
            frame.pin.up();
        }
    }
}
