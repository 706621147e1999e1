//! The fault and fix-up path.
//!
//! [`Vm::fix_page`] is the entry point for hardware page faults and for
//! explicit pin requests. It finds or creates the descriptor, gets a frame
//! (evicting if it must), fills it from swap, a file, or zeros, and installs
//! the translation.

use crate::fs::FileRef;
use crate::vm::page::{AspaceInner, PageBacking, PageDescriptor, Residency};
use crate::vm::{AddressSpace, Vm, VmError};
use huronos_shared::mem::{is_user_vaddr, page_round_down};
use log::{debug, trace};

enum Fill {
    Done,
    /// Another thread made the page resident while this one was acquiring a
    /// frame.
    Raced,
}

impl Vm {
    /// Brings the page at `vaddr` into a frame and maps it.
    ///
    /// `stack` carries the caller's fault context: a write fault above the
    /// recorded low-water stack pointer is allowed to grow the stack into an
    /// unallocated page. With `pin` the frame's gate stays held for the
    /// caller, which must release it with [`Vm::unpin_page`].
    pub fn fix_page(
        &self,
        aspace: &AddressSpace,
        vaddr: usize,
        stack: bool,
        write: bool,
        pin: bool,
    ) -> Result<(), VmError> {
        if !is_user_vaddr(vaddr) {
            return Err(VmError::BadAddress);
        }
        let vpage = page_round_down(vaddr);

        loop {
            {
                let mut inner = aspace.inner.lock();
                match inner.pages.get(&vpage) {
                    Some(desc) => {
                        if write && !desc.writable {
                            return Err(VmError::ReadOnly);
                        }
                    }
                    None if write && stack => {
                        debug!(
                            "aspace {}: growing stack with page {:#x}",
                            aspace.aid(),
                            vpage
                        );
                        inner.pages.insert(
                            vpage,
                            PageDescriptor {
                                writable: true,
                                backing: PageBacking::Stack,
                                residency: Residency::Unbacked,
                            },
                        );
                    }
                    None => {
                        debug!("aspace {}: fault at unmapped {:#x}", aspace.aid(), vaddr);
                        return Err(VmError::NotMapped);
                    }
                }
            }

            // Already resident: nothing to fill. A pin still has to close
            // the window against the scan taking the frame back out.
            if matches!(aspace.residency(vpage), Some(Residency::Resident(_))) {
                if !pin {
                    return Ok(());
                }
                if self.pin_resident(aspace, vpage) {
                    return Ok(());
                }
                continue;
            }

            let idx =
                self.frames
                    .acquire(&self.spaces, &self.swap, (aspace.aid(), vpage), pin)?;
            match self.fill_frame(aspace, vpage, idx) {
                Ok(Fill::Done) => return Ok(()),
                Ok(Fill::Raced) => {
                    self.frames.discard(idx);
                    continue;
                }
                Err(err) => {
                    self.frames.discard(idx);
                    return Err(err);
                }
            }
        }
    }

    /// Makes the page at `vaddr` resident with its frame pinned, for syscall
    /// code about to do direct I/O on user memory. The pin belongs to the
    /// caller until [`Vm::unpin_page`].
    pub fn pin_page(
        &self,
        aspace: &AddressSpace,
        vaddr: usize,
        write: bool,
    ) -> Result<(), VmError> {
        if !is_user_vaddr(vaddr) {
            return Err(VmError::BadAddress);
        }
        let vpage = page_round_down(vaddr);
        {
            let inner = aspace.inner.lock();
            if let Some(desc) = inner.pages.get(&vpage) {
                if write && !desc.writable {
                    return Err(VmError::ReadOnly);
                }
            }
        }
        if self.pin_resident(aspace, vpage) {
            return Ok(());
        }
        let stack = vpage > aspace.inner.lock().stack_low;
        self.fix_page(aspace, vaddr, stack, write, true)
    }

    /// Releases the pin taken by [`Vm::pin_page`] or a pinned fix-up.
    ///
    /// Panics if the page has no resident frame; a pinned frame cannot be
    /// evicted, so that means the caller's pin bookkeeping is broken.
    pub fn unpin_page(&self, aspace: &AddressSpace, vaddr: usize) {
        let vpage = page_round_down(vaddr);
        match aspace.residency(vpage) {
            Some(Residency::Resident(idx)) => self.frames.unpin(idx),
            _ => panic!(
                "aspace {}: unpinning {:#x} which has no resident frame",
                aspace.aid(),
                vpage
            ),
        }
    }

    /// Pins the frame `vpage` is resident in. False if the page stopped
    /// being resident before the pin took hold.
    fn pin_resident(&self, aspace: &AddressSpace, vpage: usize) -> bool {
        loop {
            let idx = match aspace.residency(vpage) {
                Some(Residency::Resident(idx)) => idx,
                _ => return false,
            };
            self.frames.pin(idx);
            if aspace.residency(vpage) == Some(Residency::Resident(idx)) {
                return true;
            }
            // The frame moved on to another occupant before we had the gate.
            self.frames.unpin(idx);
        }
    }

    fn fill_frame(&self, aspace: &AddressSpace, vpage: usize, idx: usize) -> Result<Fill, VmError> {
        let mut inner = aspace.inner.lock();
        let AspaceInner { pages, pagedir, .. } = &mut *inner;
        let desc = pages
            .get_mut(&vpage)
            .expect("page descriptor freed during fault servicing");

        // SAFETY: the frame is claimed for this descriptor and the scan
        // skips it until residency says Resident.
        let bytes = unsafe { self.frames.frame_bytes(idx) };

        match desc.residency {
            Residency::Resident(_) => return Ok(Fill::Raced),
            Residency::InSwap(slot) => {
                trace!("fill {:#x} from swap slot {}", vpage, slot.index());
                self.swap.read(slot, bytes)?;
            }
            Residency::Unbacked => match &desc.backing {
                PageBacking::File { file, offset, len }
                | PageBacking::Mmap { file, offset, len } => {
                    trace!("fill {:#x} with {} file bytes at offset {}", vpage, len, offset);
                    read_file_page(file, *offset, *len, bytes)?;
                }
                PageBacking::Zero | PageBacking::Stack => bytes.fill(0),
            },
        }

        desc.residency = Residency::Resident(idx);
        pagedir.install(vpage, idx, desc.writable);
        Ok(Fill::Done)
    }
}

/// Reads `len` bytes of `file` at `offset` into the head of `bytes` and
/// zeroes the rest of the page. A short read gets one reopen-and-retry; a
/// second one fails the fault.
fn read_file_page(
    file: &FileRef,
    offset: usize,
    len: usize,
    bytes: &mut [u8],
) -> Result<(), VmError> {
    debug_assert!(len <= bytes.len());
    let mut read = file.read_at(&mut bytes[..len], offset);
    if read < len {
        file.reopen();
        read = file.read_at(&mut bytes[..len], offset);
        if read < len {
            return Err(VmError::ShortRead);
        }
    }
    bytes[len..].fill(0);
    Ok(())
}
