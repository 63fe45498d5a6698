//! Physically contiguous memory handles.
//!
//! Frame allocation itself is the host driver's job (it already owns a
//! non-paged pool / `MmAllocateContiguousMemory`-equivalent); this crate only
//! describes what it got back. The allocator lives behind
//! [`crate::platform::Platform`] since a driver-hosted hypervisor doesn't
//! own its own physical memory map — it borrows frames from whatever OS
//! it's embedded in.

use crate::addressing::{Pa, Va};

/// A physically contiguous, page-aligned span of memory, identity-accessible
/// through both its physical and (host) kernel-virtual address.
///
/// Does not free itself on drop: ownership of the underlying frames belongs
/// to whichever [`crate::platform::Platform`] allocated them, and must be
/// returned explicitly through [`crate::platform::Platform::free_contiguous`].
#[derive(Clone, Copy)]
pub struct ContigPages {
    pa: Pa,
    va: Va,
    pages: usize,
}

impl ContigPages {
    /// Wrap a driver-supplied allocation.
    ///
    /// # Safety
    /// `pa`/`va` must describe the same `pages * PAGE_SIZE` bytes of memory,
    /// owned exclusively for the lifetime of this handle.
    pub unsafe fn from_raw(pa: Pa, va: Va, pages: usize) -> Self {
        Self { pa, va, pages }
    }

    pub fn pa(&self) -> Pa {
        self.pa
    }

    pub fn va(&self) -> Va {
        self.va
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn bytes(&self) -> usize {
        self.pages * crate::addressing::PAGE_SIZE
    }

    /// View this allocation as a zeroed-on-allocation byte slice.
    ///
    /// # Safety
    /// Caller must not alias this memory as anything but raw bytes while the
    /// returned slice is live.
    pub unsafe fn as_mut_slice(&self) -> &'static mut [u8] {
        core::slice::from_raw_parts_mut(unsafe { self.va.into_usize() } as *mut u8, self.bytes())
    }
}

/// Copy `dst.len()` bytes out of physical memory starting at `pa`.
///
/// Installed RAM is assumed reachable through the identity window described
/// in [`crate::addressing`]; this does not validate that `pa` is backed by
/// real memory, only that it addresses a canonical physical range.
///
/// # Safety
/// `pa..pa+dst.len()` must be backed by readable physical memory. Reading
/// device MMIO or unbacked ranges through this path is undefined behavior.
pub unsafe fn read_physical(pa: Pa, dst: &mut [u8]) -> Option<()> {
    let base = Pa::new(unsafe { pa.into_usize() })?.into_va();
    let src = unsafe { core::slice::from_raw_parts(base.into_usize() as *const u8, dst.len()) };
    dst.copy_from_slice(src);
    Some(())
}

/// Copy `src` into physical memory starting at `pa`.
///
/// # Safety
/// Same requirements as [`read_physical`], but for writes.
pub unsafe fn write_physical(pa: Pa, src: &[u8]) -> Option<()> {
    let base = Pa::new(unsafe { pa.into_usize() })?.into_va();
    let dst = unsafe { core::slice::from_raw_parts_mut(base.into_usize() as *mut u8, src.len()) };
    dst.copy_from_slice(src);
    Some(())
}
