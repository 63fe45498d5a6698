//! Descriptor-table registers: captured from whatever the host already has
//! loaded, never constructed by this crate.

use core::arch::asm;

/// X86_64's system table register (the operand of SGDT/SIDT/LGDT/LIDT).
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SystemTableRegister {
    pub limit: u16,
    pub base: u64,
}

/// Capture the host's current GDTR.
#[inline(always)]
pub fn sgdt() -> SystemTableRegister {
    let mut out = SystemTableRegister { limit: 0, base: 0 };
    unsafe { asm!("sgdt [{0}]", in(reg) &mut out, options(nostack)) };
    out
}

/// Capture the host's current IDTR.
#[inline(always)]
pub fn sidt() -> SystemTableRegister {
    let mut out = SystemTableRegister { limit: 0, base: 0 };
    unsafe { asm!("sidt [{0}]", in(reg) &mut out, options(nostack)) };
    out
}

/// Read the 8-byte raw descriptor at `index` (selector index, not byte
/// offset) in the table described by `gdtr`.
///
/// # Safety
/// `gdtr.base` must describe a table mapped and valid for the lifetime of
/// the read, and `index` must be in bounds for `gdtr.limit`.
pub unsafe fn read_descriptor(gdtr: SystemTableRegister, index: u16) -> u64 {
    let ptr = (gdtr.base + (index as u64) * 8) as *const u64;
    core::ptr::read_unaligned(ptr)
}
