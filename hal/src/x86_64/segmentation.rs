//! Segmentation: selectors and the access-rights encoding VMCS guest/host
//! segment fields use, *read* from whatever GDT the host already has loaded.
//!
//! Unlike a self-booting kernel, this crate never constructs its own GDT/TSS.
//! It only needs to capture the host's current selectors and decode their
//! access rights out of the host's own descriptor table before entering VMX
//! non-root operation, and restore them on VM-exit.

use super::PrivilegeLevel;
use core::arch::asm;

bitflags::bitflags! {
    /// Segment access-rights encoding used both in native descriptors and in
    /// the VMCS `GUEST_{CS,SS,...}_ACCESS_RIGHTS` / `HOST_*_SELECTOR` fields
    /// (Intel SDM Vol. 3C Table 24-10).
    pub struct SegmentAccess: u32 {
        /// Segment type (4 bits).
        const TYPE_MASK = 0xf;
        /// Descriptor type (0 = system; 1 = code or data).
        const S = 1 << 4;
        /// Descriptor privilege level (2 bits, shifted into place already).
        const DPL_MASK = 0x3 << 5;
        /// Segment present.
        const P = 1 << 7;
        /// Available for use by system software.
        const AVL = 1 << 12;
        /// 64-bit code segment (IA-32e mode only).
        const L = 1 << 13;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment).
        const D_B = 1 << 14;
        /// Granularity.
        const G = 1 << 15;
        /// Segment unusable (0 = usable).
        const UNUSABLE = 1 << 16;
    }
}

impl SegmentAccess {
    /// Build from a raw GDT/LDT descriptor's packed access byte + flags
    /// nibble, in the layout a descriptor stores them (bits 40-55 / 52-55 of
    /// the 8-byte descriptor).
    pub fn from_descriptor(raw: u64) -> Self {
        let access = ((raw >> 40) & 0xff) as u32;
        let flags = ((raw >> 52) & 0xf) as u32;
        Self::from_bits_truncate(access | (flags << 12))
    }
}

/// X86_64's segment selector.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl core::fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("SegmentSelector")
            .field("index", &self.index())
            .field("dpl", &self.dpl())
            .finish()
    }
}

impl SegmentSelector {
    /// Create a new SegmentSelector from the index and dpl.
    #[inline]
    pub const fn new(index: u16, dpl: PrivilegeLevel) -> Self {
        Self((index << 3) | dpl as u16)
    }

    /// Wrap a raw selector value as read out of a segment register.
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Pack the SegmentSelector into a word.
    #[inline]
    pub const fn pack(self) -> u16 {
        self.0
    }

    /// Get index of the SegmentSelector (i.e. byte offset into its table / 8).
    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Get dpl of the SegmentSelector.
    #[inline]
    pub const fn dpl(self) -> PrivilegeLevel {
        match self.0 & 3 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            3 => PrivilegeLevel::Ring3,
            _ => unreachable!(),
        }
    }
}

/// X86_64's segment register.
#[derive(Copy, Clone, Debug)]
pub enum SegmentRegister {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    Tr,
    Ldtr,
}

impl SegmentRegister {
    /// Read this register's current selector.
    #[inline(always)]
    pub fn current(self) -> SegmentSelector {
        let raw: u16;
        unsafe {
            match self {
                Self::Cs => asm!("mov {:x}, cs", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Ss => asm!("mov {:x}, ss", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Ds => asm!("mov {:x}, ds", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Es => asm!("mov {:x}, es", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Fs => asm!("mov {:x}, fs", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Gs => asm!("mov {:x}, gs", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Tr => asm!("str {:x}", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
                Self::Ldtr => asm!("sldt {:x}", lateout(reg) raw, options(nomem, nostack, preserves_flags)),
            }
        }
        SegmentSelector::from_raw(raw)
    }

    /// Read this segment's base address via its MSR (FS/GS only — the other
    /// bases are pulled from the GDT descriptor instead).
    #[inline(always)]
    pub fn msr_base(self) -> Option<u64> {
        match self {
            Self::Fs => Some(super::msr::Msr::<0xc0000100>::read()),
            Self::Gs => Some(super::msr::Msr::<0xc0000101>::read()),
            _ => None,
        }
    }
}
