//! Walking a target process's own (guest-virtual, here just "the host
//! process's") page tables, independent of the EPT layer.
//!
//! EPT translates guest-physical to host-physical, which in this design is
//! the identity function. What still needs a real page walk is going from a
//! *target process's virtual address* (the address a caller passes when
//! asking to hook a function) down to the physical frame backing it, via
//! that process's own CR3. That's an ordinary 4-level long-mode walk over
//! physical memory this crate can already read through the host's identity
//! map (`hal::mem::read_physical`).

use crate::error::VmError;
use alloc::vec::Vec;
use hal::addressing::{Pa, PAGE_MASK};

/// A virtual address inside some target process's address space. Kept
/// distinct from [`hal::addressing::Va`] (the host kernel's own virtual
/// addresses) since the two live in unrelated address spaces and must never
/// be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetVa(u64);

impl TargetVa {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK as u64
    }

    fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }
    fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }
    fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }
    fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }
}

const PRESENT: u64 = 1 << 0;
const PAGE_SIZE: u64 = 1 << 7;
const PT_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

fn read_pte(table_pa: Pa, index: usize) -> Result<u64, VmError> {
    let entry_pa = Pa::new(unsafe { table_pa.into_usize() } + index * 8)
        .ok_or(VmError::AddressTranslationFailed)?;
    let mut buf = [0u8; 8];
    unsafe { hal::mem::read_physical(entry_pa, &mut buf) }
        .ok_or(VmError::AddressTranslationFailed)?;
    Ok(u64::from_le_bytes(buf))
}

/// Walk a target process's 4-level page tables (given its CR3) and resolve
/// `va` to the physical frame backing it, plus the offset within that frame.
///
/// Returns `Ok(None)` for a not-present mapping (the page simply isn't
/// resident) and `Err` for a malformed walk (e.g. a table physical address
/// that doesn't resolve).
pub fn translate(cr3: u64, va: TargetVa) -> Result<Option<Pa>, VmError> {
    let pml4_pa = Pa::new((cr3 & PT_ADDR_MASK) as usize).ok_or(VmError::AddressTranslationFailed)?;

    let pml4e = read_pte(pml4_pa, va.pml4_index())?;
    if pml4e & PRESENT == 0 {
        return Ok(None);
    }
    let pdpt_pa = Pa::new((pml4e & PT_ADDR_MASK) as usize).ok_or(VmError::AddressTranslationFailed)?;

    let pdpte = read_pte(pdpt_pa, va.pdpt_index())?;
    if pdpte & PRESENT == 0 {
        return Ok(None);
    }
    if pdpte & PAGE_SIZE != 0 {
        // 1 GiB leaf.
        let frame_base = pdpte & PT_ADDR_MASK & !((1 << 30) - 1);
        return Ok(Pa::new((frame_base + (va.raw() & ((1 << 30) - 1))) as usize));
    }
    let pd_pa = Pa::new((pdpte & PT_ADDR_MASK) as usize).ok_or(VmError::AddressTranslationFailed)?;

    let pde = read_pte(pd_pa, va.pd_index())?;
    if pde & PRESENT == 0 {
        return Ok(None);
    }
    if pde & PAGE_SIZE != 0 {
        // 2 MiB leaf.
        let frame_base = pde & PT_ADDR_MASK & !((1 << 21) - 1);
        return Ok(Pa::new((frame_base + (va.raw() & ((1 << 21) - 1))) as usize));
    }
    let pt_pa = Pa::new((pde & PT_ADDR_MASK) as usize).ok_or(VmError::AddressTranslationFailed)?;

    let pte = read_pte(pt_pa, va.pt_index())?;
    if pte & PRESENT == 0 {
        return Ok(None);
    }
    let frame_base = pte & PT_ADDR_MASK;
    Ok(Pa::new((frame_base + va.page_offset()) as usize))
}

/// A collaborator that knows how to look up a process's CR3 and liveness.
/// The hypervisor core only ever asks "what is this process's page-table
/// root, and is it still alive" — it never needs to enumerate processes or
/// understand the host OS's process model beyond that.
pub trait TargetProcess {
    /// The physical address of this process's top-level page table (CR3,
    /// with the low control bits already masked off).
    fn cr3(&self, pid: u64) -> Result<u64, VmError>;
}

/// One `(virtual address, physical frame, snapshot of the page's bytes)`
/// triple, as handed back to a caller asking how to patch a target process.
pub struct TranslationHint {
    pub vaddr: TargetVa,
    pub paddr: Pa,
    pub page: Vec<u8>,
}

/// Resolve every page touched by `[vaddr, vaddr + len)` in the process whose
/// CR3 is `cr3`, returning one hint per distinct page.
pub fn generate_translation_hints(
    cr3: u64,
    vaddr: TargetVa,
    len: usize,
) -> Result<Vec<TranslationHint>, VmError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let start_page = vaddr.raw() & !(hal::addressing::PAGE_MASK as u64);
    let end = vaddr.raw() + len as u64;
    let mut hints = Vec::new();
    let mut page = start_page;
    while page < end {
        let page_va = TargetVa::new(page);
        match translate(cr3, page_va)? {
            Some(frame_start) => {
                let page_pa = Pa::new(unsafe { frame_start.into_usize() } & !hal::addressing::PAGE_MASK)
                    .ok_or(VmError::AddressTranslationFailed)?;
                let mut bytes = alloc::vec![0u8; hal::addressing::PAGE_SIZE];
                unsafe { hal::mem::read_physical(page_pa, &mut bytes) }
                    .ok_or(VmError::AddressTranslationFailed)?;
                hints.push(TranslationHint {
                    vaddr: page_va,
                    paddr: page_pa,
                    page: bytes,
                });
            }
            None => return Err(VmError::InvalidRequest("target page not resident")),
        }
        page += hal::addressing::PAGE_SIZE as u64;
    }
    Ok(hints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_index_decomposition() {
        let va = TargetVa::new(0x0000_7f12_3456_7890);
        assert_eq!(va.page_offset(), 0x890);
        assert!(va.pml4_index() < 512);
        assert!(va.pdpt_index() < 512);
        assert!(va.pd_index() < 512);
        assert!(va.pt_index() < 512);
    }
}
