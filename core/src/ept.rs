//! The Extended Page Table: the second paging layer the EPT-hook mechanism
//! is built on.
//!
//! Every guest-physical address in this design equals its host-physical
//! address one-to-one (the "guest" is the host OS continuing to run, not a
//! separate kernel with its own physical address space), so this tree's only
//! job is to identity-map installed RAM and then let page-granularity
//! permission edits turn individual frames into split views. It starts out
//! covering memory with 2 MiB leaves at the PD level; [`Ept::split`] lazily
//! replaces one 2 MiB leaf with a full 512-entry 4 KiB page table the first
//! time a hook or watchpoint needs page granularity there.
//!
//! Entry flag layouts follow Intel SDM Tables 28-1 (PML4E), 28-3 (PDPTE),
//! 28-5 (PDE referencing a PT), 28-4 (PDE mapping a 2 MiB page) and 29-6
//! (PTE).

use crate::error::VmError;
use crate::mtrr::{MemoryType, MtrrOverlay};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use hal::addressing::{Pa, Va};
use hal::mem::ContigPages;
use hal::platform::Platform;
use spin_lock::SpinLock;

const ENTRIES: usize = 512;
const GIB: usize = 1 << 30;
const MIB2: usize = 1 << 21;
const KIB4: usize = 1 << 12;

bitflags::bitflags! {
    /// Format common to PML4E/PDPTE/non-leaf PDE (Tables 28-1, 28-3, 28-5).
    pub struct TableEntryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const ACCESSED = 1 << 8;
        const USER_EXECUTE = 1 << 10;
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

bitflags::bitflags! {
    /// Format of a leaf entry mapping a page directly (Tables 28-4, 29-6).
    pub struct LeafEntryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const IGNORE_PAT = 1 << 6;
        /// Page-size bit: only meaningful at the PDPTE (1 GiB) and PDE (2 MiB)
        /// levels. Always clear at the PTE level, which is a leaf by position.
        const PAGE_SIZE = 1 << 7;
        const ACCESSED = 1 << 8;
        const DIRTY = 1 << 9;
        const USER_EXECUTE = 1 << 10;
        const SUPPRESS_VE = 1 << 63;
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const MEMTYPE_SHIFT: u32 = 3;
const MEMTYPE_MASK: u64 = 0x7 << MEMTYPE_SHIFT;

/// One slot of any EPT table level. The interpretation of the flag bits
/// depends on the level and on the page-size bit; see [`TableEntryFlags`]
/// and [`LeafEntryFlags`].
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & LeafEntryFlags::FULL.bits() != 0
    }

    pub fn is_page_size(&self) -> bool {
        self.0 & LeafEntryFlags::PAGE_SIZE.bits() != 0
    }

    pub fn frame(&self) -> Pa {
        Pa::new((self.0 & ADDR_MASK) as usize).expect("EPT entry always stores a canonical PA")
    }

    pub fn memory_type(&self) -> MemoryType {
        match (self.0 & MEMTYPE_MASK) >> MEMTYPE_SHIFT {
            0 => MemoryType::Uncacheable,
            1 => MemoryType::WriteCombining,
            4 => MemoryType::WriteThrough,
            5 => MemoryType::WriteProtected,
            _ => MemoryType::WriteBack,
        }
    }

    pub fn permissions(&self) -> (bool, bool, bool) {
        (
            self.0 & LeafEntryFlags::READ.bits() != 0,
            self.0 & LeafEntryFlags::WRITE.bits() != 0,
            self.0 & LeafEntryFlags::EXECUTE.bits() != 0,
        )
    }

    /// Build a table-referencing (non-leaf) entry.
    pub fn table(child: Pa) -> Self {
        Self(
            unsafe { child.into_usize() } as u64 & ADDR_MASK
                | TableEntryFlags::FULL.bits()
                | TableEntryFlags::ACCESSED.bits(),
        )
    }

    /// Build a leaf entry mapping `frame` with the given permissions and
    /// memory type. `page_size` must be set for 2 MiB PDE leaves and clear
    /// for 4 KiB PTE leaves.
    pub fn leaf(
        frame: Pa,
        read: bool,
        write: bool,
        execute: bool,
        memory_type: MemoryType,
        page_size: bool,
    ) -> Self {
        let mut bits = unsafe { frame.into_usize() } as u64 & ADDR_MASK;
        if read {
            bits |= LeafEntryFlags::READ.bits();
        }
        if write {
            bits |= LeafEntryFlags::WRITE.bits();
        }
        if execute {
            bits |= LeafEntryFlags::EXECUTE.bits();
        }
        if page_size {
            bits |= LeafEntryFlags::PAGE_SIZE.bits();
        }
        bits |= (memory_type as u64) << MEMTYPE_SHIFT;
        Self(bits)
    }

    /// Atomically install `value` into `*slot`. This is the single instruction
    /// a split-view flip or a hook install/remove boils down to: the next
    /// access on any core either sees the whole old entry or the whole new
    /// one, never a byte-torn mix.
    ///
    /// # Safety
    /// `slot` must point at a live EPT entry this tree owns.
    pub unsafe fn atomic_store(slot: *mut EptEntry, value: EptEntry) {
        (*(slot as *mut AtomicU64)).store(value.0, Ordering::SeqCst);
    }

    /// Atomically load `*slot`.
    ///
    /// # Safety
    /// `slot` must point at a live EPT entry this tree owns.
    pub unsafe fn atomic_load(slot: *const EptEntry) -> EptEntry {
        Self((*(slot as *const AtomicU64)).load(Ordering::SeqCst))
    }
}

#[repr(align(4096))]
struct Table([EptEntry; ENTRIES]);

impl Table {
    fn zeroed() -> Box<Self> {
        // SAFETY: an all-zero EptEntry is a valid "not present" entry.
        unsafe { Box::new_zeroed().assume_init() }
    }
}

/// EPTP memory type field, always write-back: the PML4/PDPT/PD/PT frames
/// this crate allocates are ordinary kernel pool memory.
const EPTP_MEMORY_TYPE_WB: u64 = 6;
/// EPTP page-walk-length field encodes (levels - 1); this tree is always 4 levels.
const EPTP_WALK_LENGTH: u64 = 3;

/// The EPT tree for the whole machine's installed RAM, identity-mapped.
///
/// Topology mutation (splitting a 2 MiB leaf into a 4 KiB table) is guarded
/// by one spinlock; permission edits on existing leaves are lock-free atomic
/// stores and need no lock at all.
pub struct Ept {
    pml4: Box<Table>,
    pdpt: Box<Table>,
    /// One PD per installed 1 GiB region, indexed by PDPTE index.
    pds: Vec<Box<Table>>,
    /// PT tables created by [`Ept::split`]; kept alive for the tree's
    /// lifetime since splits are one-way (no unsplit operation exists).
    splits: SpinLock<Vec<Box<Table>>>,
}

impl Ept {
    /// Build an identity map covering `[0, installed_bytes)` with 2 MiB
    /// leaves, resolving each leaf's memory type from `mtrr`.
    pub fn new(mtrr: &MtrrOverlay, installed_bytes: usize) -> Result<Self, VmError> {
        let gib_count = installed_bytes.div_ceil(GIB).max(1);
        if gib_count > ENTRIES {
            return Err(VmError::InvalidRequest(
                "installed RAM exceeds what one PDPT (512 GiB) can identity-map",
            ));
        }

        let mut pml4 = Table::zeroed();
        let mut pdpt = Table::zeroed();
        let mut pds = Vec::with_capacity(gib_count);

        for gib in 0..gib_count {
            let mut pd = Table::zeroed();
            for pd_idx in 0..ENTRIES {
                let pa = Pa::new(gib * GIB + pd_idx * MIB2)
                    .ok_or(VmError::AddressTranslationFailed)?;
                if unsafe { pa.into_usize() } >= installed_bytes {
                    break;
                }
                let ty = mtrr.resolve(pa, MIB2);
                pd.0[pd_idx] = EptEntry::leaf(pa, true, true, true, ty, true);
            }
            let pd_pa = Va::new(pd.0.as_ptr() as usize)
                .expect("EPT tables are always kernel-mapped")
                .into_pa();
            pdpt.0[gib] = EptEntry::table(pd_pa);
            pds.push(pd);
        }

        let pdpt_pa = Va::new(pdpt.0.as_ptr() as usize)
            .expect("EPT tables are always kernel-mapped")
            .into_pa();
        pml4.0[0] = EptEntry::table(pdpt_pa);

        Ok(Self {
            pml4,
            pdpt,
            pds,
            splits: SpinLock::new(Vec::new()),
        })
    }

    /// The EPTP value to load into the VMCS `Eptptr` field.
    pub fn eptp(&self) -> u64 {
        let pml4_pa = Va::new(self.pml4.0.as_ptr() as usize)
            .expect("EPT tables are always kernel-mapped")
            .into_pa();
        (unsafe { pml4_pa.into_usize() } as u64 & ADDR_MASK)
            | (EPTP_WALK_LENGTH << 3)
            | EPTP_MEMORY_TYPE_WB
    }

    fn pd_indices(pa: Pa) -> (usize, usize) {
        let addr = unsafe { pa.into_usize() };
        (addr / GIB, (addr % GIB) / MIB2)
    }

    /// Borrow the PD entry covering `pa`'s 2 MiB region. The entry may still
    /// be a 2 MiB leaf or may already reference a split-out PT.
    pub fn get_pd_entry(&self, pa: Pa) -> Result<&EptEntry, VmError> {
        let (gib, pd_idx) = Self::pd_indices(pa);
        self.pds
            .get(gib)
            .map(|pd| &pd.0[pd_idx])
            .ok_or(VmError::AddressTranslationFailed)
    }

    fn pd_entry_ptr(&self, pa: Pa) -> Result<*mut EptEntry, VmError> {
        let (gib, pd_idx) = Self::pd_indices(pa);
        self.pds
            .get(gib)
            .map(|pd| &pd.0[pd_idx] as *const EptEntry as *mut EptEntry)
            .ok_or(VmError::AddressTranslationFailed)
    }

    /// Ensure the 2 MiB region covering `pa` is split to 4 KiB granularity,
    /// then return the PT entry for `pa`'s own 4 KiB page.
    ///
    /// Steps, matching Intel SDM §28.2.3's requirement that a paging
    /// structure change be followed by invalidation before it is relied on:
    /// 1. If already split, skip straight to indexing the existing PT.
    /// 2. Allocate a fresh 4 KiB, zeroed PT.
    /// 3. Populate all 512 PTEs with the original 2 MiB leaf's permissions
    ///    and memory type, one 4 KiB leaf each.
    /// 4. Atomically replace the PD leaf with a table-referencing entry
    ///    pointing at the new PT.
    /// 5. The caller is responsible for an EPT invalidation before assuming
    ///    every core observes the new layout.
    pub fn get_pt_entry(&self, pa: Pa, platform: &dyn Platform) -> Result<&EptEntry, VmError> {
        let pt = self.split(pa, platform)?;
        let pt_idx = (unsafe { pa.into_usize() } % MIB2) / KIB4;
        Ok(&pt.0[pt_idx])
    }

    fn pt_entry_ptr(&self, pa: Pa, platform: &dyn Platform) -> Result<*mut EptEntry, VmError> {
        let pt = self.split(pa, platform)?;
        let pt_idx = (unsafe { pa.into_usize() } % MIB2) / KIB4;
        Ok(&pt.0[pt_idx] as *const EptEntry as *mut EptEntry)
    }

    fn split(&self, pa: Pa, platform: &dyn Platform) -> Result<&Table, VmError> {
        let pd_entry_ptr = self.pd_entry_ptr(pa)?;
        let current = unsafe { EptEntry::atomic_load(pd_entry_ptr) };

        if !current.is_page_size() {
            // Already split: the PD entry references a PT.
            let pt_pa = current.frame();
            let pt_va = pt_pa.into_va();
            return Ok(unsafe { &*(pt_va.into_usize() as *const Table) });
        }

        let _ = platform;
        let mut splits = self.splits.lock();
        // Re-check under the lock: another core may have split this region
        // while we were spinning for it.
        let current = unsafe { EptEntry::atomic_load(pd_entry_ptr) };
        if !current.is_page_size() {
            let pt_pa = current.frame();
            let pt_va = pt_pa.into_va();
            return Ok(unsafe { &*(pt_va.into_usize() as *const Table) });
        }

        let region_base = Pa::new(unsafe { pa.into_usize() } & !(MIB2 - 1))
            .ok_or(VmError::AddressTranslationFailed)?;
        let (read, write, execute) = current.permissions();
        let memory_type = current.memory_type();

        let mut pt = Table::zeroed();
        for i in 0..ENTRIES {
            let frame = Pa::new(unsafe { region_base.into_usize() } + i * KIB4)
                .ok_or(VmError::AddressTranslationFailed)?;
            pt.0[i] = EptEntry::leaf(frame, read, write, execute, memory_type, false);
        }

        let pt_pa = Va::new(pt.0.as_ptr() as usize)
            .expect("EPT tables are always kernel-mapped")
            .into_pa();
        let new_entry = EptEntry::table(pt_pa);

        // Keep the allocation alive before publishing the PD entry: once
        // other cores can see `new_entry` they may dereference its target
        // at any time.
        splits.push(pt);
        unsafe { EptEntry::atomic_store(pd_entry_ptr, new_entry) };
        Ok(unsafe { &*(pt_pa.into_va().into_usize() as *const Table) })
    }

    /// Flip the permission bits of the 4 KiB leaf covering `pa` to `(read,
    /// write, execute)`, optionally repointing it at a different frame. The
    /// page must already have been split to 4 KiB granularity.
    pub fn set_pte_view(
        &self,
        pa: Pa,
        frame: Pa,
        read: bool,
        write: bool,
        execute: bool,
        platform: &dyn Platform,
    ) -> Result<(), VmError> {
        let ptr = self.pt_entry_ptr(pa, platform)?;
        let current = unsafe { EptEntry::atomic_load(ptr) };
        let entry = EptEntry::leaf(frame, read, write, execute, current.memory_type(), false);
        unsafe { EptEntry::atomic_store(ptr, entry) };
        Ok(())
    }

    /// Request an EPT invalidation for this tree's EPTP on the current core.
    pub fn invalidate_local(&self) -> Result<(), VmError> {
        unsafe { hal::x86_64::vmx::invept(hal::x86_64::vmx::InveptType::SingleContext, self.eptp()) }
            .map_err(|_| VmError::AddressTranslationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrips_frame_and_permissions() {
        let frame = Pa::new(0x1234_0000).unwrap();
        let e = EptEntry::leaf(frame, true, false, true, MemoryType::WriteBack, false);
        assert!(e.is_present());
        assert!(!e.is_page_size());
        assert_eq!(unsafe { e.frame().into_usize() }, 0x1234_0000);
        assert_eq!(e.permissions(), (true, false, true));
        assert_eq!(e.memory_type() as u8, MemoryType::WriteBack as u8);
    }

    #[test]
    fn table_entry_is_always_full_permission() {
        let child = Pa::new(0x2000).unwrap();
        let e = EptEntry::table(child);
        assert_eq!(e.permissions(), (true, true, true));
    }

    #[test]
    fn empty_entry_is_not_present() {
        assert!(!EptEntry::empty().is_present());
    }
}
