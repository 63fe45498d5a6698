//! The hook and watchpoint registry: the source of truth for "what is
//! installed where", consulted by the violation handler on every EPT
//! violation and mutated only from passive-level `install_*`/`remove` calls.
//!
//! Mutation (insert, remove, cleanup-on-process-exit) takes one spinlock and
//! may allocate. Lookup by physical page — the hot path, run from inside the
//! VM-exit handler — never takes that lock: it walks a fixed-capacity,
//! open-addressed table of atomic pointers instead, so a concurrent mutation
//! on one core never blocks a lookup racing it on another.

use crate::error::VmError;
use crate::walk::TargetVa;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use hal::addressing::{Pa, PAGE_SHIFT};
use hal::mem::ContigPages;
use spin_lock::SpinLock;

/// Upper bound on concurrently-installed hooks and watchpoints combined.
/// Sized generously for a page-hook hypervisor: real usage is a handful to a
/// few dozen, never the tens of thousands a production memory scanner might
/// track.
pub const MAX_ENTRIES: usize = 256;

/// Number of most-recent accesses the watchpoint ring remembers.
pub const RING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// A split-view execute/read-write hook with a patched fake page.
    Hook,
    /// A degenerate hook with no fake page: logs accesses, never hides bytes.
    Watchpoint,
}

/// Opaque handle returned by install, required by remove. Carries enough of
/// the entry's identity that a stale or forged id is always rejected rather
/// than silently matching the wrong slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId {
    kind: HookKind,
    sequence: u64,
    base_pa: Pa,
}

impl HookId {
    pub fn kind(&self) -> HookKind {
        self.kind
    }

    pub fn base_pa(&self) -> Pa {
        self.base_pa
    }
}

pub struct HookEntry {
    pub id: HookId,
    pub source_pid: u64,
    pub target_pid: u64,
    pub source_vaddr: TargetVa,
    pub base_pa: Pa,
    /// Permissions to install for code (execute) accesses.
    pub exec_frame: Pa,
    /// Permissions to install for data (read/write) accesses: always the
    /// original frame, since the point of a hook is that reads/writes never
    /// see the patch.
    pub rw_frame: Pa,
    /// Backing allocation for the fake page: `None` for watchpoints.
    pub fake_page: Option<ContigPages>,
    /// Currently-installed view, so the violation handler knows what to
    /// flip *from*.
    pub executing: AtomicBool,
    removed: AtomicBool,
}

impl HookEntry {
    fn page_key(pa: Pa) -> usize {
        (unsafe { pa.into_usize() }) >> PAGE_SHIFT
    }
}

struct Ring {
    rips: [AtomicU64; RING_CAPACITY],
    cr3s: [AtomicU64; RING_CAPACITY],
    cursor: AtomicU64,
}

impl Ring {
    fn new() -> Self {
        // AtomicU64 isn't Copy, so build the arrays element-wise.
        Self {
            rips: core::array::from_fn(|_| AtomicU64::new(0)),
            cr3s: core::array::from_fn(|_| AtomicU64::new(0)),
            cursor: AtomicU64::new(0),
        }
    }

    fn record(&self, rip: u64, cr3: u64) {
        let slot = (self.cursor.fetch_add(1, Ordering::Relaxed) as usize) % RING_CAPACITY;
        self.rips[slot].store(rip, Ordering::Relaxed);
        self.cr3s[slot].store(cr3, Ordering::Relaxed);
    }

    /// Snapshot up to `RING_CAPACITY` most-recent records, oldest first.
    /// Best-effort: a concurrent writer may tear a read across two stores,
    /// in which case the snapshot can surface an (rip, cr3) pair that never
    /// actually co-occurred. Acceptable for a diagnostic ring.
    fn snapshot(&self) -> Vec<AccessRecord> {
        let written = self.cursor.load(Ordering::Relaxed);
        let count = written.min(RING_CAPACITY as u64) as usize;
        let start = if written as usize > RING_CAPACITY {
            written as usize % RING_CAPACITY
        } else {
            0
        };
        (0..count)
            .map(|i| {
                let slot = (start + i) % RING_CAPACITY;
                AccessRecord {
                    rip: self.rips[slot].load(Ordering::Relaxed),
                    cr3: self.cr3s[slot].load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// One best-effort-recorded access into a watchpoint's page.
#[derive(Debug, Clone, Copy)]
pub struct AccessRecord {
    pub rip: u64,
    pub cr3: u64,
}

/// Lock-free-read, spinlock-mutated registry of installed hooks and
/// watchpoints, keyed by physical page number with linear probing.
pub struct HookRegistry {
    slots: Box<[AtomicPtr<HookEntry>]>,
    mutate: SpinLock<()>,
    /// Entries removed from `slots` but kept alive: nothing guarantees a
    /// concurrent VM-exit on another core isn't still mid-dereference of the
    /// old pointer, and this crate has no epoch/RCU reclamation scheme. They
    /// are only actually freed by [`HookRegistry::reclaim_all`], called once
    /// the caller can prove no core is inside the violation handler (e.g.
    /// during `disable()`).
    graveyard: SpinLock<Vec<Box<HookEntry>>>,
    next_sequence: AtomicU64,
    ring: Ring,
}

const TOMBSTONE: *mut HookEntry = 1 as *mut HookEntry;

impl HookRegistry {
    pub fn new() -> Self {
        let slots = (0..MAX_ENTRIES)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mutate: SpinLock::new(()),
            graveyard: SpinLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            ring: Ring::new(),
        }
    }

    fn probe(&self, pa: Pa) -> usize {
        HookEntry::page_key(pa) % MAX_ENTRIES
    }

    /// Lock-free lookup of any installed entry (hook or watchpoint) covering `pa`.
    pub fn lookup(&self, pa: Pa) -> Option<&HookEntry> {
        let start = self.probe(pa);
        for i in 0..MAX_ENTRIES {
            let idx = (start + i) % MAX_ENTRIES;
            let ptr = self.slots[idx].load(Ordering::Acquire);
            if ptr.is_null() {
                return None;
            }
            if ptr == TOMBSTONE {
                continue;
            }
            // SAFETY: non-null, non-tombstone slots always point at a
            // HookEntry kept alive in either `slots` or `graveyard`.
            let entry = unsafe { &*ptr };
            if entry.base_pa == pa && !entry.removed.load(Ordering::Acquire) {
                return Some(entry);
            }
        }
        None
    }

    pub fn lookup_hook(&self, pa: Pa) -> Option<&HookEntry> {
        self.lookup(pa).filter(|e| e.id.kind == HookKind::Hook)
    }

    pub fn lookup_watchpoint(&self, pa: Pa) -> Option<&HookEntry> {
        self.lookup(pa).filter(|e| e.id.kind == HookKind::Watchpoint)
    }

    fn insert(&self, entry: Box<HookEntry>) -> Result<HookId, VmError> {
        let id = entry.id;
        let pa = entry.base_pa;
        let raw = Box::into_raw(entry);

        let _guard = self.mutate.lock();
        let start = self.probe(pa);
        for i in 0..MAX_ENTRIES {
            let idx = (start + i) % MAX_ENTRIES;
            let existing = self.slots[idx].load(Ordering::Acquire);
            if existing.is_null() || existing == TOMBSTONE {
                self.slots[idx].store(raw, Ordering::Release);
                return Ok(id);
            }
        }
        // SAFETY: never published, safe to reclaim immediately.
        drop(unsafe { Box::from_raw(raw) });
        Err(VmError::InvalidRequest("hook registry at capacity"))
    }

    /// Install a split-view hook at `base_pa`: instruction fetches will see
    /// `fake_page`, reads/writes will see the original frame.
    #[allow(clippy::too_many_arguments)]
    pub fn install_hook(
        &self,
        base_pa: Pa,
        source_pid: u64,
        target_pid: u64,
        source_vaddr: TargetVa,
        fake_page: ContigPages,
    ) -> Result<HookId, VmError> {
        if self.lookup(base_pa).is_some() {
            return Err(VmError::InvalidRequest(
                "a hook or watchpoint already covers this page",
            ));
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = HookId {
            kind: HookKind::Hook,
            sequence,
            base_pa,
        };
        let entry = Box::new(HookEntry {
            id,
            source_pid,
            target_pid,
            source_vaddr,
            base_pa,
            exec_frame: fake_page.pa(),
            rw_frame: base_pa,
            fake_page: Some(fake_page),
            executing: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        });
        self.insert(entry)
    }

    /// Install a watchpoint at `base_pa`: execute-only, logging every
    /// non-execute access.
    pub fn install_watchpoint(
        &self,
        base_pa: Pa,
        source_pid: u64,
        target_pid: u64,
        source_vaddr: TargetVa,
    ) -> Result<HookId, VmError> {
        if self.lookup(base_pa).is_some() {
            return Err(VmError::InvalidRequest(
                "a hook or watchpoint already covers this page",
            ));
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = HookId {
            kind: HookKind::Watchpoint,
            sequence,
            base_pa,
        };
        let entry = Box::new(HookEntry {
            id,
            source_pid,
            target_pid,
            source_vaddr,
            base_pa,
            exec_frame: base_pa,
            rw_frame: base_pa,
            fake_page: None,
            executing: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        });
        self.insert(entry)
    }

    /// Merge a patch into the fake page of an already-installed hook at
    /// `base_pa`, returning its existing id instead of installing a second
    /// entry. Backs the at-most-one-hook-per-page invariant: a caller asking
    /// to hook a page that's already hooked gets the same [`HookId`] back,
    /// with the new patch bytes overlaid onto the same fake page, rather than
    /// an error or a second, competing split view.
    ///
    /// Returns `None` if `base_pa` has no installed hook (a watchpoint on the
    /// page, or nothing at all, doesn't count).
    pub fn merge_hook_patch(&self, base_pa: Pa, offset: usize, bytes: &[u8]) -> Option<HookId> {
        let entry = self.lookup_hook(base_pa)?;
        let dest = Pa::new(unsafe { entry.exec_frame.into_usize() } + offset)?;
        unsafe { hal::mem::write_physical(dest, bytes) };
        Some(entry.id)
    }

    /// Remove a hook or watchpoint by id. Idempotent: removing an id that no
    /// longer exists (already removed, or never existed) returns an error
    /// rather than panicking, so a caller racing a process-exit cleanup
    /// never crashes the driver.
    pub fn remove(&self, id: HookId) -> Result<(), VmError> {
        let _guard = self.mutate.lock();
        let start = self.probe(id.base_pa);
        for i in 0..MAX_ENTRIES {
            let idx = (start + i) % MAX_ENTRIES;
            let ptr = self.slots[idx].load(Ordering::Acquire);
            if ptr.is_null() {
                break;
            }
            if ptr == TOMBSTONE {
                continue;
            }
            let entry = unsafe { &*ptr };
            if entry.id == id {
                entry.removed.store(true, Ordering::Release);
                self.slots[idx].store(TOMBSTONE, Ordering::Release);
                // SAFETY: `ptr` was published exactly once by `insert` and is
                // never reused by another insert (tombstoned, not nulled).
                self.graveyard
                    .lock()
                    .push(unsafe { Box::from_raw(ptr) });
                return Ok(());
            }
        }
        Err(VmError::InvalidRequest("no such hook or watchpoint"))
    }

    /// Remove every hook and watchpoint belonging to `pid`, as either the
    /// source (hooking) or target (hooked) process.
    pub fn cleanup_process(&self, pid: u64) -> Vec<HookId> {
        let mut removed = Vec::new();
        let _guard = self.mutate.lock();
        for slot in self.slots.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() || ptr == TOMBSTONE {
                continue;
            }
            let entry = unsafe { &*ptr };
            if entry.source_pid == pid || entry.target_pid == pid {
                entry.removed.store(true, Ordering::Release);
                slot.store(TOMBSTONE, Ordering::Release);
                removed.push(entry.id);
                self.graveyard
                    .lock()
                    .push(unsafe { Box::from_raw(ptr) });
            }
        }
        removed
    }

    /// Tear down every installed hook and watchpoint, e.g. before `disable()`.
    pub fn disable_all(&self) -> Vec<HookId> {
        let mut removed = Vec::new();
        let _guard = self.mutate.lock();
        for slot in self.slots.iter() {
            let ptr = slot.swap(core::ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() || ptr == TOMBSTONE {
                continue;
            }
            let entry = unsafe { &*ptr };
            entry.removed.store(true, Ordering::Release);
            removed.push(entry.id);
            self.graveyard
                .lock()
                .push(unsafe { Box::from_raw(ptr) });
        }
        removed
    }

    /// Free every tombstoned entry's backing memory. Caller must guarantee
    /// no core is currently inside the violation handler.
    pub fn reclaim_all(&self) {
        self.graveyard.lock().clear();
    }

    pub fn record_access(&self, rip: u64, cr3: u64) {
        self.ring.record(rip, cr3);
    }

    pub fn access_records(&self) -> Vec<AccessRecord> {
        self.ring.snapshot()
    }

    /// Count currently-installed entries of one kind. O(capacity), fine for
    /// the occasional driver-stats query this backs.
    pub fn count_by_kind(&self, kind: HookKind) -> usize {
        let mut count = 0;
        for slot in self.slots.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() || ptr == TOMBSTONE {
                continue;
            }
            // SAFETY: same as `lookup`.
            let entry = unsafe { &*ptr };
            if entry.id.kind == kind && !entry.removed.load(Ordering::Acquire) {
                count += 1;
            }
        }
        count
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::addressing::Va;

    fn fake_contig(pa_val: usize) -> ContigPages {
        // A ContigPages that never gets dereferenced in these tests: only
        // its `.pa()` is read.
        let va = Pa::new(pa_val).unwrap().into_va();
        unsafe { ContigPages::from_raw(Pa::new(pa_val).unwrap(), va, 1) }
    }

    #[test]
    fn install_then_lookup_then_remove() {
        let reg = HookRegistry::new();
        let pa = Pa::new(0x10_0000).unwrap();
        let id = reg
            .install_hook(pa, 1, 2, TargetVa::new(0x4000), fake_contig(0x20_0000))
            .unwrap();
        assert!(reg.lookup_hook(pa).is_some());
        assert!(reg.lookup_watchpoint(pa).is_none());
        reg.remove(id).unwrap();
        assert!(reg.lookup_hook(pa).is_none());
    }

    #[test]
    fn remove_is_not_repeatable() {
        let reg = HookRegistry::new();
        let pa = Pa::new(0x30_0000).unwrap();
        let id = reg
            .install_watchpoint(pa, 1, 2, TargetVa::new(0x5000))
            .unwrap();
        assert!(reg.remove(id).is_ok());
        assert!(reg.remove(id).is_err());
    }

    #[test]
    fn double_install_on_same_page_rejected() {
        let reg = HookRegistry::new();
        let pa = Pa::new(0x40_0000).unwrap();
        reg.install_watchpoint(pa, 1, 2, TargetVa::new(0x6000))
            .unwrap();
        assert!(reg
            .install_hook(pa, 1, 2, TargetVa::new(0x6000), fake_contig(0x41_0000))
            .is_err());
    }

    #[test]
    fn merge_hook_patch_returns_existing_id_for_known_hook() {
        let reg = HookRegistry::new();
        let pa = Pa::new(0x70_0000).unwrap();
        let id = reg
            .install_hook(pa, 1, 2, TargetVa::new(0x9000), fake_contig(0x71_0000))
            .unwrap();
        assert_eq!(reg.merge_hook_patch(pa, 0, &[]), Some(id));
    }

    #[test]
    fn merge_hook_patch_none_for_unknown_page() {
        let reg = HookRegistry::new();
        let pa = Pa::new(0x80_0000).unwrap();
        assert_eq!(reg.merge_hook_patch(pa, 0, &[]), None);
    }

    #[test]
    fn cleanup_process_removes_matching_entries_only() {
        let reg = HookRegistry::new();
        let pa_a = Pa::new(0x50_0000).unwrap();
        let pa_b = Pa::new(0x60_0000).unwrap();
        reg.install_watchpoint(pa_a, 7, 9, TargetVa::new(0x7000))
            .unwrap();
        reg.install_watchpoint(pa_b, 1, 2, TargetVa::new(0x8000))
            .unwrap();
        let removed = reg.cleanup_process(9);
        assert_eq!(removed.len(), 1);
        assert!(reg.lookup(pa_a).is_none());
        assert!(reg.lookup(pa_b).is_some());
    }

    #[test]
    fn ring_records_and_snapshots() {
        let reg = HookRegistry::new();
        reg.record_access(0xdead_beef, 0x1000);
        reg.record_access(0xfeed_face, 0x2000);
        let records = reg.access_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rip, 0xdead_beef);
        assert_eq!(records[1].rip, 0xfeed_face);
    }
}
