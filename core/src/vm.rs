//! [`Hypervisor`]: the lifecycle controller tying every other module
//! together into something a driver can actually load, arm, and unload.
//!
//! A `Hypervisor` owns the EPT tree, the hook/watchpoint registry, the
//! per-CPU VMX state, and the bookkeeping `enable`/`disable` need to bring
//! every core the host controls into (and back out of) VMX non-root
//! operation. Everything that happens once a core is running virtualized —
//! EPT violations, CPUID, the rest — is handled by [`crate::vmexits`]; this
//! module is only concerned with getting cores into and out of that state.
//!
//! [`crate::vcpu::vm_exit_entry`]'s assembly trampoline calls into
//! [`crate::vmexits::dispatch_from_exit`] with nothing more than a register
//! pointer and a masked APIC id — no way to pass it a reference to whichever
//! `Hypervisor` owns the core that just exited. [`active`] closes that gap
//! with a single process-wide pointer, set by [`Hypervisor::enable`] and
//! cleared by [`Hypervisor::disable`].

use crate::ept::Ept;
use crate::error::VmError;
use crate::hook::{AccessRecord, HookId, HookKind, HookRegistry};
use crate::mtrr::MtrrOverlay;
use crate::vcpu::{self, PerCpuState};
use crate::violation::PendingRearms;
use crate::vmexits;
use crate::walk::{self, TargetVa, TranslationHint};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use hal::addressing::Pa;
use hal::interrupt::InterruptGuard;
use hal::mem::ContigPages;
use hal::platform::Platform;
use spin_lock::SpinLock;

static ACTIVE: AtomicPtr<Hypervisor> = AtomicPtr::new(core::ptr::null_mut());

/// The `Hypervisor` currently owning this process's virtualized cores, if
/// any. Read from inside the plain `fn(usize)` callbacks
/// [`Platform::for_each_cpu`] requires, and from
/// [`crate::vmexits::dispatch_from_exit`], neither of which can capture a
/// closure over `self`.
pub(crate) fn active() -> Option<&'static Hypervisor> {
    let ptr = ACTIVE.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Builds a [`Hypervisor`]: allocates the EPT tree and per-CPU VMX state up
/// front, so `enable` only ever has to do VMX setup, never fallible
/// allocation, on the hot path.
pub struct HypervisorBuilder {
    platform: &'static dyn Platform,
    target_process: &'static dyn walk::TargetProcess,
    installed_bytes: usize,
    exception_bitmap: u32,
    mtrr: Option<MtrrOverlay>,
}

impl HypervisorBuilder {
    /// Start building a `Hypervisor` that will identity-map `installed_bytes`
    /// of physical memory. `target_process` is the collaborator `install_hook`
    /// asks to resolve a target pid's CR3.
    pub fn new(
        platform: &'static dyn Platform,
        target_process: &'static dyn walk::TargetProcess,
        installed_bytes: usize,
    ) -> Self {
        Self {
            platform,
            target_process,
            installed_bytes,
            exception_bitmap: default_exception_bitmap(),
            mtrr: None,
        }
    }

    /// Override the `ExceptionBitmap` value used for every core. Defaults to
    /// trapping `#UD` when the `syscall_hook` feature is enabled and nothing
    /// otherwise.
    pub fn exception_bitmap(mut self, bitmap: u32) -> Self {
        self.exception_bitmap = bitmap;
        self
    }

    /// Supply a captured MTRR snapshot instead of reading the host's own at
    /// build time (used by tests, where there may be no real MTRRs to read).
    pub fn mtrr(mut self, overlay: MtrrOverlay) -> Self {
        self.mtrr = Some(overlay);
        self
    }

    pub fn build(self) -> Result<Hypervisor, VmError> {
        let mtrr = self.mtrr.unwrap_or_else(MtrrOverlay::capture);
        let ept = Ept::new(&mtrr, self.installed_bytes)?;

        let mut percpu: Vec<SpinLock<Option<PerCpuState>>> =
            (0..hal::MAX_CPU).map(|_| SpinLock::new(None)).collect();
        for index in 0..self.platform.cpu_count() {
            let apic_id = self.platform.apic_id_of(index).map_err(|_| {
                VmError::HardwareUnsupported("platform reported an unknown cpu index")
            })?;
            let slot = (apic_id & 63) as usize;
            let state = PerCpuState::new(self.platform)?;
            *percpu[slot].lock() = Some(state);
        }

        Ok(Hypervisor {
            platform: self.platform,
            target_process: self.target_process,
            ept,
            registry: HookRegistry::new(),
            pending: PendingRearms::new(),
            percpu: percpu.into_boxed_slice(),
            exception_bitmap: self.exception_bitmap,
            enabled: AtomicBool::new(false),
            active_mask: AtomicU64::new(0),
        })
    }
}

fn default_exception_bitmap() -> u32 {
    if cfg!(feature = "syscall_hook") {
        1 << 6 // #UD: needed to catch SYSCALL/SYSRET for emulation.
    } else {
        0
    }
}

/// Everything this crate needs to virtualize the host it's running on: the
/// EPT tree, the hook/watchpoint registry, and one [`PerCpuState`] per
/// logical processor [`Platform::cpu_count`] reports.
///
/// `percpu` is indexed by *masked APIC id* (`apic_id & 63`), not by
/// `Platform`'s own dense `0..cpu_count()` index: the hand-written VM-exit
/// trampoline in [`crate::vcpu::vm_exit_entry`] computes its `cpu` argument
/// straight from `cpuid(eax=1).ebx`, with no way to consult `Platform` at
/// that point, so this module has to meet it on those terms everywhere else
/// too.
pub struct Hypervisor {
    platform: &'static dyn Platform,
    target_process: &'static dyn walk::TargetProcess,
    ept: Ept,
    registry: HookRegistry,
    pending: PendingRearms,
    percpu: Box<[SpinLock<Option<PerCpuState>>]>,
    exception_bitmap: u32,
    enabled: AtomicBool,
    active_mask: AtomicU64,
}

fn expected_mask(platform: &dyn Platform) -> u64 {
    let mut mask = 0u64;
    for index in 0..platform.cpu_count() {
        if let Ok(apic_id) = platform.apic_id_of(index) {
            mask |= 1u64 << (apic_id & 63);
        }
    }
    mask
}

fn enable_one_cpu(index: usize) {
    let Some(hv) = active() else { return };
    let Ok(apic_id) = hv.platform.apic_id_of(index) else {
        return;
    };
    let slot = (apic_id & 63) as usize;

    // `launch`'s own safety contract requires interrupts disabled across the
    // VMLAUNCH that may (from this core's perspective) return twice.
    let _guard = InterruptGuard::new();
    let mut state_slot = hv.percpu[slot].lock();
    let Some(state) = state_slot.as_mut() else {
        return;
    };

    match unsafe { vcpu::launch(state, hv.ept.eptp(), hv.exception_bitmap) } {
        Ok(()) => {
            hv.active_mask.fetch_or(1u64 << slot, Ordering::AcqRel);
        }
        Err(err) => hal::warn!("cpu {} failed to enter vmx non-root operation: {}", index, err),
    }
}

fn disable_one_cpu(index: usize) {
    let Some(hv) = active() else { return };
    let Ok(apic_id) = hv.platform.apic_id_of(index) else {
        return;
    };
    let slot = (apic_id & 63) as usize;
    if hv.active_mask.load(Ordering::Acquire) & (1u64 << slot) == 0 {
        // Never came up (or already torn down); nothing to ask it to leave.
        return;
    }

    // CPUID exits unconditionally in VMX non-root operation: no execution
    // control can suppress it. Issuing the magic leaf here, synchronously,
    // from inside this very callback, is intercepted by
    // `vmexits::dispatch_from_exit`, which performs VMXOFF and jumps back to
    // right after this instruction with the same registers and stack. From
    // this function's point of view the CPUID call below simply returns,
    // just later and non-virtualized.
    unsafe {
        core::arch::asm!(
            "cpuid",
            inout("eax") vmexits::MAGIC_EAX => _,
            inout("ecx") vmexits::MAGIC_ECX_DISABLE => _,
            out("ebx") _,
            out("edx") _,
        );
    }
}

impl Hypervisor {
    pub(crate) fn ept(&self) -> &Ept {
        &self.ept
    }

    pub(crate) fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub(crate) fn pending(&self) -> &PendingRearms {
        &self.pending
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        self.platform
    }

    /// Clear this slot's launched flag and active-mask bit. Called from
    /// [`crate::vmexits::dispatch_from_exit`] once VMXOFF has actually run on
    /// `cpu` (a masked APIC id).
    pub(crate) fn teardown_cpu(&self, cpu: usize) {
        self.active_mask.fetch_and(!(1u64 << cpu), Ordering::AcqRel);
        if let Some(state) = self.percpu[cpu].lock().as_mut() {
            vcpu::mark_torn_down(state);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Bring every core the platform controls into VMX non-root operation,
    /// without touching `enabled` or the hook registry: the shared body of
    /// [`Hypervisor::enable`] and [`Hypervisor::on_wake`].
    ///
    /// Requires `'static` because [`Platform::for_each_cpu`]'s callback is a
    /// plain function pointer with no room to capture `self`; the only way
    /// it can reach this `Hypervisor` again is through [`active`], which
    /// this call populates.
    fn bring_up(&'static self) -> Result<(), VmError> {
        ACTIVE.store(self as *const Hypervisor as *mut Hypervisor, Ordering::Release);
        self.platform.for_each_cpu(enable_one_cpu);

        if self.active_mask.load(Ordering::Acquire) != expected_mask(self.platform) {
            // Not every core came up; rather than run half-virtualized, walk
            // back whichever cores did.
            self.platform.for_each_cpu(disable_one_cpu);
            ACTIVE.store(core::ptr::null_mut(), Ordering::Release);
            return Err(VmError::HardwareUnsupported(
                "not every controlled cpu entered vmx non-root operation",
            ));
        }
        Ok(())
    }

    /// Take every core back out of VMX non-root operation, without touching
    /// `enabled` or the hook registry: the shared body of
    /// [`Hypervisor::disable`] and [`Hypervisor::on_sleep`].
    fn bring_down(&'static self) {
        self.platform.for_each_cpu(disable_one_cpu);

        if self.active_mask.load(Ordering::Acquire) != 0 {
            // Some core never executed VMXOFF. Continuing to unload this
            // Hypervisor's memory underneath a core still virtualizing it
            // would be worse than stopping here.
            hal::warn!("not every cpu left vmx non-root operation");
            unsafe { core::arch::asm!("cli", "2:", "hlt", "jmp 2b", options(noreturn)) }
        }

        ACTIVE.store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Bring every core the platform controls into VMX non-root operation.
    pub fn enable(&'static self) -> Result<(), VmError> {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return Err(VmError::InvalidRequest("hypervisor is already enabled"));
        }
        if let Err(err) = self.bring_up() {
            self.enabled.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    /// Take every core back out of VMX non-root operation and forget every
    /// installed hook and watchpoint.
    pub fn disable(&'static self) -> Result<(), VmError> {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return Err(VmError::InvalidRequest("hypervisor is not enabled"));
        }
        let _ = self.disable_all_hooks();
        self.bring_down();
        Ok(())
    }

    /// Called by the host's power-management collaborator before a sleep
    /// transition (e.g. S3): takes every core back out of VMX non-root
    /// operation, same as `disable`, but leaves the hook registry and EPT
    /// tree untouched so `on_wake` can bring the exact same set of hooks
    /// back without reinstalling anything.
    pub fn on_sleep(&'static self) -> Result<(), VmError> {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return Err(VmError::InvalidRequest("hypervisor is not enabled"));
        }
        self.bring_down();
        Ok(())
    }

    /// Called by the host's power-management collaborator after resuming
    /// from sleep: re-enters VMX non-root operation against the same EPT
    /// tree `on_sleep` left behind, so every `HookId` issued before sleeping
    /// is still installed and still valid.
    pub fn on_wake(&'static self) -> Result<(), VmError> {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return Err(VmError::InvalidRequest("hypervisor is already enabled"));
        }
        if let Err(err) = self.bring_up() {
            self.enabled.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    /// Install an execute-hook at `base_pa`, given an already-resolved
    /// physical frame and an already-built fake page: the guest runs
    /// `fake_page`'s contents in place of the real page's, while reads and
    /// writes still see the unmodified original. The public, spec-facing
    /// entry point is [`Hypervisor::install_hook`], which resolves a target
    /// process's virtual address and builds the fake page before calling
    /// this.
    fn install_raw_hook(
        &self,
        base_pa: Pa,
        source_pid: u64,
        target_pid: u64,
        source_vaddr: TargetVa,
        fake_page: ContigPages,
    ) -> Result<HookId, VmError> {
        let id = self
            .registry
            .install_hook(base_pa, source_pid, target_pid, source_vaddr, fake_page)?;
        let entry = self
            .registry
            .lookup_hook(base_pa)
            .ok_or(VmError::Fatal(Box::from("hook vanished immediately after install")))?;
        self.ept
            .set_pte_view(entry.base_pa, entry.exec_frame, false, false, true, self.platform)?;
        entry.executing.store(true, Ordering::Release);
        self.ept.invalidate_local()?;
        Ok(id)
    }

    /// Patch `target_vaddr` in `target_pid`'s address space with `bytes`
    /// (the first `len` of them), attributing the hook to `source_pid`.
    ///
    /// `target_vaddr`..`target_vaddr + len` must not cross a page boundary.
    /// If `hints` already covers the target page (from an earlier
    /// [`Hypervisor::generate_translation_hints`] call made while running in
    /// the target's own address space) its physical address is reused
    /// instead of walking `target_pid`'s page tables a second time.
    pub fn install_hook(
        &self,
        target_pid: u64,
        target_vaddr: TargetVa,
        bytes: &[u8],
        len: usize,
        source_pid: u64,
        hints: Option<&[TranslationHint]>,
    ) -> Result<HookId, VmError> {
        let page_size = hal::addressing::PAGE_SIZE;
        let page_mask = hal::addressing::PAGE_MASK as u64;
        let offset = (target_vaddr.raw() & page_mask) as usize;

        if len > page_size - offset || len > bytes.len() {
            return Err(VmError::InvalidRequest(
                "hook must not cross a page boundary",
            ));
        }

        let page_va = TargetVa::new(target_vaddr.raw() & !page_mask);
        let base_pa = match hints.and_then(|hints| hints.iter().find(|hint| hint.vaddr == page_va)) {
            Some(hint) => hint.paddr,
            None => {
                let cr3 = self
                    .target_process
                    .cr3(target_pid)
                    .map_err(|_| VmError::ProcessGone)?;
                walk::translate(cr3, page_va)?.ok_or(VmError::AddressTranslationFailed)?
            }
        };

        let fake_page = self
            .platform
            .allocate_contiguous(1)
            .map_err(|_| VmError::AllocationFailed)?;
        let mut original = alloc::vec![0u8; page_size];
        unsafe { hal::mem::read_physical(base_pa, &mut original) }
            .ok_or(VmError::AddressTranslationFailed)?;
        unsafe {
            let view = fake_page.as_mut_slice();
            view.copy_from_slice(&original);
            view[offset..offset + len].copy_from_slice(&bytes[..len]);
        }

        self.install_raw_hook(base_pa, source_pid, target_pid, target_vaddr, fake_page)
    }

    /// Install a watchpoint at `base_pa`: execute-only permanently, logging
    /// every non-execute access.
    pub fn install_watchpoint(
        &self,
        base_pa: Pa,
        source_pid: u64,
        target_pid: u64,
        source_vaddr: TargetVa,
    ) -> Result<HookId, VmError> {
        let id = self
            .registry
            .install_watchpoint(base_pa, source_pid, target_pid, source_vaddr)?;
        let entry = self
            .registry
            .lookup_watchpoint(base_pa)
            .ok_or(VmError::Fatal(Box::from(
                "watchpoint vanished immediately after install",
            )))?;
        self.ept
            .set_pte_view(entry.base_pa, entry.rw_frame, false, false, true, self.platform)?;
        entry.executing.store(true, Ordering::Release);
        self.ept.invalidate_local()?;
        Ok(id)
    }

    /// Overlay a patch onto an already-installed hook's fake page.
    pub fn merge_hook_patch(&self, base_pa: Pa, offset: usize, bytes: &[u8]) -> Option<HookId> {
        self.registry.merge_hook_patch(base_pa, offset, bytes)
    }

    /// Remove a hook or watchpoint and restore the page to its ordinary,
    /// fully-permissive view.
    pub fn remove(&self, id: HookId) -> Result<(), VmError> {
        let base_pa = id.base_pa();
        self.registry.remove(id)?;
        self.ept.set_pte_view(base_pa, base_pa, true, true, true, self.platform)?;
        self.ept.invalidate_local()
    }

    /// Remove every currently-installed hook and watchpoint, restoring each
    /// page's ordinary view, while leaving the hypervisor itself enabled.
    /// Returns the ids removed.
    pub fn disable_all_hooks(&self) -> Vec<HookId> {
        let removed = self.registry.disable_all();
        for id in &removed {
            let _ = self.ept.set_pte_view(id.base_pa(), id.base_pa(), true, true, true, self.platform);
        }
        let _ = self.ept.invalidate_local();
        removed
    }

    /// Remove every hook and watchpoint belonging to `pid`, restoring each
    /// page's ordinary view. Returns the ids removed.
    pub fn cleanup_process(&self, pid: u64) -> Vec<HookId> {
        let removed = self.registry.cleanup_process(pid);
        for id in &removed {
            let _ = self.ept.set_pte_view(id.base_pa(), id.base_pa(), true, true, true, self.platform);
        }
        let _ = self.ept.invalidate_local();
        removed
    }

    /// Drain and return every access a watchpoint has recorded so far.
    pub fn access_records(&self) -> Vec<AccessRecord> {
        self.registry.access_records()
    }

    pub fn hook_count(&self) -> usize {
        self.registry.count_by_kind(HookKind::Hook)
    }

    pub fn watchpoint_count(&self) -> usize {
        self.registry.count_by_kind(HookKind::Watchpoint)
    }

    /// Walk a target process's own page tables, same as
    /// [`crate::walk::generate_translation_hints`], exposed here so callers
    /// only need to hold a `&Hypervisor`.
    pub fn generate_translation_hints(
        &self,
        cr3: u64,
        vaddr: TargetVa,
        len: usize,
    ) -> Result<Vec<TranslationHint>, VmError> {
        walk::generate_translation_hints(cr3, vaddr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::addressing::Va;
    use hal::platform::PlatformError;
    use std::sync::Mutex;
    use std::vec::Vec as StdVec;

    /// A `Platform` that never touches real hardware: `for_each_cpu` just
    /// calls back on the current thread, and allocations come from the Rust
    /// heap rather than a physical-memory allocator. Enough to exercise the
    /// bookkeeping this module owns and `install_hook`'s validation up to
    /// the point it would touch the EPT tree; anything that would execute a
    /// real VMX or INVEPT instruction (`enable`, `disable`, a
    /// successful `install_hook`/`remove`) needs actual VT-x hardware and is
    /// intentionally left untested here, the same way `ept`'s and
    /// `violation`'s own tests stop short of calling into live VMCS state.
    struct MockPlatform {
        cpu_count: usize,
        backing: Mutex<StdVec<Box<[u8]>>>,
    }

    impl MockPlatform {
        fn new(cpu_count: usize) -> Self {
            Self {
                cpu_count,
                backing: Mutex::new(StdVec::new()),
            }
        }
    }

    impl Platform for MockPlatform {
        fn cpu_count(&self) -> usize {
            self.cpu_count
        }

        fn current_cpu_index(&self) -> usize {
            0
        }

        fn apic_id_of(&self, index: usize) -> Result<u32, PlatformError> {
            if index < self.cpu_count {
                Ok(index as u32)
            } else {
                Err(PlatformError::NoSuchCpu)
            }
        }

        fn for_each_cpu(&self, f: fn(usize)) {
            for index in 0..self.cpu_count {
                f(index);
            }
        }

        fn allocate_contiguous(&self, pages: usize) -> Result<ContigPages, PlatformError> {
            let mut buf = alloc::vec![0u8; pages * hal::addressing::PAGE_SIZE].into_boxed_slice();
            let addr = buf.as_mut_ptr() as usize;
            let pa = Pa::new(addr).ok_or(PlatformError::OutOfMemory)?;
            let va = Va::new(addr).ok_or(PlatformError::OutOfMemory)?;
            self.backing.lock().unwrap().push(buf);
            Ok(unsafe { ContigPages::from_raw(pa, va, pages) })
        }

        fn free_contiguous(&self, _pages: ContigPages) {}

        fn log_write(&self, _line: core::fmt::Arguments<'_>) {}
    }

    /// A `TargetProcess` whose only live pid is 1, resolving to a CR3 of 0 —
    /// `walk::translate` against that CR3 will fail to find anything
    /// present, which is exactly what the boundary-check tests below need:
    /// they must never get far enough to actually walk it.
    struct MockTargetProcess;

    impl walk::TargetProcess for MockTargetProcess {
        fn cr3(&self, pid: u64) -> Result<u64, VmError> {
            if pid == 1 {
                Ok(0)
            } else {
                Err(VmError::ProcessGone)
            }
        }
    }

    fn mock_hypervisor(cpu_count: usize) -> &'static Hypervisor {
        let platform: &'static MockPlatform = Box::leak(Box::new(MockPlatform::new(cpu_count)));
        let target_process: &'static MockTargetProcess = Box::leak(Box::new(MockTargetProcess));
        Box::leak(Box::new(
            HypervisorBuilder::new(platform, target_process, 16 * 1024 * 1024)
                .mtrr(MtrrOverlay::write_back_only())
                .build()
                .expect("build with a well-behaved mock platform must succeed"),
        ))
    }

    #[test]
    fn expected_mask_follows_apic_ids() {
        let platform = MockPlatform::new(3);
        assert_eq!(expected_mask(&platform), 0b111);
    }

    #[test]
    fn build_populates_one_slot_per_reported_cpu() {
        let hv = mock_hypervisor(4);

        assert!(!hv.is_enabled());
        assert_eq!(hv.hook_count(), 0);
        assert_eq!(hv.watchpoint_count(), 0);
        for slot in 0..4 {
            assert!(hv.percpu[slot].lock().is_some());
        }
        for slot in 4..hal::MAX_CPU {
            assert!(hv.percpu[slot].lock().is_none());
        }
    }

    #[test]
    fn install_hook_rejects_a_patch_crossing_a_page_boundary() {
        let hv = mock_hypervisor(1);
        let target_vaddr = TargetVa::new(0xffe);
        let err = hv
            .install_hook(1, target_vaddr, &[0xcc, 0xcc, 0xcc], 3, 1, None)
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidRequest(_)));
        assert_eq!(hv.hook_count(), 0);
    }

    #[test]
    fn install_hook_maps_an_unknown_pid_to_process_gone() {
        let hv = mock_hypervisor(1);
        let target_vaddr = TargetVa::new(0x1000);
        let err = hv
            .install_hook(99, target_vaddr, &[0xcc], 1, 1, None)
            .unwrap_err();
        assert!(matches!(err, VmError::ProcessGone));
    }
}
