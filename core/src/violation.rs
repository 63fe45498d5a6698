//! The EPT-violation decision table: the one place that turns "a core
//! touched this physical page the wrong way" into a permission flip, a
//! logged access, or a fatal teardown.
//!
//! An EPT violation fires when the running core's access to a guest-physical
//! page doesn't match that page's current EPT permissions. Every hooked page
//! sits at exactly one of two views at any moment (execute-only or
//! read/write-only); the violation is *how* this crate notices which view
//! the next access needs and flips to it. A watchpoint page stays
//! execute-only permanently and instead uses the violation as a trigger to
//! record the access and single-step past it.

use crate::ept::Ept;
use crate::error::VmError;
use crate::hook::{HookEntry, HookKind, HookRegistry};
use crate::vm_control::VmcsProcBasedVmexecCtl;
use crate::vmcs::{ActiveVmcs, EptViolationQualification, Field};
use core::sync::atomic::{AtomicU64, Ordering};
use hal::addressing::Pa;
use hal::platform::Platform;

/// What the dispatcher should do with the guest after handling a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Permissions were adjusted (or nothing needed adjusting); resume the
    /// guest at the same instruction, it will re-execute against the new view.
    Retry,
    /// A watchpoint's access was logged and MTF was armed to single-step
    /// exactly one instruction before re-arming the execute-only view.
    /// Resume the guest normally; the next exit for this core will be the
    /// matching [`Mtf`] exit, which [`handle_mtf`] completes.
    ///
    /// [`Mtf`]: crate::vmcs::BasicExitReason::Mtf
    SingleStepThenRearm,
}

/// Per-core state needed to complete a watchpoint single-step once the
/// matching MTF exit arrives. One array slot per logical processor the
/// platform controls; `u64::MAX` means "nothing pending".
pub struct PendingRearms {
    slots: [AtomicU64; hal::MAX_CPU],
}

const NONE_PENDING: u64 = u64::MAX;

impl PendingRearms {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| AtomicU64::new(NONE_PENDING)),
        }
    }

    fn arm(&self, cpu: usize, pa: Pa) {
        self.slots[cpu].store(unsafe { pa.into_usize() } as u64, Ordering::Release);
    }

    fn take(&self, cpu: usize) -> Option<Pa> {
        let raw = self.slots[cpu].swap(NONE_PENDING, Ordering::AcqRel);
        if raw == NONE_PENDING {
            None
        } else {
            Pa::new(raw as usize)
        }
    }
}

impl Default for PendingRearms {
    fn default() -> Self {
        Self::new()
    }
}

struct ViolationKind {
    read: bool,
    write: bool,
    execute: bool,
}

fn classify(qualification: EptViolationQualification) -> ViolationKind {
    ViolationKind {
        read: qualification.contains(EptViolationQualification::BIT0),
        write: qualification.contains(EptViolationQualification::BIT1),
        execute: qualification.contains(EptViolationQualification::BIT2),
    }
}

fn install_exec_view(ept: &Ept, entry: &HookEntry, platform: &dyn Platform) -> Result<(), VmError> {
    ept.set_pte_view(entry.base_pa, entry.exec_frame, false, false, true, platform)?;
    entry.executing.store(true, Ordering::Release);
    ept.invalidate_local()
}

fn install_rw_view(ept: &Ept, entry: &HookEntry, platform: &dyn Platform) -> Result<(), VmError> {
    ept.set_pte_view(entry.base_pa, entry.rw_frame, true, true, false, platform)?;
    entry.executing.store(false, Ordering::Release);
    ept.invalidate_local()
}

/// Handle an EPT-violation VM-exit.
///
/// `fault_addr` is the guest-physical (= host-physical, in this design)
/// address from the exit qualification's `GuestPhysicalAddr` field.
#[allow(clippy::too_many_arguments)]
pub fn handle_ept_violation(
    ept: &Ept,
    registry: &HookRegistry,
    pending: &PendingRearms,
    cpu: usize,
    fault_addr: Option<Pa>,
    qualification: EptViolationQualification,
    active: &ActiveVmcs,
    platform: &dyn Platform,
) -> Result<Disposition, VmError> {
    let pa = fault_addr.ok_or(VmError::AddressTranslationFailed)?;
    let access = classify(qualification);

    let page_pa = Pa::new(unsafe { pa.into_usize() } & !hal::addressing::PAGE_MASK)
        .ok_or(VmError::AddressTranslationFailed)?;

    let entry = registry
        .lookup(page_pa)
        .ok_or(VmError::Fatal(alloc::boxed::Box::from(
            "EPT violation on a page with no installed hook or watchpoint",
        )))?;

    match entry.id.kind() {
        HookKind::Hook => {
            if access.execute {
                install_exec_view(ept, entry, platform)?;
            } else if access.read || access.write {
                install_rw_view(ept, entry, platform)?;
            }
            Ok(Disposition::Retry)
        }
        HookKind::Watchpoint => {
            if access.execute {
                // The page is supposed to be execute-only already; an
                // execute violation here means the view drifted out from
                // under us. Re-assert it and retry rather than treat it as
                // an anomaly worth killing the guest over.
                hal::warn!(
                    "watchpoint execute anomaly at pa {:#x}: view drifted, re-asserting",
                    unsafe { page_pa.into_usize() }
                );
                ept.set_pte_view(page_pa, entry.rw_frame, false, false, true, platform)?;
                ept.invalidate_local()?;
                return Ok(Disposition::Retry);
            }
            let rip = active.read(Field::GuestRip)?;
            let cr3 = active.read(Field::GuestCr3)?;
            registry.record_access(rip, cr3);
            ept.set_pte_view(page_pa, entry.rw_frame, true, true, true, platform)?;
            ept.invalidate_local()?;
            pending.arm(cpu, page_pa);
            arm_single_step(active)?;
            Ok(Disposition::SingleStepThenRearm)
        }
    }
}

/// Complete a watchpoint single-step: re-install the execute-only view and
/// disable MTF. Called from the MTF exit handler.
pub fn handle_mtf(
    ept: &Ept,
    pending: &PendingRearms,
    cpu: usize,
    active: &ActiveVmcs,
    platform: &dyn Platform,
) -> Result<(), VmError> {
    let Some(pa) = pending.take(cpu) else {
        // Not ours: some other MTF user (none currently exists in this
        // crate) would have consumed it already.
        return Ok(());
    };
    ept.set_pte_view(pa, pa, false, false, true, platform)?;
    ept.invalidate_local()?;

    let ctl = VmcsProcBasedVmexecCtl::from_bits_truncate(
        active.read(Field::ProcessorBasedVmexecControls)? as u32,
    );
    active.write(
        Field::ProcessorBasedVmexecControls,
        (ctl - VmcsProcBasedVmexecCtl::MTF).bits() as u64,
    )
}

/// Arm MTF for exactly one instruction, used right before resuming a guest
/// that just hit [`Disposition::SingleStepThenRearm`].
pub fn arm_single_step(active: &ActiveVmcs) -> Result<(), VmError> {
    let ctl = VmcsProcBasedVmexecCtl::from_bits_truncate(
        active.read(Field::ProcessorBasedVmexecControls)? as u32,
    );
    active.write(
        Field::ProcessorBasedVmexecControls,
        (ctl | VmcsProcBasedVmexecCtl::MTF).bits() as u64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_separates_access_kinds() {
        let q = EptViolationQualification::BIT1 | EptViolationQualification::BIT3;
        let access = classify(q);
        assert!(!access.read);
        assert!(access.write);
        assert!(!access.execute);
    }

    #[test]
    fn pending_rearms_round_trip() {
        let pending = PendingRearms::new();
        assert!(pending.take(0).is_none());
        let pa = Pa::new(0x1000).unwrap();
        pending.arm(0, pa);
        let taken = pending.take(0).unwrap();
        assert_eq!(unsafe { taken.into_usize() }, 0x1000);
        assert!(pending.take(0).is_none());
    }
}
