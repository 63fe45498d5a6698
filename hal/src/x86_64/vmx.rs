//! Raw VMX instruction wrappers.
//!
//! Every instruction here reports failure through RFLAGS.CF/ZF exactly as
//! the SDM defines (Vol. 3C §30.2): CF=1 is "VMfailInvalid" (no current
//! VMCS, or the processor isn't in VMX operation), ZF=1 is "VMfailValid"
//! (current VMCS exists; the reason is in the VM_INSTRUCTION_ERROR field).
//! Distinguishing the two is `core`'s job — `VmxFailure` just carries which
//! flag was set back up so `core::vmcs` can decide whether reading
//! VM_INSTRUCTION_ERROR is meaningful.

use core::arch::asm;

/// Outcome of a VMX instruction that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxFailure {
    /// CF=1: VMfailInvalid.
    Invalid,
    /// ZF=1: VMfailValid.
    Valid,
}

type VmxResult = Result<(), VmxFailure>;

#[inline(always)]
fn flags_to_result(cf: u8, zf: u8) -> VmxResult {
    if cf != 0 {
        Err(VmxFailure::Invalid)
    } else if zf != 0 {
        Err(VmxFailure::Valid)
    } else {
        Ok(())
    }
}

/// VMXON: enter VMX root operation on this core.
///
/// # Safety
/// `region_pa` must point to a 4 KiB, page-aligned region whose first dword
/// has been initialized with the core's VMCS revision identifier, and the
/// caller must not already be in VMX root operation on this core.
#[inline(always)]
pub unsafe fn vmxon(region_pa: u64) -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!(
        "vmxon [{0}]",
        "setc {1}",
        "setz {2}",
        in(reg) &region_pa,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf)
}

/// VMXOFF: leave VMX operation on this core.
///
/// # Safety
/// No VMCS may be active (VMCLEAR it first); the caller must already be in
/// VMX root operation.
#[inline(always)]
pub unsafe fn vmxoff() {
    asm!("vmxoff", options(nostack));
}

/// VMCLEAR: flush a VMCS out of the processor's working state and mark it
/// not-current.
///
/// # Safety
/// `region_pa` must be the physical address of a VMCS region previously
/// initialized or already clear.
#[inline(always)]
pub unsafe fn vmclear(region_pa: u64) -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!(
        "vmclear [{0}]",
        "setc {1}",
        "setz {2}",
        in(reg) &region_pa,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf)
}

/// VMPTRLD: make a VMCS current on this core.
///
/// # Safety
/// `region_pa` must point to a valid, VMCLEARed (or already-current) VMCS.
#[inline(always)]
pub unsafe fn vmptrld(region_pa: u64) -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!(
        "vmptrld [{0}]",
        "setc {1}",
        "setz {2}",
        in(reg) &region_pa,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf)
}

/// VMPTRST: read back the physical address of the currently-loaded VMCS.
#[inline(always)]
pub fn vmptrst() -> u64 {
    let mut out: u64 = 0;
    unsafe { asm!("vmptrst [{0}]", in(reg) &mut out, options(nostack)) };
    out
}

/// VMREAD a VMCS field.
///
/// # Safety
/// A VMCS must be current on this core.
#[inline(always)]
pub unsafe fn vmread(field: u64) -> Result<u64, VmxFailure> {
    let value: u64;
    let (cf, zf): (u8, u8);
    asm!(
        "vmread {0}, {1}",
        "setc {2}",
        "setz {3}",
        lateout(reg) value,
        in(reg) field,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf).map(|_| value)
}

/// VMWRITE a VMCS field.
///
/// # Safety
/// A VMCS must be current on this core, and `field`/`value` must be a
/// combination the processor accepts (most validation only happens at
/// VMLAUNCH/VMRESUME).
#[inline(always)]
pub unsafe fn vmwrite(field: u64, value: u64) -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!(
        "vmwrite {0}, {1}",
        "setc {2}",
        "setz {3}",
        in(reg) field,
        in(reg) value,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf)
}

/// Descriptor for INVEPT/INVVPID: a 128-bit memory operand.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct InvDescriptor(pub u64, pub u64);

/// INVEPT types (Intel SDM Table 31-2).
#[repr(u64)]
#[derive(Clone, Copy)]
pub enum InveptType {
    SingleContext = 1,
    Global = 2,
}

/// INVEPT: invalidate EPT-derived TLB/paging-structure-cache entries.
///
/// # Safety
/// Must run in VMX operation; `eptp` must be a currently-or-previously valid
/// EPTP when `ty` is `SingleContext`.
#[inline(always)]
pub unsafe fn invept(ty: InveptType, eptp: u64) -> VmxResult {
    let desc = InvDescriptor(eptp, 0);
    let (cf, zf): (u8, u8);
    asm!(
        "invept {0}, [{1}]",
        "setc {2}",
        "setz {3}",
        in(reg) ty as u64,
        in(reg) &desc,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf)
}

/// INVVPID types (Intel SDM Table 31-3).
#[repr(u64)]
#[derive(Clone, Copy)]
pub enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainGlobals = 3,
}

/// INVVPID: invalidate VPID-tagged TLB entries.
///
/// # Safety
/// Must run in VMX operation.
#[inline(always)]
pub unsafe fn invvpid(ty: InvvpidType, vpid: u16, linear_addr: u64) -> VmxResult {
    let desc = InvDescriptor(vpid as u64, linear_addr);
    let (cf, zf): (u8, u8);
    asm!(
        "invvpid {0}, [{1}]",
        "setc {2}",
        "setz {3}",
        in(reg) ty as u64,
        in(reg) &desc,
        lateout(reg_byte) cf,
        lateout(reg_byte) zf,
        options(nostack)
    );
    flags_to_result(cf, zf)
}

/// VMLAUNCH. Only valid the first time a given VMCS is entered after
/// VMPTRLD; subsequent entries must use [`vmresume`]. The full GPR
/// save/restore around this instruction lives in `shade-core`'s hand-written
/// entry trampoline, not here — this wrapper exists only for the rare path
/// (no guest register state to preserve, e.g. unit-testable control flow)
/// where the raw instruction is issued directly.
///
/// # Safety
/// A fully-configured VMCS must be current; on success this does not return
/// here (control transfers to guest RIP) — on failure it returns with
/// CF/ZF set.
#[inline(always)]
pub unsafe fn vmlaunch() -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!("vmlaunch", "setc {0}", "setz {1}", lateout(reg_byte) cf, lateout(reg_byte) zf, options(nostack));
    flags_to_result(cf, zf)
}

/// VMRESUME. See [`vmlaunch`].
///
/// # Safety
/// Same as [`vmlaunch`], and additionally this VMCS must have been
/// successfully VMLAUNCHed at least once since its last VMCLEAR.
#[inline(always)]
pub unsafe fn vmresume() -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!("vmresume", "setc {0}", "setz {1}", lateout(reg_byte) cf, lateout(reg_byte) zf, options(nostack));
    flags_to_result(cf, zf)
}
