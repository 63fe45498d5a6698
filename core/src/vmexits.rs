//! The VM-exit dispatcher.
//!
//! Control lands here from hand-written assembly ([`crate::vcpu::vm_exit_entry`]),
//! never from ordinary Rust, once per trapped guest event. [`dispatch_from_exit`]
//! either returns normally — the trampoline then executes VMRESUME and the
//! guest never notices it left — or diverges through [`crate::vcpu::teardown_return`],
//! leaving VMX non-root operation on this core for good.
//!
//! Every exit reason this crate's VM-execution controls can actually produce
//! is handled here. Anything outside that set reaching this function would
//! mean the controls and the dispatcher have drifted apart; such an exit is
//! advanced past rather than left to spin forever.

use crate::error::VmError;
use crate::vcpu;
use crate::violation::{self, Disposition};
use crate::vm;
use crate::vmcs::{ActiveVmcs, BasicExitReason, ExitReason, Field};
use crate::walk;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};
use hal::interrupt::GeneralPurposeRegisters;
use hal::x86_64::intrinsics;
use hal::x86_64::msr::Msr;
use hal::x86_64::Rflags;

#[cfg(feature = "syscall_hook")]
use hal::x86_64::segmentation::SegmentAccess;
#[cfg(feature = "syscall_hook")]
use iced_x86::{Decoder, DecoderOptions, Mnemonic};

/// Non-standard CPUID leaf this hypervisor answers specially, on top of
/// ordinary passthrough. `EAX` is the magic leaf; `ECX` selects the request.
/// Gated to CPL 0 so only code running as the host kernel itself can reach
/// it, never ordinary guest user-mode code.
pub(crate) const MAGIC_EAX: u32 = 0x4141_4141;
pub(crate) const MAGIC_ECX_SYSCALL_HOOK: u32 = 0x4242_4242;
pub(crate) const MAGIC_ECX_DISABLE: u32 = 0x4242_4243;

/// Hypervisor-vendor leaf (Intel SDM §25.2.1's reserved software range,
/// conventionally 0x4000_0000..0x4000_00FF) this dispatcher answers so guest
/// software can detect that it is running under virtualization at all, quite
/// apart from the magic leaf above.
const CPUID_HYPERVISOR_LEAF: u32 = 0x4000_0001;
const VENDOR_SIGNATURE: [u8; 12] = *b"ShadeHVisor!";

const IA32_STAR: usize = 0xC000_0081;
const IA32_LSTAR: usize = 0xC000_0082;
const IA32_FMASK: usize = 0xC000_0084;

#[cfg(feature = "syscall_hook")]
static ARMED: AtomicBool = AtomicBool::new(false);

/// What the dispatcher should do once a single exit has been handled.
enum Action {
    /// VMRESUME and carry on.
    Resume,
    /// Leave VMX non-root operation on this core; the caller picks up the
    /// current guest state and jumps back into it unvirtualized.
    Teardown,
}

/// Entry point called by [`crate::vcpu::vm_exit_entry`] for every VM exit on
/// this core.
///
/// # Safety
/// Must only be called from `vm_exit_entry`, immediately after a VM exit,
/// with `regs` pointing at the just-saved guest general-purpose registers and
/// `cpu` the masked APIC id the trampoline computed for this core.
#[no_mangle]
pub unsafe extern "C" fn dispatch_from_exit(regs: *mut GeneralPurposeRegisters, cpu: usize) {
    let regs = &mut *regs;

    let active = match ActiveVmcs::activated() {
        Ok((active, _)) => active,
        Err(_) => halt_forever(),
    };

    let Some(hv) = vm::active() else {
        // The dispatcher only ever runs on a core this crate itself
        // virtualized; no active Hypervisor means something is badly wrong
        // and there is no state here to tear down safely.
        halt_forever()
    };

    match handle(hv, cpu, regs, &active) {
        Ok(Action::Resume) => {}
        Ok(Action::Teardown) => teardown(hv, cpu, &active),
        Err(err) => {
            hal::warn!("vm-exit handling failed, disabling this core: {}", err);
            teardown(hv, cpu, &active);
        }
    }
}

fn teardown(hv: &vm::Hypervisor, cpu: usize, active: &ActiveVmcs) -> ! {
    hv.teardown_cpu(cpu);
    let rip = active.read(Field::GuestRip).unwrap_or(0);
    let rsp = active.read(Field::GuestRsp).unwrap_or(0);
    let rflags = active.read(Field::GuestRflags).unwrap_or(0);
    let cr3 = active.read(Field::GuestCr3).unwrap_or(0);
    unsafe {
        // VM-exit unconditionally loads the host's CR3 from the VMCS
        // host-state area; the guest's own CR3 has to be put back before
        // jumping into code that expects it.
        hal::x86_64::write_cr3(cr3);
        vcpu::teardown_return(rip, rsp, rflags);
    }
}

fn halt_forever() -> ! {
    unsafe { core::arch::asm!("cli", "2:", "hlt", "jmp 2b", options(noreturn)) }
}

fn handle(
    hv: &vm::Hypervisor,
    cpu: usize,
    regs: &mut GeneralPurposeRegisters,
    active: &ActiveVmcs,
) -> Result<Action, VmError> {
    let reason = active.exit_reason()?;
    let basic = match reason {
        ExitReason::BasicExitReason(basic) => basic,
        ExitReason::EntryFailure(_) | ExitReason::ExitFromVmxRootOperation(_) => {
            return Err(VmError::Fatal(Box::from(
                "vm entry failed or exited from vmx root operation unexpectedly",
            )));
        }
    };

    match basic {
        BasicExitReason::Cpuid => handle_cpuid(regs, active),
        BasicExitReason::Invd => {
            unsafe { intrinsics::wbinvd() };
            active.forward_rip()?;
            Ok(Action::Resume)
        }
        BasicExitReason::Xsetbv => {
            handle_xsetbv(regs, active)?;
            Ok(Action::Resume)
        }
        BasicExitReason::ExceptionOrNmi => {
            handle_exception_or_nmi(regs, active)?;
            Ok(Action::Resume)
        }
        BasicExitReason::EptViolation {
            qualification,
            fault_addr,
        } => {
            match violation::handle_ept_violation(
                hv.ept(),
                hv.registry(),
                hv.pending(),
                cpu,
                fault_addr,
                qualification,
                active,
                hv.platform(),
            )? {
                Disposition::Retry | Disposition::SingleStepThenRearm => Ok(Action::Resume),
            }
        }
        BasicExitReason::EptMisconfig => Err(VmError::Fatal(Box::from(
            "EPT misconfiguration on a guest-physical access",
        ))),
        BasicExitReason::Mtf => {
            violation::handle_mtf(hv.ept(), hv.pending(), cpu, active, hv.platform())?;
            Ok(Action::Resume)
        }
        BasicExitReason::Vmclear
        | BasicExitReason::Vmlaunch
        | BasicExitReason::Vmptrld
        | BasicExitReason::Vmptrst
        | BasicExitReason::Vmread
        | BasicExitReason::Vmresume
        | BasicExitReason::Vmwrite
        | BasicExitReason::Vmxoff
        | BasicExitReason::Vmxon
        | BasicExitReason::Vmcall
        | BasicExitReason::Invept
        | BasicExitReason::Invvpid => {
            reject_vmx_instruction(active)?;
            Ok(Action::Resume)
        }
        _ => {
            // Outside this design's intercept set: nothing currently asks
            // the VM-execution controls for it, so getting here would be a
            // configuration mismatch rather than a meaningful event. Step
            // past it instead of spinning on the same instruction forever.
            active.forward_rip()?;
            Ok(Action::Resume)
        }
    }
}

fn current_cpl(active: &ActiveVmcs) -> Result<u8, VmError> {
    Ok((active.read(Field::GuestSsSelector)? & 0x3) as u8)
}

fn handle_cpuid(regs: &mut GeneralPurposeRegisters, active: &ActiveVmcs) -> Result<Action, VmError> {
    let eax = regs.rax as u32;
    let ecx = regs.rcx as u32;

    if eax == MAGIC_EAX && current_cpl(active)? == 0 {
        if ecx == MAGIC_ECX_DISABLE {
            active.forward_rip()?;
            return Ok(Action::Teardown);
        }
        #[cfg(feature = "syscall_hook")]
        if ecx == MAGIC_ECX_SYSCALL_HOOK {
            ARMED.store(true, Ordering::Release);
            regs.rax = 1;
            active.forward_rip()?;
            return Ok(Action::Resume);
        }
    }

    let real = intrinsics::cpuid_count(eax, ecx);
    let (mut a, mut b, mut c, mut d) = (real.eax, real.ebx, real.ecx, real.edx);
    if eax == 1 {
        // Hypervisor-present bit (Intel SDM §25.2.1).
        c |= 1 << 31;
    } else if eax == CPUID_HYPERVISOR_LEAF {
        a = CPUID_HYPERVISOR_LEAF;
        b = u32::from_le_bytes(VENDOR_SIGNATURE[0..4].try_into().unwrap());
        c = u32::from_le_bytes(VENDOR_SIGNATURE[4..8].try_into().unwrap());
        d = u32::from_le_bytes(VENDOR_SIGNATURE[8..12].try_into().unwrap());
    }
    regs.rax = a as u64;
    regs.rbx = b as u64;
    regs.rcx = c as u64;
    regs.rdx = d as u64;
    active.forward_rip()?;
    Ok(Action::Resume)
}

fn handle_xsetbv(regs: &GeneralPurposeRegisters, active: &ActiveVmcs) -> Result<(), VmError> {
    let xcr = regs.rcx as u32;
    let value = (regs.rax & 0xffff_ffff) | (regs.rdx << 32);
    let host_support = unsafe { intrinsics::xgetbv(0) };
    if xcr != 0 || value & !host_support != 0 {
        return inject_exception(active, 13, Some(0));
    }
    unsafe { intrinsics::xsetbv(xcr, value) };
    active.forward_rip()
}

fn reject_vmx_instruction(active: &ActiveVmcs) -> Result<(), VmError> {
    // No nested-VMX support exists in this design: a guest executing a VMX
    // instruction is told it failed the same way real hardware reports
    // VMfail-without-valid-VMCS, by setting CF and clearing the other status
    // flags (Intel SDM §31.2), then stepping past it as if it had run.
    let mut rflags = Rflags::from_bits_truncate(active.read(Field::GuestRflags)?);
    rflags.remove(Rflags::CF | Rflags::PF | Rflags::AF | Rflags::ZF | Rflags::SF | Rflags::OF);
    rflags.insert(Rflags::CF);
    active.write(Field::GuestRflags, rflags.bits())?;
    active.forward_rip()
}

fn inject_exception(active: &ActiveVmcs, vector: u8, error_code: Option<u32>) -> Result<(), VmError> {
    const VALID: u32 = 1 << 31;
    const TYPE_HARDWARE_EXCEPTION: u32 = 3 << 8;
    const DELIVER_ERROR_CODE: u32 = 1 << 11;
    let mut info = VALID | TYPE_HARDWARE_EXCEPTION | vector as u32;
    if let Some(code) = error_code {
        info |= DELIVER_ERROR_CODE;
        active.write(Field::VmentryExceptionErrCode, code as u64)?;
    }
    active.write(Field::VmentryInterruptionInfo, info as u64)
}

fn reinject_nmi(active: &ActiveVmcs) -> Result<(), VmError> {
    const VALID: u32 = 1 << 31;
    const TYPE_NMI: u32 = 2 << 8;
    const VECTOR_NMI: u32 = 2;
    active.write(Field::VmentryInterruptionInfo, (VALID | TYPE_NMI | VECTOR_NMI) as u64)
}

/// Mirror whatever exception the guest just took straight back at it,
/// unchanged and without advancing RIP, so the faulting instruction
/// re-executes and re-faults exactly as it would have unvirtualized.
fn reinject_exception(active: &ActiveVmcs) -> Result<(), VmError> {
    const DELIVER_ERROR_CODE: u32 = 1 << 11;
    let info = active.read(Field::VmexitInterruptionInfo)? as u32;
    active.write(Field::VmentryInterruptionInfo, info as u64)?;
    if info & DELIVER_ERROR_CODE != 0 {
        let err = active.read(Field::VmexitInterruptionErrCode)?;
        active.write(Field::VmentryExceptionErrCode, err)?;
    }
    Ok(())
}

fn handle_exception_or_nmi(
    regs: &mut GeneralPurposeRegisters,
    active: &ActiveVmcs,
) -> Result<(), VmError> {
    let info = active.read(Field::VmexitInterruptionInfo)? as u32;
    const TYPE_NMI: u32 = 2;
    if (info >> 8) & 0x7 == TYPE_NMI {
        return reinject_nmi(active);
    }

    #[cfg(feature = "syscall_hook")]
    {
        const UD_VECTOR: u32 = 6;
        if info & 0xff == UD_VECTOR && ARMED.load(Ordering::Acquire) {
            if try_emulate_syscall_or_sysret(regs, active)? {
                return Ok(());
            }
        }
    }
    #[cfg(not(feature = "syscall_hook"))]
    let _ = regs;

    reinject_exception(active)
}

/// Fetch up to `max` guest instruction bytes starting at `rip`, walking the
/// guest's own page tables rather than ever dereferencing the guest virtual
/// address directly (doing that could fault this dispatcher itself).
///
/// Returns the guest virtual address of the first byte that could not be
/// resolved or read, if any.
#[cfg(feature = "syscall_hook")]
fn fetch_guest_bytes(cr3: u64, rip: u64, max: usize) -> Result<[u8; 16], u64> {
    let mut buf = [0u8; 16];
    for (i, slot) in buf.iter_mut().enumerate().take(max.min(16)) {
        let va = rip + i as u64;
        let pa = match walk::translate(cr3, walk::TargetVa::new(va)) {
            Ok(Some(pa)) => pa,
            _ => return Err(va),
        };
        let mut byte = [0u8; 1];
        if unsafe { hal::mem::read_physical(pa, &mut byte) }.is_none() {
            return Err(va);
        }
        *slot = byte[0];
    }
    Ok(buf)
}

#[cfg(feature = "syscall_hook")]
fn inject_pf_for_unreadable(active: &ActiveVmcs, fault_va: u64, cpl: u8) -> Result<(), VmError> {
    const INSTRUCTION_FETCH: u32 = 1 << 4;
    const USER: u32 = 1 << 2;
    let error_code = INSTRUCTION_FETCH | if cpl == 3 { USER } else { 0 };
    unsafe { hal::x86_64::write_cr2(fault_va) };
    inject_exception(active, 14, Some(error_code))
}

#[cfg(feature = "syscall_hook")]
fn flat_code_access(dpl: u32) -> u64 {
    (SegmentAccess::from_bits_truncate(0xB)
        | SegmentAccess::S
        | SegmentAccess::P
        | SegmentAccess::L
        | SegmentAccess::G
        | SegmentAccess::from_bits_truncate((dpl & 0x3) << 5))
    .bits() as u64
}

#[cfg(feature = "syscall_hook")]
fn flat_data_access(dpl: u32) -> u64 {
    (SegmentAccess::from_bits_truncate(0x3)
        | SegmentAccess::S
        | SegmentAccess::P
        | SegmentAccess::D_B
        | SegmentAccess::G
        | SegmentAccess::from_bits_truncate((dpl & 0x3) << 5))
    .bits() as u64
}

#[cfg(feature = "syscall_hook")]
fn emulate_syscall(regs: &mut GeneralPurposeRegisters, active: &ActiveVmcs) -> Result<(), VmError> {
    let rip = active.read(Field::GuestRip)?;
    let insn_len = active.read(Field::VmexitInstructionLength)?;
    let rflags = active.read(Field::GuestRflags)?;

    let star = Msr::<IA32_STAR>::read();
    let fmask = Msr::<IA32_FMASK>::read();
    let lstar = Msr::<IA32_LSTAR>::read();
    let syscall_cs = (star >> 32) & 0xffff;

    regs.rcx = rip + insn_len;
    regs.r11 = rflags;

    active.write(Field::GuestCsSelector, syscall_cs)?;
    active.write(Field::GuestCsBase, 0)?;
    active.write(Field::GuestCsLimit, 0xffff_ffff)?;
    active.write(Field::GuestCsAccessRights, flat_code_access(0))?;

    active.write(Field::GuestSsSelector, syscall_cs + 8)?;
    active.write(Field::GuestSsBase, 0)?;
    active.write(Field::GuestSsLimit, 0xffff_ffff)?;
    active.write(Field::GuestSsAccessRights, flat_data_access(0))?;

    let new_rflags = Rflags::from_bits_truncate(rflags & !fmask);
    active.write(
        Field::GuestRflags,
        (new_rflags - Rflags::RF - Rflags::VM).bits(),
    )?;
    active.write(Field::GuestRip, lstar)
}

#[cfg(feature = "syscall_hook")]
fn emulate_sysret(regs: &mut GeneralPurposeRegisters, active: &ActiveVmcs) -> Result<(), VmError> {
    let star = Msr::<IA32_STAR>::read();
    let sysret_cs = (star >> 48) & 0xffff;

    active.write(Field::GuestCsSelector, (sysret_cs + 16) | 3)?;
    active.write(Field::GuestCsBase, 0)?;
    active.write(Field::GuestCsLimit, 0xffff_ffff)?;
    active.write(Field::GuestCsAccessRights, flat_code_access(3))?;

    active.write(Field::GuestSsSelector, (sysret_cs + 8) | 3)?;
    active.write(Field::GuestSsBase, 0)?;
    active.write(Field::GuestSsLimit, 0xffff_ffff)?;
    active.write(Field::GuestSsAccessRights, flat_data_access(3))?;

    let rflags = Rflags::from_bits_truncate(regs.r11);
    active.write(Field::GuestRflags, (rflags - Rflags::RF - Rflags::VM).bits())?;
    active.write(Field::GuestRip, regs.rcx)
}

/// Decode the instruction at the guest's current RIP and, if it is SYSCALL
/// or SYSRET, emulate it directly instead of letting the real #UD stand.
/// Returns `false` (no state touched) if the decoded instruction is neither,
/// so the caller falls back to re-injecting the original #UD.
#[cfg(feature = "syscall_hook")]
fn try_emulate_syscall_or_sysret(
    regs: &mut GeneralPurposeRegisters,
    active: &ActiveVmcs,
) -> Result<bool, VmError> {
    let rip = active.read(Field::GuestRip)?;
    let cr3 = active.read(Field::GuestCr3)?;
    let cpl = current_cpl(active)?;

    let bytes = match fetch_guest_bytes(cr3, rip, 16) {
        Ok(bytes) => bytes,
        Err(fault_va) => {
            inject_pf_for_unreadable(active, fault_va, cpl)?;
            return Ok(true);
        }
    };

    let mut decoder = Decoder::with_ip(64, &bytes, rip, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Ok(false);
    }

    match insn.mnemonic() {
        Mnemonic::Syscall => {
            emulate_syscall(regs, active)?;
            Ok(true)
        }
        Mnemonic::Sysret | Mnemonic::Sysretq => {
            emulate_sysret(regs, active)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypervisor_leaf_signature_is_twelve_bytes() {
        assert_eq!(VENDOR_SIGNATURE.len(), 12);
    }

    #[test]
    fn magic_cookies_are_distinct() {
        assert_ne!(MAGIC_ECX_DISABLE, MAGIC_ECX_SYSCALL_HOOK);
    }

    #[cfg(feature = "syscall_hook")]
    #[test]
    fn flat_access_rights_mark_present_and_long_mode() {
        let code = flat_code_access(0);
        assert_eq!(code & (1 << 7), 1 << 7, "present bit must be set");
        assert_eq!(code & (1 << 13), 1 << 13, "long-mode bit must be set");
        let data = flat_data_access(3);
        assert_eq!(data & 0x3 << 5, 0x3 << 5, "dpl must carry through");
    }
}
