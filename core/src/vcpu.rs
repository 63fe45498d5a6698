//! Per-CPU VMX state: the VMXON region, VMCS, MSR bitmap, host stack and
//! captured host context one logical processor needs to enter and leave VMX
//! non-root operation.
//!
//! The "guest" this crate launches is the host OS itself, mid-execution: the
//! whole point of [`launch`] is that, on success, the function that called it
//! simply returns, and its caller carries on completely unaware the CPU is
//! now running virtualized. That illusion needs two tiny hand-written
//! assembly stubs that capture/replay a raw (RIP, RSP, RFLAGS) triple — no
//! higher-level construct can express "make this function appear to return
//! twice". Every VMCS field populated around that illusion is ordinary Rust.

use crate::error::VmError;
use crate::vm_control::*;
use crate::vmcs::{ActiveVmcs, Field, Vmcs};
use core::arch::asm;
use hal::mem::ContigPages;
use hal::platform::Platform;
use hal::x86_64::msr::Msr;
use hal::x86_64::segmentation::{SegmentAccess, SegmentRegister, SegmentSelector};
use hal::x86_64::table::{self, SystemTableRegister};
use hal::x86_64::{read_cr3, read_dr7, Cr0, Cr4};

const HOST_STACK_PAGES: usize = 4; // 16 KiB, per spec.md 3.

/// Compute `(desired | allowed0) & allowed1` from a paired VMX capability
/// MSR, where bits 0..32 are "must-be-1" (allowed0) and bits 32..64 are
/// "may-be-1" (allowed1) (Intel SDM Appendix A.3).
fn adjust(msr_value: u64, desired: u32) -> u32 {
    let allowed0 = msr_value as u32;
    let allowed1 = (msr_value >> 32) as u32;
    (desired | allowed0) & allowed1
}

/// A snapshot of one segment register's selector, base, limit and access
/// rights, captured from the host's own GDT — this crate never builds its
/// own descriptor table.
struct SegmentSnapshot {
    selector: u16,
    base: u64,
    limit: u32,
    access: u32,
}

fn capture_segment(gdtr: SystemTableRegister, reg: SegmentRegister) -> SegmentSnapshot {
    let sel = reg.current();
    if sel.pack() == 0 {
        // Null selector: LDTR commonly isn't loaded. Mark unusable.
        return SegmentSnapshot {
            selector: 0,
            base: 0,
            limit: 0,
            access: SegmentAccess::UNUSABLE.bits(),
        };
    }
    let raw = unsafe { table::read_descriptor(gdtr, sel.index()) };
    let limit_low = raw & 0xffff;
    let limit_high = (raw >> 48) & 0xf;
    let granular = (raw >> 55) & 1 != 0;
    let mut limit = limit_low | (limit_high << 16);
    if granular {
        limit = (limit << 12) | 0xfff;
    }
    let base_low = (raw >> 16) & 0xff_ffff;
    let base_high = (raw >> 56) & 0xff;
    let base = reg
        .msr_base()
        .unwrap_or(base_low | (base_high << 24));
    SegmentSnapshot {
        selector: sel.pack(),
        base,
        limit: limit as u32,
        access: SegmentAccess::from_descriptor(raw).bits(),
    }
}

/// TR is a 16-byte system descriptor in long mode; its base needs the high
/// qword too.
fn capture_tr(gdtr: SystemTableRegister) -> SegmentSnapshot {
    let sel = SegmentRegister::Tr.current();
    let low = unsafe { table::read_descriptor(gdtr, sel.index()) };
    let high = unsafe { table::read_descriptor(gdtr, sel.index() + 1) };
    let limit_low = low & 0xffff;
    let limit_high = (low >> 48) & 0xf;
    let base_low = ((low >> 16) & 0xff_ffff) | (((low >> 56) & 0xff) << 24);
    let base = base_low | (high << 32);
    SegmentSnapshot {
        selector: sel.pack(),
        base,
        limit: (limit_low | (limit_high << 16)) as u32,
        access: SegmentAccess::from_descriptor(low).bits(),
    }
}

/// Everything about the host's own context at the moment [`launch`] is
/// called, needed both for the VMCS host-state area (so a later VM-exit
/// returns to sane host state) and the guest-state area (the guest starts
/// out identical to the host that's launching it).
struct CapturedContext {
    cr0: u64,
    cr3: u64,
    cr4: u64,
    dr7: u64,
    gdtr: SystemTableRegister,
    idtr: SystemTableRegister,
    es: SegmentSnapshot,
    cs: SegmentSnapshot,
    ss: SegmentSnapshot,
    ds: SegmentSnapshot,
    fs: SegmentSnapshot,
    gs: SegmentSnapshot,
    ldtr: SegmentSnapshot,
    tr: SegmentSnapshot,
}

impl CapturedContext {
    fn capture() -> Self {
        let gdtr = table::sgdt();
        let idtr = table::sidt();
        Self {
            cr0: Cr0::current().bits(),
            cr3: read_cr3(),
            cr4: Cr4::current().bits(),
            dr7: read_dr7(),
            gdtr,
            idtr,
            es: capture_segment(gdtr, SegmentRegister::Es),
            cs: capture_segment(gdtr, SegmentRegister::Cs),
            ss: capture_segment(gdtr, SegmentRegister::Ss),
            ds: capture_segment(gdtr, SegmentRegister::Ds),
            fs: capture_segment(gdtr, SegmentRegister::Fs),
            gs: capture_segment(gdtr, SegmentRegister::Gs),
            ldtr: capture_segment(gdtr, SegmentRegister::Ldtr),
            tr: capture_tr(gdtr),
        }
    }
}

/// One logical processor's VMX resources. Allocated once, during
/// [`crate::vm::Hypervisor::enable`], and kept for the lifetime of the
/// hypervisor.
pub struct PerCpuState {
    vmxon: Vmcs,
    vmcs: Vmcs,
    msr_bitmap: ContigPages,
    host_stack: ContigPages,
    /// `true` once this CPU has successfully VMLAUNCHed; guards against
    /// re-running the launch sequence when the guest "returns" to the same
    /// program point a second time (see [`launch`]).
    launched: bool,
    /// (rip, rsp, rflags) captured right before the first VMLAUNCH, reused
    /// verbatim by [`teardown_return`] to resume non-virtualized execution
    /// at the same point on `disable()`.
    recorded_return: [u64; 3],
}

impl PerCpuState {
    /// Allocate (but do not yet activate) this CPU's VMX resources.
    pub fn new(platform: &dyn Platform) -> Result<Self, VmError> {
        let msr_bitmap = platform
            .allocate_contiguous(1)
            .map_err(|_| VmError::AllocationFailed)?;
        let host_stack = platform
            .allocate_contiguous(HOST_STACK_PAGES)
            .map_err(|_| VmError::AllocationFailed)?;
        Ok(Self {
            vmxon: Vmcs::new(),
            vmcs: Vmcs::new(),
            msr_bitmap,
            host_stack,
            launched: false,
            recorded_return: [0; 3],
        })
    }

    fn host_stack_top(&self) -> u64 {
        (unsafe { self.host_stack.va().into_usize() } + self.host_stack.bytes()) as u64
    }
}

/// Capture "what my own return point looks like" into `*out` as `[rip, rsp,
/// rflags]`, then return completely normally. Used once per launch so the
/// guest's initial RIP/RSP/RFLAGS can be set to the exact point execution
/// should resume at once the CPU is virtualized.
#[naked]
unsafe extern "C" fn capture_return_point(_out: *mut [u64; 3]) {
    asm!(
        "mov rax, [rsp]",
        "mov [rdi], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 8], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 16], rax",
        "ret",
        options(noreturn)
    )
}

/// Execute VMLAUNCH. Every guest-state VMCS field, including GuestRip/
/// GuestRsp/GuestRflags, must already be written. On success this does not
/// return: the CPU loads guest state and jumps directly to the captured RIP.
/// On failure, falls through with CF/ZF set and returns -1.
#[naked]
unsafe extern "C" fn enter_non_root() -> i32 {
    asm!("vmlaunch", "mov eax, -1", "ret", options(noreturn))
}

/// Reverse the illusion: VMXOFF, then jump to `rip` with `rsp`/`rflags`
/// restored. Never returns.
///
/// Used by [`crate::vmexits::dispatch_from_exit`] to unwind a graceful
/// disable: `rip`/`rsp`/`rflags` there are the *current* guest state read
/// back out of the VMCS at the moment of the disabling VM-exit (RIP already
/// advanced past the triggering instruction), not the point
/// [`capture_return_point`] recorded at launch — by the time disable() runs,
/// the guest (this same core, having run unmodified host code all along)
/// has long since moved past that point, and its current architectural
/// state is exactly what VMX non-root operation has been maintaining.
///
/// # Safety
/// Must run with a current, launched VMCS and in VMX root operation; `rip`/
/// `rsp` must be a canonical address/valid stack pointer this core can
/// resume at.
pub unsafe fn teardown_return(rip: u64, rsp: u64, rflags: u64) -> ! {
    asm!(
        "vmxoff",
        "mov rsp, {rsp}",
        "push {rflags}",
        "popfq",
        "jmp {rip}",
        rsp = in(reg) rsp,
        rflags = in(reg) rflags,
        rip = in(reg) rip,
        options(noreturn)
    )
}

/// The host-side VM-exit entry point: the address written into the VMCS
/// `HostRip` field. Hardware vectors here directly on every VM-exit; this is
/// never "called" by Rust. Saves the guest's general-purpose registers onto
/// this core's host stack (which doubles as the `GeneralPurposeRegisters`
/// buffer — the layout matches [`hal::interrupt::GeneralPurposeRegisters`]
/// exactly), identifies which CPU this is via CPUID, and calls
/// [`crate::vmexits::dispatch_from_exit`]. A `0` result means resume the
/// guest; the dispatcher never returns for a teardown (it diverges through
/// [`teardown_return`] instead).
#[naked]
#[no_mangle]
unsafe extern "C" fn vm_exit_entry() -> ! {
    asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "mov eax, 1",
        "cpuid",
        "shr ebx, 24",
        "and ebx, 63",
        "mov esi, ebx",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "vmresume",
        // VMRESUME itself failing means the VMCS is corrupt; there is no
        // sane Rust-level recovery from inside a hardware-vectored stub.
        "cli",
        "2:",
        "hlt",
        "jmp 2b",
        dispatch = sym crate::vmexits::dispatch_from_exit,
        options(noreturn)
    )
}

/// Set up this CPU's control/host-state VMCS fields (spec.md §4.F steps
/// 1-6, minus the final launch), using `state`'s captured context for every
/// guest-state field as well (the guest starts out identical to the host).
unsafe fn populate_vmcs(
    active: &ActiveVmcs,
    state: &PerCpuState,
    eptp: u64,
    exception_bitmap: u32,
) -> Result<(), VmError> {
    let ctx = CapturedContext::capture();

    {
        let pinbased = adjust(
            Msr::<IA32_VMX_PINBASED_CTLS>::read(),
            (VmcsPinBasedVmexecCtl::NMI_EXITING).bits(),
        );
        active.write(Field::PinBasedExecControls, pinbased as u64)?;

        let procbased_msr = Msr::<IA32_VMX_PROC_BASED_CTLS>::read();
        let procbased = adjust(
            procbased_msr,
            (VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL
                | VmcsProcBasedVmexecCtl::USEMSRBMP)
                .bits(),
        );
        assert!(
            VmcsProcBasedVmexecCtl::from_bits_truncate((procbased_msr >> 32) as u32)
                .contains(VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL),
            "CPU does not support secondary processor-based controls"
        );
        active.write(Field::ProcessorBasedVmexecControls, procbased as u64)?;

        let secondary = adjust(
            Msr::<IA32_VMX_PROC_BASED_CTLS2>::read(),
            (VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
                | VmcsProcBasedSecondaryVmexecCtl::EANBLE_VPID
                | VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP
                | VmcsProcBasedSecondaryVmexecCtl::ENABLE_INVPCID
                | VmcsProcBasedSecondaryVmexecCtl::ENABLE_XSAVES_XRSTORS)
                .bits(),
        );
        active.write(Field::SecondaryVmexecControls, secondary as u64)?;

        let exit_ctls = adjust(
            Msr::<IA32_VMX_EXIT_CTLS>::read(),
            VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE.bits(),
        );
        active.write(Field::VmexitControls, exit_ctls as u64)?;

        let entry_ctls = adjust(
            Msr::<IA32_VMX_ENTRY_CTLS>::read(),
            VmcsEntryCtl::IA32E_MODE_GUEST.bits(),
        );
        active.write(Field::VmentryControls, entry_ctls as u64)?;

        active.write(Field::ExceptionBitmap, exception_bitmap as u64)?;
        active.write(Field::Vpid, 1)?;
        active.write(
            Field::MsrBitmaps,
            unsafe { state.msr_bitmap.pa().into_usize() } as u64,
        )?;
        active.write(Field::Eptptr, eptp)?;
    }

    // Host state: what a later VM-exit restores.
    {
        active.write(Field::HostCr0, ctx.cr0)?;
        active.write(Field::HostCr3, ctx.cr3)?;
        active.write(Field::HostCr4, ctx.cr4)?;
        active.write(Field::HostEsSelector, (ctx.es.selector & !0x7) as u64)?;
        active.write(Field::HostCsSelector, (ctx.cs.selector & !0x7) as u64)?;
        active.write(Field::HostSsSelector, (ctx.ss.selector & !0x7) as u64)?;
        active.write(Field::HostDsSelector, (ctx.ds.selector & !0x7) as u64)?;
        active.write(Field::HostFsSelector, (ctx.fs.selector & !0x7) as u64)?;
        active.write(Field::HostGsSelector, (ctx.gs.selector & !0x7) as u64)?;
        active.write(Field::HostTrSelector, (ctx.tr.selector & !0x7) as u64)?;
        active.write(Field::HostFsBase, ctx.fs.base)?;
        active.write(Field::HostGsBase, ctx.gs.base)?;
        active.write(Field::HostTrBase, ctx.tr.base)?;
        active.write(Field::HostGdtrBase, ctx.gdtr.base)?;
        active.write(Field::HostIdtrBase, ctx.idtr.base)?;
        active.write(Field::HostRsp, state.host_stack_top())?;
        active.write(Field::HostRip, vm_exit_entry as *const () as u64)?;
    }

    // Guest state: identical to the host at the moment of capture, except
    // RIP/RSP/RFLAGS which `launch` fills in right before VMLAUNCH.
    {
        let write_segment = |sel_field: Field,
                              base_field: Field,
                              limit_field: Field,
                              rights_field: Field,
                              seg: &SegmentSnapshot| {
            active.write(sel_field, seg.selector as u64)?;
            active.write(base_field, seg.base)?;
            active.write(limit_field, seg.limit as u64)?;
            active.write(rights_field, seg.access as u64)
        };
        write_segment(
            Field::GuestEsSelector,
            Field::GuestEsBase,
            Field::GuestEsLimit,
            Field::GuestEsAccessRights,
            &ctx.es,
        )?;
        write_segment(
            Field::GuestCsSelector,
            Field::GuestCsBase,
            Field::GuestCsLimit,
            Field::GuestCsAccessRights,
            &ctx.cs,
        )?;
        write_segment(
            Field::GuestSsSelector,
            Field::GuestSsBase,
            Field::GuestSsLimit,
            Field::GuestSsAccessRights,
            &ctx.ss,
        )?;
        write_segment(
            Field::GuestDsSelector,
            Field::GuestDsBase,
            Field::GuestDsLimit,
            Field::GuestDsAccessRights,
            &ctx.ds,
        )?;
        write_segment(
            Field::GuestFsSelector,
            Field::GuestFsBase,
            Field::GuestFsLimit,
            Field::GuestFsAccessRights,
            &ctx.fs,
        )?;
        write_segment(
            Field::GuestGsSelector,
            Field::GuestGsBase,
            Field::GuestGsLimit,
            Field::GuestGsAccessRights,
            &ctx.gs,
        )?;
        write_segment(
            Field::GuestLdtrSelector,
            Field::GuestLdtrBase,
            Field::GuestLdtrLimit,
            Field::GuestLdtrAccessRights,
            &ctx.ldtr,
        )?;
        write_segment(
            Field::GuestTrSelector,
            Field::GuestTrBase,
            Field::GuestTrLimit,
            Field::GuestTrAccessRights,
            &ctx.tr,
        )?;
        active.write(Field::GuestGdtrBase, ctx.gdtr.base)?;
        active.write(Field::GuestGdtrLimit, ctx.gdtr.limit as u64)?;
        active.write(Field::GuestIdtrBase, ctx.idtr.base)?;
        active.write(Field::GuestIdtrLimit, ctx.idtr.limit as u64)?;
        active.write(Field::GuestCr0, ctx.cr0)?;
        active.write(Field::GuestCr3, ctx.cr3)?;
        active.write(Field::GuestCr4, ctx.cr4)?;
        active.write(Field::GuestDr7, ctx.dr7)?;
        active.write(Field::GuestIa32SysenterCsMsr, 0)?;
        active.write(Field::GuestActivityState, 0)?;
        active.write(Field::GuestInterruptibilityState, 0)?;
        active.write(Field::GuestPendingDbgExceptions, 0)?;
        active.write(Field::VmcsLinkPointer(), u64::MAX)?;
    }

    Ok(())
}

impl Field {
    /// The VMCS link pointer must be all-ones when shadow VMCS is unused
    /// (Intel SDM §24.4.2); kept as a method rather than an enum variant
    /// since the field's own encoding (`GuestLinkPointer`) already exists.
    #[allow(non_snake_case)]
    fn VmcsLinkPointer() -> Field {
        Field::GuestLinkPointer
    }
}

/// Bring this logical processor into VMX root operation and launch the
/// guest (= this same core, continuing to run). On success, returns
/// normally — to the *caller of this function* — having, from the guest's
/// perspective, never left. On failure, the core is left outside VMX
/// operation and an error is returned.
///
/// # Safety
/// Must run once per CPU, with interrupts disabled, and `state` must not
/// already be launched.
pub unsafe fn launch(
    state: &mut PerCpuState,
    eptp: u64,
    exception_bitmap: u32,
) -> Result<(), VmError> {
    let vmx_basic = Msr::<IA32_VMX_BASIC>::read();
    let _ = vmx_basic;

    let cr0_fixed0 = Msr::<IA32_VMX_CR0_FIXED0>::read();
    let cr0_fixed1 = Msr::<IA32_VMX_CR0_FIXED1>::read();
    let cr4_fixed0 = Msr::<IA32_VMX_CR4_FIXED0>::read();
    let cr4_fixed1 = Msr::<IA32_VMX_CR4_FIXED1>::read();
    Cr0::from_bits_unchecked((Cr0::current().bits() | cr0_fixed0) & cr0_fixed1).apply();
    Cr4::from_bits_unchecked((Cr4::current().bits() | cr4_fixed0) & cr4_fixed1).apply();

    state.vmxon.on().map_err(VmError::VmxOperationError)?;
    state.vmcs.clear()?;
    let active = Vmcs::activate(&mut state.vmcs as *mut Vmcs)?;

    populate_vmcs(&active, state, eptp, exception_bitmap)?;

    let mut pt = [0u64; 3];
    capture_return_point(&mut pt as *mut [u64; 3]);

    // Reached twice: once normally (below, `launched` still false), and
    // once more as the just-virtualized guest, landing exactly here because
    // GuestRip was set to this same address. The second time, `launched` is
    // already true and we return immediately without re-arming anything.
    if state.launched {
        return Ok(());
    }
    state.launched = true;
    state.recorded_return = pt;

    active.write(Field::GuestRip, pt[0])?;
    active.write(Field::GuestRsp, pt[1])?;
    active.write(Field::GuestRflags, pt[2])?;

    // VMLAUNCH either never returns here (success: hardware jumps straight
    // to GuestRip, re-entering above as the guest) or falls through with
    // CF/ZF set (failure). There is no successful value to match on.
    let _ = enter_non_root();
    let err = Vmcs::instruction_error();
    let _ = state.vmcs.clear();
    hal::x86_64::vmx::vmxoff();
    state.launched = false;
    Err(VmError::LaunchFailed(err))
}

/// Request this CPU's teardown from outside the VM-exit path (used by
/// `disable()` to know what to replay once the magic-CPUID dispatch tells
/// the guest to exit). Exposed so `vm.rs` can read the recorded triple when
/// building its own bookkeeping; the actual jump always happens inside
/// [`crate::vmexits::dispatch_from_exit`].
pub fn recorded_return(state: &PerCpuState) -> [u64; 3] {
    state.recorded_return
}

/// Mark `state` as no longer launched after a graceful VMXOFF teardown
/// driven from the VM-exit dispatcher (the magic-CPUID disable path), as
/// opposed to a failed VMLAUNCH, which already resets this flag itself.
/// Caller must only call this once VMXOFF has actually executed on this
/// core, or a later [`launch`] on the same `state` will wrongly short-circuit
/// on the strength of a launch that is no longer in effect.
pub fn mark_torn_down(state: &mut PerCpuState) {
    state.launched = false;
}
