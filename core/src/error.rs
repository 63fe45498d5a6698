//! The one error type every fallible path in this crate returns.
//!
//! Nothing unwinds across the VM-exit boundary: every dispatcher path either
//! resumes the guest or tears the CPU out of VMX root, translating every
//! variant here into one of those two outcomes. Outside the exit path (install/
//! remove/enable/disable) errors are simply returned to the caller.

use crate::vmcs::InstructionError;
use alloc::boxed::Box;
use alloc::string::String;

/// Failure modes surfaced by the hypervisor core.
#[derive(Debug)]
pub enum VmError {
    /// VMX, EPT-with-2MB-pages, or VPID is not present on this CPU. Only
    /// surfaced at `enable()`.
    HardwareUnsupported(&'static str),
    /// `VMLAUNCH`/`VMRESUME` failed; `VMXOFF` has already been executed and
    /// this CPU's state has been torn down.
    LaunchFailed(InstructionError),
    /// A VMX instruction (VMPTRLD/VMCLEAR/VMWRITE/...) reported failure.
    VmxOperationError(InstructionError),
    /// Contiguous physical allocation failed.
    AllocationFailed,
    /// A virtual address did not resolve to a physical frame in the address
    /// space it was looked up against.
    AddressTranslationFailed,
    /// Request is malformed: a hook crossing a page boundary, an out-of-range
    /// physical address, removal of an unknown `HookId`.
    InvalidRequest(&'static str),
    /// The target process terminated while an operation was in flight.
    ProcessGone,
    /// An EPT misconfiguration VM-exit occurred; fatal for the running guest.
    Fatal(Box<str>),
    /// The exit-reason dispatcher had no handler registered for this reason.
    HandleVmexitFailed(crate::vmcs::ExitReason),
    /// The guest instruction at RIP could not be decoded.
    FailedToDecodeInstruction,
    /// Free-form failure from a `Platform`/`TargetProcess` collaborator.
    ControllerError(Box<str>),
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::HardwareUnsupported(why) => write!(f, "hardware unsupported: {why}"),
            Self::LaunchFailed(e) => write!(f, "vmlaunch/vmresume failed: {e:?}"),
            Self::VmxOperationError(e) => write!(f, "vmx instruction failed: {e:?}"),
            Self::AllocationFailed => write!(f, "contiguous allocation failed"),
            Self::AddressTranslationFailed => write!(f, "address translation failed"),
            Self::InvalidRequest(why) => write!(f, "invalid request: {why}"),
            Self::ProcessGone => write!(f, "target process terminated"),
            Self::Fatal(why) => write!(f, "fatal guest misconfiguration: {why}"),
            Self::HandleVmexitFailed(reason) => write!(f, "unhandled vmexit: {reason:?}"),
            Self::FailedToDecodeInstruction => write!(f, "failed to decode guest instruction"),
            Self::ControllerError(why) => write!(f, "{why}"),
        }
    }
}

impl From<String> for VmError {
    fn from(s: String) -> Self {
        Self::ControllerError(s.into_boxed_str())
    }
}
