//! Interrupt state and the general-purpose register layout captured across
//! a VM-exit.

use crate::x86_64::Rflags;
use core::arch::asm;

/// Enumeration for representing interrupt state.
#[derive(PartialEq, Eq, Debug)]
pub enum InterruptState {
    On,
    Off,
}

impl InterruptState {
    /// Read the current interrupt state.
    pub fn current() -> Self {
        if Rflags::read().contains(Rflags::IF) {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// An RAII implementation of an interrupt disable. When this structure is
/// dropped, the interrupt state is restored to what it was on creation.
/// Must be dropped in the reverse of creation order.
pub struct InterruptGuard {
    state: InterruptState,
}

impl InterruptGuard {
    /// Disable interrupts, remembering whether they were enabled.
    pub fn new() -> Self {
        let state = InterruptState::current();
        unsafe { asm!("cli") };
        Self { state }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.state == InterruptState::On {
            unsafe { asm!("sti") };
        }
    }
}

/// X86_64 general purpose registers, in the order the VM-exit entry
/// trampoline pushes/restores them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneralPurposeRegisters {
    // callee-preserved.
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}
