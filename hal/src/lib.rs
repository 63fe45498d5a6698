//! Hardware primitives for the shade hypervisor core.
//!
//! This crate contains the thin, `unsafe`-heavy layer that actually touches
//! the processor: CPUID, MSRs, control registers, the VMX instruction set,
//! and the handful of descriptor-table reads needed to capture the host's
//! existing GDT/IDT/TR/LDTR. Everything above this layer (EPT, hook
//! registry, VM-exit dispatch) lives in `shade-core` and never issues raw
//! `asm!` itself.
//!
//! Treat this crate as the boundary of the unsafe surface: if a new
//! instruction is needed, it gets a wrapper here, not inline in `core`.

#![cfg_attr(not(test), no_std)]
#![feature(asm_const, naked_functions)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod apic;
pub mod interrupt;
pub mod mem;
pub mod platform;
pub mod x86_64;

/// Maximum number of logical processors a single [`platform::Platform`] may expose.
pub const MAX_CPU: usize = 64;
