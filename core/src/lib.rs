//! `shade`: an EPT-hook type-1 hypervisor core.
//!
//! This crate implements the part of a stealthy page-granularity memory-hook
//! hypervisor that sits above [`hal`] (`shade-hal`): the EPT paging tree, the
//! hook/watchpoint registry, the EPT-violation decision table, per-CPU VMX
//! lifecycle management, and the VM-exit dispatcher. Everything below this
//! layer — raw VMX/CPUID/MSR instructions, physical memory, cross-core
//! dispatch — lives in `hal` and is consumed here through its safe(r)
//! wrappers and the [`hal::platform::Platform`] trait.
//!
//! The "guest" in this design is the host OS itself, continuing to run
//! unmodified in VMX non-root operation; there is no nested guest kernel, no
//! device emulation, and no paravirtualization. The only thing this crate
//! virtualizes is the view of memory a hooked or watched physical page
//! presents to its own host.
//!
//! Module map:
//! - [`error`] — the one fallible-path error type, [`error::VmError`].
//! - [`mtrr`] — host MTRR snapshot, used to pick EPT leaf memory types.
//! - [`ept`] — the EPT paging tree and the split-view permission protocol.
//! - [`walk`] — a plain 4-level page walk for a *target process's* own
//!   address space, unrelated to EPT.
//! - [`hook`] — the hook/watchpoint registry and access ring.
//! - [`violation`] — the EPT-violation decision table.
//! - [`vm_control`] — VMCS control-field bit layouts (Intel SDM format).
//! - [`vmcs`] — the VMCS type, field enum, and exit-reason parsing.
//! - [`vcpu`] — per-CPU VMX state, VMCS setup, and VMLAUNCH/VMRESUME.
//! - [`vmexits`] — the VM-exit dispatcher.
//! - [`vm`] — the [`vm::Hypervisor`] lifecycle controller tying everything
//!   together.

#![cfg_attr(not(test), no_std)]
#![feature(asm_const, naked_functions)]

extern crate alloc;

pub mod error;
pub mod mtrr;
pub mod ept;
pub mod walk;
pub mod hook;
pub mod violation;
pub mod vm_control;
pub mod vmcs;
pub mod vcpu;
pub mod vmexits;
pub mod vm;

pub use error::VmError;

