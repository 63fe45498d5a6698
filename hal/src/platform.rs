//! The `Platform` collaborator: everything this crate needs from the host
//! driver it runs inside, kept behind a trait so `shade` never depends on a
//! concrete OS. Stands in for the host OS driver scaffolding, which is out
//! of scope here.

use crate::mem::ContigPages;

/// Reasons a [`Platform`] call can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    /// The driver's allocator had no contiguous run of the requested size.
    OutOfMemory,
    /// The requested logical processor index does not exist.
    NoSuchCpu,
}

/// Everything `shade-core` needs from its host.
///
/// Implementations are expected to be cheap to call from IRQL/interrupt
/// context for the read-only methods (`cpu_count`, `current_cpu_index`,
/// `apic_id_of`) since the violation handler and dispatcher call them on the
/// hot path; `allocate_contiguous`/`free_contiguous`/`for_each_cpu` are only
/// ever called from passive-level lifecycle operations.
pub trait Platform {
    /// Number of logical processors the driver has brought under our control.
    fn cpu_count(&self) -> usize;

    /// This core's index into `0..cpu_count()`.
    fn current_cpu_index(&self) -> usize;

    /// The local APIC id of logical processor `index`.
    fn apic_id_of(&self, index: usize) -> Result<u32, PlatformError>;

    /// Run `f` on every logical processor the driver controls, in parallel,
    /// and block until every one of them has returned. The callback receives
    /// the running core's index.
    fn for_each_cpu(&self, f: fn(usize));

    /// Allocate a physically contiguous, zeroed, page-aligned span.
    fn allocate_contiguous(&self, pages: usize) -> Result<ContigPages, PlatformError>;

    /// Return a span previously obtained from [`Self::allocate_contiguous`].
    fn free_contiguous(&self, pages: ContigPages);

    /// Write a line of log output (already newline-terminated by the
    /// caller's macro, same convention as a kernel's `DbgPrint`/serial sink).
    fn log_write(&self, line: core::fmt::Arguments<'_>);
}
