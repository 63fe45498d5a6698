//! Logging macros.
//!
//! A handful of `format_args!`-based macros behind one lock, forwarding to
//! whatever logging facility the host driver installs. No buffering, no
//! filtering beyond a debug/release split: the sink here is the host
//! driver's own console or event log, not one this crate owns.

use crate::platform::Platform;
use spin_lock::SpinLock;

struct Sink(Option<&'static dyn Platform>);

// SAFETY: the sink only ever holds a `&'static dyn Platform`, and `Platform`
// implementations are documented to be safe to call from any core.
unsafe impl Send for Sink {}

static SINK: SpinLock<Sink> = SpinLock::new(Sink(None));

/// Install the platform log sink. Call once, before `enable()`.
pub fn set_platform(platform: &'static dyn Platform) {
    SINK.lock().0 = Some(platform);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    if let Some(platform) = SINK.lock().0 {
        platform.log_write(fmt);
    }
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!("[shade] {}\n", format_args!($($arg)*))));
}

/// Display a warning message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!("[shade][warn] {}\n", format_args!($($arg)*))));
}

/// Print msg if debug build.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::kprint::_print(format_args!("[shade][debug] {}\n", format_args!($($arg)*)))
        }
    }
}
