//! Hypervisor logging (`klog`).
//!
//! Profile-aware logging macros shared by every hypervisor crate. The crate
//! has no knowledge of where text ends up: the embedding hypervisor installs
//! a sink with [`set_sink`] once its console is up. Until then every message
//! is dropped.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_domain!`] | Active | Yes | Guest-scoped messages (`d<dom>v<vcpu>: ...`) |
//! | [`klog_force!`] | Active | No | Pre-panic diagnostics |
//!
//! # Hardening Profile Integration
//!
//! The minimum level is picked at runtime from the active profile:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.
//! Guest-controlled values (frame numbers, linear addresses) may be logged;
//! hypervisor addresses must not be.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::RwLock;

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness or guest isolation.
    Error = 4,
}

impl Level {
    /// Short tag printed in front of every message.
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Messages with `level >= LOG_MIN_LEVEL` are emitted.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Output function installed by the embedding hypervisor.
static SINK: RwLock<Option<fn(fmt::Arguments)>> = RwLock::new(None);

/// Hardening profiles understood by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// No klog output.
    Secure = 0,
    /// Errors and warnings only.
    Balanced = 1,
    /// All levels.
    Performance = 2,
}

/// Set the filter from a profile. Safe to call again at runtime.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
}

/// Disable all filtered output. [`klog_force!`] is unaffected.
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Install the output sink. Replaces any previous sink.
pub fn set_sink(sink: fn(fmt::Arguments)) {
    *SINK.write() = Some(sink);
}

/// Remove the output sink; subsequent output is dropped.
pub fn clear_sink() {
    *SINK.write() = None;
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline]
pub fn _klog_print(args: fmt::Arguments) {
    if let Some(sink) = *SINK.read() {
        sink(args);
    }
}

/// Unconditional output, never filtered by profile.
///
/// Reserved for messages that immediately precede a panic or a guest
/// crash, where losing the line would lose the only diagnostic.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Profile-aware logging.
///
/// `Debug` and `Trace` are additionally compiled out in release builds.
///
/// ```ignore
/// klog!(Warn, "view {}: stored access tag {} out of range", idx, tag);
/// klog!(Debug, "batch preempted at {}", start);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {
        $crate::__klog_at!($crate::Level::Error, $($arg)+)
    };
    (Warn, $($arg:tt)+) => {
        $crate::__klog_at!($crate::Level::Warn, $($arg)+)
    };
    (Info, $($arg:tt)+) => {
        $crate::__klog_at!($crate::Level::Info, $($arg)+)
    };
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::__klog_at!($crate::Level::Debug, $($arg)+);
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::__klog_at!($crate::Level::Trace, $($arg)+);
    }};
}

/// Guest-scoped logging: prefixes the message with `d<domain>v<vcpu>:`.
///
/// ```ignore
/// klog_domain!(Warn, d.id(), v.id(), "no listener for access fault");
/// ```
#[macro_export]
macro_rules! klog_domain {
    ($level:ident, $dom:expr, $vcpu:expr, $($arg:tt)+) => {
        $crate::klog!($level, "d{}v{}: {}", $dom, $vcpu, format_args!($($arg)+))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog_at {
    ($level:expr, $($arg:tt)+) => {{
        let level: $crate::Level = $level;
        if $crate::enabled(level) {
            $crate::_klog_print(format_args!("[{}] {}\n", level.tag(), format_args!($($arg)+)));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::vec::Vec;

    static CAPTURED: spin::Mutex<Vec<String>> = spin::Mutex::new(Vec::new());

    fn capture(args: fmt::Arguments) {
        CAPTURED.lock().push(std::format!("{}", args));
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error > Level::Warn);
        assert!(Level::Warn > Level::Info);
        assert!(Level::Debug > Level::Trace);
    }

    // Profile and sink are process-global, so the whole sequence lives in
    // one test.
    #[test]
    fn test_profile_filter_and_sink() {
        klog!(Error, "dropped before sink");
        set_sink(capture);

        set_profile(KlogProfile::Secure);
        klog!(Error, "secure error");
        klog_force!("forced {}", 1);

        set_profile(KlogProfile::Balanced);
        klog!(Info, "balanced info");
        klog!(Warn, "balanced warn");
        klog_domain!(Error, 3, 1, "guest {}", "crash");

        set_profile(KlogProfile::Performance);
        klog!(Info, "perf info");
        klog_domain!(Debug, 2, 0, "emulating page-walk fault at gfn {:#x}", 0x42);

        disable();
        klog!(Error, "disabled");
        clear_sink();
        klog_force!("after clear");

        let mut want = std::vec![
            "forced 1\n",
            "[WARN] balanced warn\n",
            "[ERROR] d3v1: guest crash\n",
            "[INFO] perf info\n",
        ];
        if cfg!(debug_assertions) {
            want.push("[DEBUG] d2v0: emulating page-walk fault at gfn 0x42\n");
        }
        assert_eq!(*CAPTURED.lock(), want);
    }
}
