// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Capture sink exercised by quiesce/handoff tests
//! PUBLIC API: log_* macros, emit(level,target,args), emit_raw(level,target,args), install_sink()
//! DEPENDS_ON: uart::KernelUart (bare metal), spin::Mutex
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; emit_raw never blocks

use core::fmt::{Arguments, Write};

use spin::Mutex;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Destination for log lines other than the boot UART.
pub trait LogSink: Sync {
    /// Receives one fully formatted record.
    fn write_line(&self, level: Level, target: &str, args: Arguments<'_>);
}

static SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);

/// Routes all subsequent records to `sink` instead of the UART.
pub fn install_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }

    let sink = *SINK.lock();
    match sink {
        Some(sink) => sink.write_line(level, target, args),
        None => uart_line(level, target, args),
    }
}

/// Lock-free emission for the committed part of a handoff.
///
/// Secondary units may have been stopped while holding the sink or UART lock,
/// so this path only ever tries the sink lock and writes the UART directly.
pub fn emit_raw(level: Level, target: &'static str, args: Arguments<'_>) {
    if let Some(guard) = SINK.try_lock() {
        if let Some(sink) = *guard {
            sink.write_line(level, target, args);
            return;
        }
    }
    let mut writer = crate::uart::raw_writer();
    let _ = write!(writer, "[{} {}] ", level.tag(), target);
    let _ = writer.write_fmt(args);
    let _ = writer.write_char('\n');
}

fn uart_line(level: Level, target: &'static str, args: Arguments<'_>) {
    let mut uart = crate::uart::KernelUart::lock();
    let writer = &mut *uart;
    let _ = write!(writer, "[{} {}] ", level.tag(), target);
    let _ = writer.write_fmt(args);
    let _ = writer.write_char('\n');
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

/// Raw variant used once the handoff is committed; see [`emit_raw`].
#[macro_export]
macro_rules! log_emerg {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit_raw($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
}

/// In-memory sink shared by the unit tests of this crate.
#[cfg(test)]
pub mod capture {
    use super::{install_sink, Level, LogSink};
    use core::fmt::Arguments;
    use spin::{Mutex, Once};
    use std::string::String;
    use std::vec::Vec;

    struct Capture {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for Capture {
        fn write_line(&self, level: Level, target: &str, args: Arguments<'_>) {
            self.lines.lock().push(std::format!("[{} {}] {}", level.tag(), target, args));
        }
    }

    static CAPTURE: Once<&'static Capture> = Once::new();

    fn get() -> &'static Capture {
        CAPTURE.call_once(|| {
            let capture: &'static Capture =
                std::boxed::Box::leak(std::boxed::Box::new(Capture { lines: Mutex::new(Vec::new()) }));
            install_sink(capture);
            capture
        })
    }

    /// Installs the capture sink (idempotent).
    pub fn install() {
        let _ = get();
    }

    /// Returns true if any captured line contains `needle`.
    pub fn contains(needle: &str) -> bool {
        get().lines.lock().iter().any(|line| line.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reach_installed_sink() {
        capture::install();
        log_warn!(target: "log-test", "value={}", 7);
        assert!(capture::contains("[WARN log-test] value=7"));
    }

    #[test]
    fn raw_records_reach_installed_sink() {
        capture::install();
        log_emerg!(target: "log-test", "raw {}", "path");
        assert!(capture::contains("[ERROR log-test] raw path"));
    }
}
