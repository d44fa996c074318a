// Licensed under the Apache-2.0 license

//! Logging hooks shared by the device layer and the protocol drivers.

use core::fmt::{self, Write};

/// Capacity of one formatted log line. Longer messages are truncated.
pub const LOG_LINE_CAPACITY: usize = 96;

/// Fixed-capacity line used to render formatted log messages without an allocator.
pub type LogLine = heapless::String<LOG_LINE_CAPACITY>;

/// Sink for driver diagnostics.
///
/// Drivers call into the logger from both foreground and interrupt context,
/// so implementations must not block.
pub trait Logger {
    fn debug(&self, msg: &str);
    fn error(&self, msg: &str);

    fn debug_fmt(&self, args: fmt::Arguments<'_>) {
        self.debug(&format_line(args));
    }

    fn error_fmt(&self, args: fmt::Arguments<'_>) {
        self.error(&format_line(args));
    }
}

/// Render `args` into a [`LogLine`], dropping whatever does not fit.
#[must_use]
pub fn format_line(args: fmt::Arguments<'_>) -> LogLine {
    let mut line = LogLine::new();
    let _ = line.write_fmt(args);
    line
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn debug(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}

/// Logger that prints to stderr, for host builds.
#[cfg(any(test, feature = "std"))]
#[derive(Clone, Copy, Debug, Default)]
pub struct StdLogger;

#[cfg(any(test, feature = "std"))]
impl Logger for StdLogger {
    fn debug(&self, msg: &str) {
        std::eprintln!("[eio] {msg}");
    }

    fn error(&self, msg: &str) {
        std::eprintln!("[eio] error: {msg}");
    }
}
