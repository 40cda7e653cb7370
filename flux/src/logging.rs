//! Thin wrapper around `slog`/`sloggers` so every binary and library crate
//! builds its loggers the same way instead of reaching for `println!`.

pub use slog::{self, debug, error, info, o, trace, warn, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root logger for a process. `verbose` selects `Debug` over
/// `Info` severity; everything downstream derives child loggers from this
/// with `log.new(o!(...))` rather than reading a global.
pub fn init(verbose: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);
    builder.level(if verbose { Severity::Debug } else { Severity::Info });
    builder.build().expect("failed to initialize terminal logger")
}

/// A logger that discards everything, for tests and library defaults.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
