//! Thin facade over `slog`. Library components take an optional parent
//! `Logger` at construction and fall back to a `Discard` root, so logging
//! never becomes a hard requirement of the API.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds a terminal logger writing to stderr. Intended for binaries and
/// test harnesses; libraries should accept a parent `Logger` instead.
pub fn terminal(level: Severity) -> Logger {
    TerminalLoggerBuilder::new()
        .level(level)
        .destination(Destination::Stderr)
        .build()
        .expect("Error building terminal logger")
}

/// Resolves an optional parent logger into a usable child logger.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
