//! `cprintf` and the `log`-crate wiring that backs it.
//!
//! `cprintf` is an external interface the core
//! only *consumes*; this module gives it a concrete body (writing to the
//! serial console, spinlock-serialized so concurrent callers don't
//! interleave) the same way `fsiface`/`lapic` give bodies to the other
//! named externals, so the crate is runnable standalone. Diagnostic
//! tracing that isn't part of the named `cprintf` interface goes through
//! the ordinary `log` crate macros instead, backed by [`KernelLogger`].

use core::fmt::Arguments;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::console;

#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        $crate::printf::cprintf_args(core::format_args!($($arg)*))
    };
}

/// Print to the console; the named `cprintf` interface.
pub fn cprintf_args(args: Arguments<'_>) {
    console::write_fmt_locked(args);
}

/// Backs the `log` crate's `info!`/`warn!`/`error!`/`debug!` macros with
/// the same serial console `cprintf` writes to.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        console::write_fmt_locked(format_args!(
            "[{:>5} {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once from `kmain` on CPU 0 before any
/// other subsystem that might log.
pub fn init_logging() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Info))
        .ok();
}
