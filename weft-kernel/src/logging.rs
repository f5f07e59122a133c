//! Kernel logging
//!
//! Logging goes through the `log` crate facade. The kernel installs a
//! logger that prefixes records with their level and target and writes
//! them through a sink the embedder provides (a serial console on
//! hardware, stderr-like capture in tests). Without a sink, records
//! are dropped.

use alloc::boxed::Box;
use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// The compile-time log level of the kernel.
pub const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

static SINK: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = SINK.lock();
        if let Some(out) = sink.as_mut() {
            let level = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            let _ = writeln!(out, "[{}] {}: {}", level, record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger with the given sink.
///
/// Idempotent; a second call replaces the sink only.
pub fn init(sink: Box<dyn Write + Send>) {
    *SINK.lock() = Some(sink);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LOG_LEVEL);
}

/// Install the kernel logger without a sink (records are dropped).
pub fn init_silent() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LOG_LEVEL);
}
