//! Kernel logger.
//!
//! Routes the `log` facade to the port's debug sink (ITM stimulus port 0 on
//! the firmware, nothing on the host). Each core installs its own instance.

use log::{LevelFilter, Log, Metadata, Record};

use crate::arch;

pub struct ItmLogger;

static LOGGER: ItmLogger = ItmLogger;

fn tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => " WARN",
        log::Level::Info => " INFO",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

impl Log for ItmLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        arch::debug_write(format_args!(
            "[{}] {}: {}\n",
            tag(record.level()),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the logger. Later calls only adjust the level.
pub fn init(level: LevelFilter) {
    // Already installed is fine: one logger serves the whole image.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
