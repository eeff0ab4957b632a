//! Console logger behind the `log` facade
//!
//! The level is fixed at compile time through the `LOG` environment
//! variable (`ERROR`, `WARN`, `INFO`, `DEBUG`, `TRACE`); logging is off
//! when it is unset.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
            level_color(record.level()),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31, // red
        Level::Warn => 93,  // bright yellow
        Level::Info => 34,  // blue
        Level::Debug => 32, // green
        Level::Trace => 90, // bright black
    }
}

/// Parse a `LOG` setting; anything unrecognised turns logging off
pub fn level_filter(setting: Option<&str>) -> LevelFilter {
    match setting {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Install the console logger. Later calls are no-ops.
pub fn init() {
    static LOGGER: ConsoleLogger = ConsoleLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_filter(option_env!("LOG")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(level_filter(Some("TRACE")), LevelFilter::Trace);
        assert_eq!(level_filter(Some("WARN")), LevelFilter::Warn);
    }

    #[test]
    fn unknown_or_missing_level_disables_logging() {
        assert_eq!(level_filter(None), LevelFilter::Off);
        assert_eq!(level_filter(Some("verbose")), LevelFilter::Off);
    }
}
