//! Backend for the `log` facade.
//!
//! Level selection happens at compile time through the `LOG` environment
//! variable (`LOG=trace cargo test` shows the paging traffic). On the host
//! the records go to stdout with a color per level; built for bare metal the
//! records are dropped until a console driver is wired in.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    #[cfg(not(target_os = "none"))]
    fn log(&self, record: &Record) {
        println!(
            "\x1b[{}m[{:>5}] {}\x1b[0m",
            level_to_color_code(record.level()),
            record.level(),
            record.args()
        );
    }

    #[cfg(target_os = "none")]
    fn log(&self, _record: &Record) {}

    fn flush(&self) {}
}

/// Installs the logger. Safe to call more than once; only the first call
/// takes effect.
pub fn init() {
    static LOGGER: KernelLogger = KernelLogger;
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    log::set_max_level(match option_env!("LOG") {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}

#[cfg(not(target_os = "none"))]
fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
