use std::io::Write;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

/// Diagnostics go to stderr so stdout stays reserved for component output.
struct ComponentsLogger {
    file: Option<Mutex<std::fs::File>>,
    filter: LevelFilter,
    start: Instant,
}

impl ComponentsLogger {
    fn line(&self, record: &Record) -> String {
        let elapsed = self.start.elapsed().as_secs_f64();
        format!(
            "[{elapsed:.3}s] [{}] {} - {}",
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for ComponentsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.line(record);
        let _ = writeln!(std::io::stderr().lock(), "{line}");

        if let Some(ref file) = self.file {
            let _ = writeln!(file.lock(), "{line}");
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
        if let Some(ref file) = self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Level from `RUST_LOG` when it parses, else `Debug` for `--debug` runs, else `Warn`.
#[must_use]
pub fn level_filter(rust_log: Option<&str>, debug: bool) -> LevelFilter {
    rust_log
        .and_then(|s| s.parse().ok())
        .unwrap_or(if debug { LevelFilter::Debug } else { LevelFilter::Warn })
}

/// Initialize the global logger. Must be called once before any logging.
///
/// # Errors
///
/// Returns `log::SetLoggerError` if a logger is already installed.
pub fn init(log_file: Option<std::fs::File>, debug: bool) -> Result<(), log::SetLoggerError> {
    let filter = level_filter(std::env::var("RUST_LOG").ok().as_deref(), debug);

    let logger = ComponentsLogger {
        file: log_file.map(Mutex::new),
        filter,
        start: Instant::now(),
    };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(filter);
    Ok(())
}
