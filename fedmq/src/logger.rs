use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};

use anyhow::anyhow;
use slog::{o, Drain};

use fedmq_conf::logging::{Log, To};

use crate::Result;

pub use slog::Logger;

/// Routes the `log` facade into `logger`, filtering each record by the level `log` sets for
/// its target module.
pub fn logger_init(logger: Logger, log: &Log) -> Result<()> {
    log::set_max_level(slog_log_to_level(log.max_level()).to_level_filter());
    log::set_boxed_logger(Box::new(LoggerEx { logger, log: log.clone() }))
        .map_err(|e| anyhow!("logger init failed, {e}"))?;
    Ok(())
}

/// Builds the broker logger from the `[log]` settings.
#[inline]
pub fn logger_from_settings(log: &Log) -> Result<Logger> {
    config_logger(log.file.clone(), log.to, log.max_level())
}

struct LoggerEx {
    logger: Logger,
    log: Log,
}

impl log::Log for LoggerEx {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= slog_log_to_level(self.log.level_for(metadata.target()))
    }

    fn log(&self, r: &log::Record) {
        if !self.enabled(r.metadata()) {
            return;
        }
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.logger.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(filename: String, to: To, level: slog::Level) -> Result<Logger> {
    let file = if to.file() { Some(open_file(&filename)?) } else { None };
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter { to, file, console: io::stdout() });
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .use_original_order()
        .build()
        .fuse();

    let drain = drain.filter_level(level).fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match (self.to, self.file.as_mut()) {
            (To::Console, _) => self.console.write(buf)?,
            (To::File, Some(file)) => file.write(buf)?,
            (To::Both, Some(file)) => {
                let _ = self.console.write(buf)?;
                file.write(buf)?
            }
            _ => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("logger file config error, filename: {}, {:?}", filename, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_logger_builds() {
        let logger = config_logger(String::new(), To::Off, slog::Level::Debug).unwrap();
        slog::info!(logger, "dropped"; "target" => "off");
    }

    #[test]
    fn module_levels_filter_records() {
        let logger = config_logger(String::new(), To::Off, slog::Level::Trace).unwrap();
        let log = Log { modules: vec![("fedmq::bridge".into(), slog::Level::Debug)], ..Default::default() };
        let ex = LoggerEx { logger, log };
        let enabled = |level: log::Level, target: &str| {
            log::Log::enabled(&ex, &log::Metadata::builder().level(level).target(target).build())
        };
        assert!(enabled(log::Level::Debug, "fedmq::bridge::credit"));
        assert!(!enabled(log::Level::Trace, "fedmq::bridge"));
        assert!(!enabled(log::Level::Debug, "fedmq::governor"));
        assert!(enabled(log::Level::Warn, "fedmq::governor"));
    }

    #[test]
    fn file_logger_appends() {
        let path = std::env::temp_dir().join(format!("fedmq-logger-{}.log", std::process::id()));
        let filename = path.to_string_lossy().to_string();
        {
            let logger = config_logger(filename.clone(), To::File, slog::Level::Info).unwrap();
            slog::info!(logger, "bridge active");
            slog::debug!(logger, "filtered");
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("bridge active"));
        assert!(!text.contains("filtered"));
        let _ = std::fs::remove_file(path);
    }
}
