//! Process logging backend for the `log` facade.
//!
//! # Responsibility
//! - Install the `flexi_logger` backend exactly once per process, writing
//!   rotating files or stderr.
//! - Route panics through the logger as single-line records.
//!
//! # Invariants
//! - Repeating the first successful call is a no-op.
//! - A call asking for another level or destination is rejected.
//! - Initialization never panics.

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::Once;

const LOG_FILE_BASENAME: &str = "connector";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;
const PANIC_MESSAGE_LIMIT: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK: Once = Once::new();

struct ActiveLogger {
    level: LevelFilter,
    log_dir: Option<PathBuf>,
    _handle: LoggerHandle,
}

impl ActiveLogger {
    fn accepts(&self, level: LevelFilter, log_dir: Option<&Path>) -> Result<(), String> {
        if self.log_dir.as_deref() != log_dir {
            return Err(format!(
                "logging already writes to `{}`; refusing to switch to `{}`",
                destination(self.log_dir.as_deref()),
                destination(log_dir)
            ));
        }
        if self.level != level {
            return Err(format!(
                "logging already runs at `{}`; refusing to switch to `{}`",
                level_name(self.level),
                level_name(level)
            ));
        }
        Ok(())
    }
}

/// Initializes logging with a level and an optional absolute log directory.
///
/// Without a directory records go to stderr.
///
/// # Errors
/// - The level is not one of `trace`, `debug`, `info`, `warn`, `error`.
/// - The directory is blank, relative or cannot be created.
/// - Logging is already active with other settings, or the backend fails.
pub fn init_logging(level: &str, log_dir: Option<&str>) -> Result<(), String> {
    let level = parse_level(level)?;
    let log_dir = log_dir.map(parse_log_dir).transpose()?;

    let active = ACTIVE.get_or_try_init(|| start_logger(level, log_dir.clone()))?;
    active.accepts(level, log_dir.as_deref())
}

fn start_logger(level: LevelFilter, log_dir: Option<PathBuf>) -> Result<ActiveLogger, String> {
    let logger = Logger::try_with_str(level_name(level))
        .map_err(|err| format!("log level `{}` rejected: {err}", level_name(level)))?;
    let logger = match &log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|err| {
                format!("cannot create log directory `{}`: {err}", dir.display())
            })?;
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir.as_path())
                        .basename(LOG_FILE_BASENAME),
                )
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .format_for_files(flexi_logger::detailed_format)
        }
        None => logger
            .log_to_stderr()
            .format_for_stderr(flexi_logger::detailed_format),
    };
    let handle = logger
        .start()
        .map_err(|err| format!("logger backend did not start: {err}"))?;

    PANIC_HOOK.call_once(chain_panic_hook);

    info!(
        "event=logging_init module=core status=ok level={} destination={} os={} version={}",
        level_name(level),
        destination(log_dir.as_deref()),
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    );

    Ok(ActiveLogger {
        level,
        log_dir,
        _handle: handle,
    })
}

/// Active `(level, log_dir)`, or `None` before the first successful
/// initialization. `log_dir` is `None` for stderr.
pub fn logging_status() -> Option<(&'static str, Option<PathBuf>)> {
    ACTIVE
        .get()
        .map(|active| (level_name(active.level), active.log_dir.clone()))
}

/// `debug` for debug builds, `info` otherwise.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn parse_level(raw: &str) -> Result<LevelFilter, String> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("warning") {
        return Ok(LevelFilter::Warn);
    }
    match trimmed.parse::<LevelFilter>() {
        Ok(LevelFilter::Off) | Err(_) => Err(format!(
            "log level `{trimmed}` is not one of trace, debug, info, warn, error"
        )),
        Ok(level) => Ok(level),
    }
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_log_dir(raw: &str) -> Result<PathBuf, String> {
    let path = Path::new(raw.trim());
    if path.as_os_str().is_empty() {
        return Err("log directory is blank".to_string());
    }
    if path.is_relative() {
        return Err(format!("log directory `{}` is relative", path.display()));
    }
    Ok(path.to_path_buf())
}

fn destination(log_dir: Option<&Path>) -> String {
    log_dir.map_or_else(|| "stderr".to_string(), |dir| dir.display().to_string())
}

fn chain_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let location = info
            .location()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        error!(
            "event=panic module=core status=error location={location} message={}",
            single_line(&panic_message(info.payload()), PANIC_MESSAGE_LIMIT)
        );
        previous(info);
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string payload>".to_string())
}

/// Replaces control characters with spaces and caps the text at `limit`
/// characters, marking a cut with `...`.
fn single_line(text: &str, limit: usize) -> String {
    let mut line: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(limit)
        .collect();
    if text.chars().nth(limit).is_some() {
        line.push_str("...");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::{
        init_logging, logging_status, panic_message, parse_level, parse_log_dir, single_line,
    };
    use log::LevelFilter;

    #[test]
    fn level_parsing_is_lenient_about_case_and_warning() {
        assert_eq!(parse_level(" Debug ").expect("mixed case"), LevelFilter::Debug);
        assert_eq!(parse_level("WARNING").expect("alias"), LevelFilter::Warn);
        let err = parse_level("off").expect_err("off is not a logging level");
        assert!(err.contains("`off`"));
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn log_dir_must_be_absolute_and_present() {
        assert!(parse_log_dir("logs/dev")
            .expect_err("relative dir")
            .contains("relative"));
        assert!(parse_log_dir("   ").expect_err("blank dir").contains("blank"));
    }

    #[test]
    fn panic_text_becomes_one_capped_line() {
        assert_eq!(single_line("disk\nfull\r", 40), "disk full ");
        assert_eq!(single_line("abcdefghij", 4), "abcd...");
        assert_eq!(single_line("abcd", 4), "abcd");

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let opaque: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(opaque.as_ref()), "<non-string payload>");
    }

    #[test]
    fn second_init_must_match_the_first() {
        let first = tempfile::Builder::new()
            .prefix("connector-logging")
            .tempdir()
            .expect("first log dir");
        let other = tempfile::tempdir().expect("second log dir");
        let first_str = first.path().to_str().expect("utf-8 temp dir");
        let other_str = other.path().to_str().expect("utf-8 temp dir");

        init_logging("info", Some(first_str)).expect("first init");
        init_logging("INFO", Some(first_str)).expect("repeat is a no-op");

        let level = init_logging("debug", Some(first_str)).expect_err("other level");
        assert!(level.contains("`info`") && level.contains("`debug`"));
        let dir = init_logging("info", Some(other_str)).expect_err("other dir");
        assert!(dir.contains("refusing to switch"));
        let stderr = init_logging("info", None).expect_err("stderr instead of file");
        assert!(stderr.contains("stderr"));

        assert_eq!(
            logging_status(),
            Some(("info", Some(first.path().to_path_buf())))
        );
    }
}
