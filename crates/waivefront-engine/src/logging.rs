//! Centralized timestamped logging.
//!
//! Every WaiveFront log line is shaped like:
//!     <timestamp> [TAG][thread] message
//!
//! All logs go through `logi!`, `logw!`, or `loge!`. stderr is the canonical sink; an optional
//! append-only file sink can be enabled at startup. Child-process output (ffmpeg) can be piped
//! through the same format with [`spawn_pipe_thread`].

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();
static TS_FORMAT: OnceLock<Vec<time::format_description::FormatItem<'static>>> = OnceLock::new();

/// Initialize logging. Call once at startup.
/// - If `log_file` is Some, all log lines are also appended to that path.
///
/// Returns the generated run_id.
pub fn init(log_file: Option<PathBuf>) -> String {
    let rid = RUN_ID
        .get_or_init(|| {
            let now = time::OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
            format!("{:08x}", now ^ (std::process::id() as u64))
        })
        .clone();

    let sink = LOG_FILE.get_or_init(|| Mutex::new(None));

    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                if let Ok(mut guard) = sink.lock() {
                    *guard = Some(f);
                }
            }
            Err(e) => {
                // The macros route through log_line, which is fine here; the sink just stays empty.
                log_line("WARN", "INIT", &format!("failed to open log file {}: {e}", path.display()));
            }
        }
    }

    rid
}

/// Current run id (empty if init() wasn't called).
pub fn run_id() -> &'static str {
    RUN_ID.get().map(|s| s.as_str()).unwrap_or("")
}

/// Timestamp used in logs: `YYYY-MM-DD HH:MM:SS.mmm`.
///
/// Local time is used when available; it falls back to UTC.
pub fn log_timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let fmt = TS_FORMAT.get_or_init(|| {
        time::format_description::parse(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]",
        )
        .unwrap_or_default()
    });
    now.format(fmt).unwrap_or_else(|_| "<time-format-error>".to_string())
}

/// Best-effort thread name for log prefix.
pub fn log_thread_name() -> String {
    std::thread::current().name().unwrap_or("main").to_string()
}

/// Write one fully formatted line to stderr + optional file sink.
///
/// Public because the exported macros expand to it in downstream crates.
#[doc(hidden)]
pub fn log_line(_level: &str, tag: &str, msg: &str) {
    let line = format!("{} [{}][{}] {}", log_timestamp(), tag, log_thread_name(), msg);

    eprintln!("{line}");

    if let Some(m) = LOG_FILE.get() {
        if let Ok(mut guard) = m.lock() {
            if let Some(f) = guard.as_mut() {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
        }
    }
}

/// Pipe a Read stream (child stdout/stderr) into the logger on its own thread.
pub fn spawn_pipe_thread<R: Read + Send + 'static>(
    thread_name: &str,
    tag: &str,
    reader: R,
    as_warn: bool,
) {
    let tag = tag.to_string();
    let _ = std::thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let br = BufReader::new(reader);
            for line in br.lines().map_while(Result::ok) {
                if line.trim().is_empty() {
                    continue;
                }
                log_line(if as_warn { "WARN" } else { "INFO" }, &tag, &line);
            }
        });
}

/// Info log
#[macro_export]
macro_rules! logi {
    ($tag:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::logging::log_line("INFO", $tag, &msg);
    }};
}

/// Warning log
#[macro_export]
macro_rules! logw {
    ($tag:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::logging::log_line("WARN", $tag, &msg);
    }};
}

/// Error log
#[macro_export]
macro_rules! loge {
    ($tag:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::logging::log_line("ERROR", $tag, &msg);
    }};
}
