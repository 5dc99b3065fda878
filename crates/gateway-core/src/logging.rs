//! Logger configuration and structured output formatting.
//!
//! Grounded on the teacher's `logs::logger::configure_logger` (the colorized,
//! column-aligned format and `NO_COLOR` handling are carried verbatim); the
//! hardcoded `LevelFilter::Debug` is replaced with a `LOG_LEVEL`
//! environment-variable read per SPEC_FULL.md §6.

use chrono::{Local, Utc};
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};

const LEVEL_FIELD_WIDTH: usize = 8;
const FILE_LINE_FIELD_WIDTH: usize = 22;

/// Gates a recurring warning to at most once per `window_ms` (SPEC_FULL.md
/// §5: fail-open/fail-local conditions "MUST be logged at WARN at most once
/// per minute"). Each degraded-mode reason a caller wants to log should hold
/// its own `LogThrottle` instance.
pub struct LogThrottle {
    last_logged_ms: AtomicI64,
    window_ms: i64,
}

impl LogThrottle {
    pub const fn per_minute() -> Self {
        Self { last_logged_ms: AtomicI64::new(i64::MIN), window_ms: 60_000 }
    }

    /// Returns `true` at most once per window. Concurrent callers racing for
    /// the same window see exactly one winner.
    pub fn allow(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        let last = self.last_logged_ms.load(Ordering::Relaxed);
        if last != i64::MIN && now.saturating_sub(last) < self.window_ms {
            return false;
        }
        self.last_logged_ms.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }
}

fn visible_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut visible = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b {
            i += 1;
            if i < bytes.len() && bytes[i] == b'[' {
                i += 1;
            }
            while i < bytes.len() {
                let b = bytes[i];
                i += 1;
                if b == b'm' {
                    break;
                }
            }
        } else {
            let first = bytes[i];
            let width = if first < 0x80 {
                1
            } else if first >> 5 == 0b110 {
                2
            } else if first >> 4 == 0b1110 {
                3
            } else if first >> 3 == 0b11110 {
                4
            } else {
                1
            };
            visible += 1;
            i += width;
        }
    }
    visible
}

fn level_from_str(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Initializes structured, colorized logging. Reads `LOG_LEVEL` (default
/// `info`) and honors `NO_COLOR`. Call once at process startup.
pub fn configure_logger() {
    let no_color = env::var("NO_COLOR").is_ok();
    let level = env::var("LOG_LEVEL").map(|v| level_from_str(&v)).unwrap_or(LevelFilter::Info);

    Builder::new()
        .format(move |buf, record| {
            let level = record.level();
            let level_plain = level.to_string();

            let (prefix, colored_level, suffix) = if no_color {
                ("".to_string(), level_plain.clone(), "".to_string())
            } else {
                let prefix = "\x1b[1m".to_string();
                let colored = match level {
                    log::Level::Error => format!("\x1b[31m{}\x1b[39m", level_plain),
                    log::Level::Warn => format!("\x1b[33m{}\x1b[39m", level_plain),
                    log::Level::Info => format!("\x1b[32m{}\x1b[39m", level_plain),
                    log::Level::Debug => format!("\x1b[34m{}\x1b[39m", level_plain),
                    log::Level::Trace => format!("\x1b[35m{}\x1b[39m", level_plain),
                };
                let suffix = "\x1b[0m".to_string();
                (prefix, colored, suffix)
            };

            let level_display = format!("[{}]", colored_level);
            let level_vis_len = visible_len(&level_display);
            let level_padding = if level_vis_len >= LEVEL_FIELD_WIDTH { 1 } else { LEVEL_FIELD_WIDTH - level_vis_len };

            let file = record.file().unwrap_or("unknown");
            let line = record.line().unwrap_or(0);
            let file_line = format!("{}:{}", file, line);
            let file_line_vis_len = visible_len(&file_line);
            let file_line_padding = if file_line_vis_len >= FILE_LINE_FIELD_WIDTH { 1 } else { FILE_LINE_FIELD_WIDTH - file_line_vis_len };

            writeln!(
                buf,
                "{}{} | {}{}| {}{}| {}{}",
                prefix,
                Local::now().format("%b %d %y %I:%M:%S %p"),
                level_display,
                " ".repeat(level_padding),
                file_line,
                " ".repeat(file_line_padding),
                record.args(),
                suffix,
            )
        })
        .filter_level(level)
        .init();

    log::set_max_level(level);
}
