//! File logging for the orchestrator.
//!
//! Lines go to `<state_dir>/weft.log`, truncated on startup. Nothing is
//! written until [`init`] has been called, so library users and tests stay
//! quiet unless they opt in.
//!
//! The level comes from `--debug` or from `WEFT_LOG` (`error`, `warn`,
//! `info`, `debug`, `trace`).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub const LOG_FILE: &str = "weft.log";
pub const LOG_ENV: &str = "WEFT_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|l| l.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}

/// Level chosen from the flag and the environment. `--debug` never lowers
/// a more verbose `WEFT_LOG`.
fn resolve_level(debug: bool, env: Option<&str>) -> Level {
    let from_env = env.and_then(|v| v.parse().ok()).unwrap_or(Level::Info);
    if debug {
        from_env.max(Level::Debug)
    } else {
        from_env
    }
}

/// Start logging into `state_dir`. Only the first call picks the file.
pub fn init(state_dir: &Path, debug: bool) {
    let env = std::env::var(LOG_ENV).ok();
    LOG_LEVEL.store(resolve_level(debug, env.as_deref()) as u8, Ordering::SeqCst);

    if std::fs::create_dir_all(state_dir).is_ok() {
        let path = state_dir.join(LOG_FILE);
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn log_at(level: Level, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(
            file,
            "{} {:<5} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            level.label(),
            msg
        );
    }
}

#[macro_export]
macro_rules! wlog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Warn, &format!($($arg)*))
    };
}

/// Formats only when debug output is on.
#[macro_export]
macro_rules! wlog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Debug) {
            $crate::log::log_at($crate::log::Level::Debug, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! wlog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Trace) {
            $crate::log::log_at($crate::log::Level::Trace, &format!($($arg)*))
        }
    };
}
