//! Session logging.
//!
//! A conductor run is a long autonomous session; when it misbehaves, the
//! log file is usually the only record of what the scheduler decided.
//! Lines are appended to `~/.conductor/conductor.log`, and the previous
//! session's file is kept as `conductor.log.1` so a crash can still be
//! diagnosed after a restart.
//!
//! The filter is fixed at startup: `--debug` (or `CONDUCTOR_DEBUG=1`)
//! selects `debug`, and `CONDUCTOR_LOG=<level>` overrides both. Callers
//! go through the `clog*` macros, which skip formatting entirely when a
//! level is filtered out.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

static SINK: RwLock<Option<PathBuf>> = RwLock::new(None);
static FILTER: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Severity of a log line, most severe first.
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
    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Level {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "trace" => Ok(Level::Trace),
            other => Err(crate::error::Error::Validation(format!(
                "unknown log level '{other}'"
            ))),
        }
    }
}

/// Set up the default sink at `~/.conductor/conductor.log`. Best effort:
/// a missing home directory means the session just runs unlogged.
pub fn init(debug: bool) {
    set_filter(resolve_filter(debug));
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("conductor.log");
        rotate(&path);
        install_sink(path);
    }
}

/// Point the sink at an explicit file, for embedders and tests.
pub fn init_at(path: PathBuf, filter: Level) {
    set_filter(filter);
    install_sink(path);
}

fn install_sink(path: PathBuf) {
    if let Ok(mut sink) = SINK.write() {
        *sink = Some(path);
    }
}

/// Keep the previous session's log around as `<name>.1`.
fn rotate(path: &Path) {
    if path.exists() {
        let mut rotated = path.as_os_str().to_owned();
        rotated.push(".1");
        let _ = std::fs::rename(path, PathBuf::from(rotated));
    }
}

fn resolve_filter(debug: bool) -> Level {
    if let Ok(value) = std::env::var("CONDUCTOR_LOG") {
        if let Ok(level) = value.parse() {
            return level;
        }
    }
    let env_debug = std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        Level::Debug
    } else {
        Level::Info
    }
}

pub fn set_filter(level: Level) {
    FILTER.store(level as u8, Ordering::SeqCst);
}

pub fn filter() -> Level {
    Level::from_u8(FILTER.load(Ordering::Relaxed))
}

/// Whether a line at `level` would be written. The macros check this
/// before formatting their arguments.
pub fn enabled(level: Level) -> bool {
    level <= filter()
}

/// Append one line to the sink. No-op until a sink is installed.
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Ok(sink) = SINK.read() else { return };
    let Some(path) = sink.as_ref() else { return };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "[{timestamp}] [{level:<5}] {args}");
    }
}

/// Log at INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Info) {
            $crate::log::write($crate::log::Level::Info, format_args!($($arg)*));
        }
    };
}

/// Log at ERROR level.
#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Error) {
            $crate::log::write($crate::log::Level::Error, format_args!($($arg)*));
        }
    };
}

/// Log at WARN level.
#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Warn) {
            $crate::log::write($crate::log::Level::Warn, format_args!($($arg)*));
        }
    };
}

/// Log at DEBUG level (tick decisions, assignments).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Debug) {
            $crate::log::write($crate::log::Level::Debug, format_args!($($arg)*));
        }
    };
}

/// Log at TRACE level (check output, limiter queue state).
#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Level::Trace) {
            $crate::log::write($crate::log::Level::Trace, format_args!($($arg)*));
        }
    };
}
