//! File logger for gantry runs.
//!
//! Lines go to `~/.gantry/gantry.log`, which is truncated when the CLI starts.
//! The threshold is INFO: run and task lifecycle, skipped steps and protocol
//! violations. `--debug` or `GANTRY_DEBUG=1` lowers it to DEBUG to include
//! scheduling traces, and `GANTRY_LOG=<level>` picks any level (`trace` adds
//! watcher events and collaborator environments).
//!
//! Nothing is written until [`init`] or [`init_at`] has opened a file.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
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

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|level| level.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

/// Threshold for a `--debug` flag and the `GANTRY_DEBUG` / `GANTRY_LOG`
/// values. An unparsable `GANTRY_LOG` is ignored.
fn threshold_for(debug: bool, debug_env: Option<&str>, level_env: Option<&str>) -> Level {
    if let Some(level) = level_env.and_then(|v| v.parse().ok()) {
        return level;
    }
    let debug_env = debug_env.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || debug_env {
        Level::Debug
    } else {
        Level::Info
    }
}

/// Log to `~/.gantry/gantry.log`.
pub fn init(debug: bool) {
    match dirs::home_dir() {
        Some(home) => init_at(&home.join(".gantry").join("gantry.log"), debug),
        None => set_threshold(env_threshold(debug)),
    }
}

/// Log to `path`, truncating it. Only the first call opens a file.
pub fn init_at(path: &Path, debug: bool) {
    set_threshold(env_threshold(debug));

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(file) = File::create(path) {
        let _ = SINK.set(Sink {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        });
    }
}

fn env_threshold(debug: bool) -> Level {
    let debug_env = std::env::var("GANTRY_DEBUG").ok();
    let level_env = std::env::var("GANTRY_LOG").ok();
    threshold_for(debug, debug_env.as_deref(), level_env.as_deref())
}

/// Path of the open log file.
pub fn path() -> Option<&'static Path> {
    SINK.get().map(|sink| sink.path.as_path())
}

pub fn threshold() -> Level {
    match THRESHOLD.load(Ordering::Relaxed) {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

pub fn set_threshold(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level <= threshold()
}

/// Append one line at `level`. Formatting is skipped below the threshold.
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let line = format!(
        "[{}] [{:<5}] {}\n",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        level,
        args
    );
    if let Ok(mut file) = sink.file.lock() {
        let _ = file.write_all(line.as_bytes());
    }
}

/// Log at an explicit [`Level`].
#[macro_export]
macro_rules! glog_at {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::write($level, format_args!($($arg)*))
    };
}

/// INFO: lifecycle of runs and tasks.
#[macro_export]
macro_rules! glog {
    ($($arg:tt)*) => {
        $crate::glog_at!($crate::log::Level::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! glog_error {
    ($($arg:tt)*) => {
        $crate::glog_at!($crate::log::Level::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! glog_warn {
    ($($arg:tt)*) => {
        $crate::glog_at!($crate::log::Level::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! glog_debug {
    ($($arg:tt)*) => {
        $crate::glog_at!($crate::log::Level::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! glog_trace {
    ($($arg:tt)*) => {
        $crate::glog_at!($crate::log::Level::Trace, $($arg)*)
    };
}
