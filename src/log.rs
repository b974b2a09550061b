//! Structured logging for kiln.
//!
//! Log levels:
//! - ERROR: A task failed permanently or a build aborted
//! - WARN: An attempt failed, timed out or reported too late
//! - INFO: Build, phase and task lifecycle
//! - DEBUG: Scheduling decisions (assignment, steals, claims)
//! - TRACE: Every published build event
//!
//! Output goes to `~/.kiln/kiln.log`; warnings and errors are mirrored to
//! stderr. Debug mode is enabled with the `--debug` flag or `KILN_DEBUG=1`.
//! `RUST_LOG` overrides the file filter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "kiln.log";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.kiln/kiln.log
pub fn init() -> Option<WorkerGuard> {
    init_with_debug(false)
}

/// Initialize logging with explicit debug mode setting.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the life of the process. `None` means only stderr logging is active.
pub fn init_with_debug(debug: bool) -> Option<WorkerGuard> {
    init_in(debug, log_dir())
}

fn init_in(debug: bool, dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let env_debug = std::env::var("KILN_DEBUG")
        .map(|v| is_truthy(&v))
        .unwrap_or(false);
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let default_level = if debug_enabled {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let file_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let (file_layer, guard) = match dir.filter(|d| std::fs::create_dir_all(d).is_ok()) {
        Some(dir) => {
            // Truncate on startup
            let _ = std::fs::write(dir.join(LOG_FILE_NAME), "");
            let appender = tracing_appender::rolling::never(&dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    // A second init keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
    guard
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, if a home directory exists.
pub fn log_path() -> Option<PathBuf> {
    log_dir().map(|d| d.join(LOG_FILE_NAME))
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".kiln"))
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
