//! File logging for the control CLI.
//!
//! Logs go to `~/.filewriter/logs/filewriter-ctl.log` through a non-blocking
//! writer. Warnings and errors are also mirrored to stderr.

use fs_err as fs;
use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_NAME: &str = "filewriter-ctl.log";

/// Keep the returned guard alive for the life of the process, or buffered
/// lines are lost on exit.
pub fn init() -> Option<WorkerGuard> {
    let Some(dir) = log_dir().filter(|dir| fs::create_dir_all(dir).is_ok()) else {
        let _ = tracing_subscriber::registry().with(stderr_layer()).try_init();
        return None;
    };

    let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(file_filter());

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer())
        .try_init();
    Some(guard)
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new("warn"))
}

fn file_filter() -> EnvFilter {
    let debug_enabled = env::var("FILEWRITER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".filewriter").join("logs"))
}
