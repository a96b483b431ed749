//! Logging initialization: a stderr layer for operators watching the
//! process directly, plus a daily-rotated file layer under `--logDirectory`
//! (spec.md §7's "log files in logDirectory, rotated by time and size").
//!
//! The stderr half follows the teacher's `src/main.rs` initialization
//! (`tracing_subscriber::fmt().with_env_filter(...).with_writer(stderr)
//! .with_ansi(false)`) exactly; the file half is layered on top with
//! `tracing-appender`, which the teacher also depends on but doesn't wire
//! up in its own single-output `main.rs`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber. The returned `WorkerGuard` must be held
/// for the lifetime of the process - dropping it flushes and stops the
/// file-writing background thread.
pub fn init(log_directory: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_directory)?;
    let file_appender = tracing_appender::rolling::daily(log_directory, "amqpprox.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = || EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_filter(env_filter());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
