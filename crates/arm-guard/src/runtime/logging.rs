use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "arm-guard.log";

/// Initialize the tracing subscriber with optional JSON output.
///
/// Console output goes to stderr so stdout carries only the session report.
/// With `log_dir` set, JSON lines are also written to a daily-rolled file;
/// the returned guard must be held until exit so buffered lines are flushed.
pub fn init_tracing(json_output: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,arm_guard=debug,safety_core=debug"));

    let (file_writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .init();
    }

    guard
}
