//! Logging initialization
//!
//! Sets up the tracing subscriber from the loaded configuration. Call once
//! at startup; the returned guard must stay alive for the duration of the
//! program so buffered log lines are flushed.

use crate::config::LoggingConfig;

/// Initialize the global subscriber. Logs go to stdout unless a file is
/// configured, in which case ANSI colors are disabled.
pub fn init_logging(config: &LoggingConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_configured = config.file.as_ref().is_some_and(|f| !f.is_empty());
    let writer: Box<dyn std::io::Write + Send + Sync> = if file_configured {
        let path = config.file.as_deref().unwrap_or_default();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("Failed to open log file");
        Box::new(file)
    } else {
        Box::new(std::io::stdout())
    };

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(writer);
    let filter = tracing_subscriber::EnvFilter::new(config.level.clone());

    tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_env_filter(filter)
        .with_level(true)
        .with_ansi(!file_configured)
        .init();

    guard
}
