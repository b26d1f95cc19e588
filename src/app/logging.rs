//! Usage: Tracing bootstrap (stderr + optional daily-rolling file).

use crate::settings::GatewaySettings;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "gateway.log";

fn build_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. The returned guard must live as long as the
/// process, otherwise buffered file output is lost.
pub(crate) fn init(settings: &GatewaySettings) -> Option<WorkerGuard> {
    // Ignore: a logger may already be installed (tests, embedding).
    let _ = tracing_log::LogTracer::init();

    let filter = build_filter(&settings.log_filter);
    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    let log_dir = settings.log_dir.trim();
    if log_dir.is_empty() {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
        return None;
    }

    if let Err(err) = std::fs::create_dir_all(Path::new(log_dir)) {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
        tracing::warn!(log_dir, error = %err, "log dir unavailable; logging to stderr only");
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Some(guard)
}
