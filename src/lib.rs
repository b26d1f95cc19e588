mod app;
mod gateway;
mod infra;
mod shared;

pub(crate) use infra::{db, request_logs, settings};

use std::path::PathBuf;

/// Command-line overrides applied on top of the settings file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub async fn run(options: RunOptions) -> Result<(), String> {
    let config_path = options
        .config_path
        .unwrap_or_else(|| PathBuf::from(settings::DEFAULT_SETTINGS_FILE));
    let mut config = settings::read(&config_path)?;
    if let Some(host) = options.host {
        config.listen_host = host;
    }
    if let Some(port) = options.port {
        config.port = port;
    }

    let _log_guard = app::logging::init(&config);
    tracing::info!(
        config = %config_path.display(),
        models = ?config.default_models,
        fallbacks = ?config.recitation_fallback_models,
        "settings loaded"
    );
    if config.api_key.trim().is_empty() {
        tracing::warn!("no api_key configured; every request must carry apiKey");
    }

    let listener = gateway::bind(&config.listen_host, config.port).await?;
    let runtime = gateway::GatewayRuntime::start(config)?;
    let served = gateway::serve(listener, &runtime, shutdown_signal()).await;
    runtime.shutdown().await;
    served
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(err) => {
            tracing::error!(error = %err, "failed to listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
