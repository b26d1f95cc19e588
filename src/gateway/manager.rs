//! Usage: Gateway runtime state (settings snapshot, upstream backend, request log pipeline).

use crate::gateway::upstream::{GeminiBackend, GenerationBackend};
use crate::request_logs::{self, RequestLogInsert};
use crate::settings::GatewaySettings;
use crate::db;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared by every request handler. Nothing in here is mutated per request.
#[derive(Clone)]
pub(crate) struct GatewayAppState {
    pub(crate) settings: Arc<GatewaySettings>,
    pub(crate) backend: Arc<dyn GenerationBackend>,
    pub(crate) db: Option<db::Db>,
    pub(crate) log_tx: Option<mpsc::Sender<RequestLogInsert>>,
}

impl GatewayAppState {
    /// State without request log persistence.
    pub(crate) fn without_logs(
        settings: GatewaySettings,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            backend,
            db: None,
            log_tx: None,
        }
    }
}

/// Owns the background log writer so it can be flushed on shutdown.
pub(crate) struct GatewayRuntime {
    pub(crate) state: GatewayAppState,
    log_writer: Option<JoinHandle<()>>,
}

impl GatewayRuntime {
    /// Builds the Gemini backend and, when enabled, opens the request log
    /// database and starts its buffered writer. Must run inside a tokio runtime.
    pub(crate) fn start(settings: GatewaySettings) -> Result<Self, String> {
        let backend: Arc<dyn GenerationBackend> = Arc::new(GeminiBackend::new(&settings)?);
        let mut state = GatewayAppState::without_logs(settings, backend);

        if !state.settings.request_log_enabled {
            tracing::info!("request log persistence disabled");
            return Ok(Self {
                state,
                log_writer: None,
            });
        }

        let db_path = Path::new(&state.settings.request_log_db_path);
        let db = db::init(db_path)?;
        let (log_tx, log_writer) =
            request_logs::start_buffered_writer(db.clone(), state.settings.log_retention_days);
        tracing::info!(path = %db_path.display(), "request log database ready");

        state.db = Some(db);
        state.log_tx = Some(log_tx);
        Ok(Self {
            state,
            log_writer: Some(log_writer),
        })
    }

    /// Drops the last log sender and waits for the writer to flush.
    pub(crate) async fn shutdown(self) {
        let Self { state, log_writer } = self;
        drop(state);
        if let Some(writer) = log_writer {
            if let Err(err) = writer.await {
                tracing::warn!(error = %err, "request log writer task failed");
            }
        }
    }
}
