//! Usage: Streaming inference gateway (router, cascade, upstream backend, NDJSON relay).

mod events;
mod manager;
mod proxy;
mod response_envelope;
mod routes;
mod streams;
mod upstream;
mod util;

pub(crate) use manager::GatewayRuntime;

use std::future::Future;
use tokio::net::TcpListener;

pub(crate) async fn bind(host: &str, port: u16) -> Result<TcpListener, String> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("GW_BIND_FAILED: failed to bind {addr}: {e}"))
}

/// Serves until `shutdown` resolves, then drains in-flight connections.
pub(crate) async fn serve<F>(
    listener: TcpListener,
    runtime: &GatewayRuntime,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, routes::router(runtime.state.clone()))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("GW_SERVE_FAILED: {e}"))?;

    tracing::info!("gateway stopped");
    Ok(())
}
