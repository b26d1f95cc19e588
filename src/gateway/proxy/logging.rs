//! Usage: Best-effort enqueue to the request log writer with backpressure and fallbacks.

use crate::gateway::events::Attempt;
use crate::{db, request_logs};
use std::time::Duration;

use super::types::RequestVariant;

const LOG_ENQUEUE_MAX_WAIT: Duration = Duration::from_millis(100);

pub(in crate::gateway) struct RequestLogEnqueueArgs {
    pub(in crate::gateway) trace_id: String,
    pub(in crate::gateway) variant: RequestVariant,
    pub(in crate::gateway) requested_model: Option<String>,
    pub(in crate::gateway) outcome: &'static str,
    pub(in crate::gateway) error_code: Option<String>,
    pub(in crate::gateway) attempts: Vec<Attempt>,
    pub(in crate::gateway) final_model: Option<String>,
    pub(in crate::gateway) duration_ms: u128,
    pub(in crate::gateway) ttfb_ms: Option<u128>,
    pub(in crate::gateway) created_at: i64,
}

fn request_log_insert_from_args(args: RequestLogEnqueueArgs) -> request_logs::RequestLogInsert {
    let RequestLogEnqueueArgs {
        trace_id,
        variant,
        requested_model,
        outcome,
        error_code,
        attempts,
        final_model,
        duration_ms,
        ttfb_ms,
        created_at,
    } = args;

    let attempts_json = serde_json::to_string(&attempts).unwrap_or_else(|_| "[]".to_string());
    let duration_ms = duration_ms.min(i64::MAX as u128) as i64;
    let ttfb_ms = ttfb_ms.and_then(|v| {
        if v > duration_ms as u128 {
            return None;
        }
        Some(v.min(i64::MAX as u128) as i64)
    });

    request_logs::RequestLogInsert {
        trace_id,
        variant: variant.as_str().to_string(),
        requested_model,
        outcome: outcome.to_string(),
        error_code,
        attempt_count: attempts.len() as i64,
        final_model,
        attempts_json,
        duration_ms,
        ttfb_ms,
        created_at,
    }
}

pub(in crate::gateway) async fn enqueue_request_log_with_backpressure(
    db: &db::Db,
    log_tx: &tokio::sync::mpsc::Sender<request_logs::RequestLogInsert>,
    args: RequestLogEnqueueArgs,
) {
    let insert = request_log_insert_from_args(args);
    let trace_id = insert.trace_id.clone();

    let reserve = tokio::time::timeout(LOG_ENQUEUE_MAX_WAIT, log_tx.reserve()).await;
    match reserve {
        Ok(Ok(permit)) => {
            permit.send(insert);
        }
        Ok(Err(_)) => {
            tracing::warn!(
                trace_id = %trace_id,
                code = "GW_REQUEST_LOG_CHANNEL_CLOSED",
                "request log channel closed; using write-through fallback"
            );
            request_logs::spawn_write_through(db.clone(), insert);
        }
        Err(_) => {
            if log_tx.try_send(insert).is_ok() {
                tracing::warn!(
                    trace_id = %trace_id,
                    code = "GW_REQUEST_LOG_ENQUEUE_TIMEOUT",
                    wait_ms = LOG_ENQUEUE_MAX_WAIT.as_millis() as u64,
                    "request log enqueue timed out; used try_send fallback"
                );
                return;
            }

            tracing::error!(
                trace_id = %trace_id,
                code = "GW_REQUEST_LOG_DROPPED",
                wait_ms = LOG_ENQUEUE_MAX_WAIT.as_millis() as u64,
                "request log dropped (queue full)"
            );
        }
    }
}
