//! Usage: HTTP routes (generation variants, collected JSON mode, request log queries, health).

use super::manager::GatewayAppState;
use super::proxy::{self, RequestVariant};
use super::util::new_trace_id;
use crate::request_logs::{self, RequestLogSummary};
use crate::shared::blocking;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub(crate) fn router(state: GatewayAppState) -> Router {
    let body_limit = state.settings.max_request_body_bytes();
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/search", post(search))
        .route("/api/generate/json", post(generate_json))
        .route("/api/request-logs", get(list_request_logs))
        .route("/api/request-logs/:trace_id", get(get_request_log))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::map_response(ensure_trace_id))
        .with_state(state)
}

async fn ensure_trace_id(mut resp: Response) -> Response {
    if !resp.headers().contains_key("x-trace-id") {
        if let Ok(v) = HeaderValue::from_str(&new_trace_id()) {
            resp.headers_mut().insert("x-trace-id", v);
        }
    }
    resp
}

async fn generate(
    State(state): State<GatewayAppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    proxy::stream_impl(state, RequestVariant::Generate, body).await
}

async fn search(
    State(state): State<GatewayAppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    proxy::stream_impl(state, RequestVariant::Search, body).await
}

async fn generate_json(
    State(state): State<GatewayAppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    proxy::collect_json_impl(state, body).await
}

async fn health() -> Response {
    Json(serde_json::json!({ "ok": true })).into_response()
}

#[derive(Debug, Deserialize)]
struct RequestLogsQuery {
    limit: Option<usize>,
}

async fn list_request_logs(
    State(state): State<GatewayAppState>,
    Query(query): Query<RequestLogsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let Some(db) = state.db.clone() else {
        return Json(Vec::<RequestLogSummary>::new()).into_response();
    };

    match blocking::run("request_logs_list", move || request_logs::list_recent(&db, limit)).await {
        Ok(items) => Json(items).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "request log list failed");
            proxy::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                new_trace_id(),
                "GW_REQUEST_LOG_QUERY_FAILED",
                err,
                vec![],
            )
        }
    }
}

async fn get_request_log(
    State(state): State<GatewayAppState>,
    Path(trace_id): Path<String>,
) -> Response {
    let not_found = |trace_id: &str| {
        proxy::error_response(
            StatusCode::NOT_FOUND,
            new_trace_id(),
            "GW_REQUEST_LOG_NOT_FOUND",
            format!("no request log for trace_id={trace_id}"),
            vec![],
        )
    };
    let Some(db) = state.db.clone() else {
        return not_found(&trace_id);
    };

    let lookup = trace_id.clone();
    match blocking::run("request_logs_get", move || {
        request_logs::get_by_trace_id(&db, &lookup)
    })
    .await
    {
        Ok(Some(item)) => Json(item).into_response(),
        Ok(None) => not_found(&trace_id),
        Err(err) => {
            let status = if err.starts_with("SEC_INVALID_INPUT") {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            proxy::error_response(
                status,
                new_trace_id(),
                "GW_REQUEST_LOG_QUERY_FAILED",
                err,
                vec![],
            )
        }
    }
}
