//! Usage: Gateway request handlers (request preparation + cascade task + collected finalization).

mod failover_loop;

use super::errors::{error_response, error_response_with_retryable};
use super::failover::{ModelQueue, RecitationRecovery};
use super::http_util::build_ndjson_response;
use super::logging::{enqueue_request_log_with_backpressure, RequestLogEnqueueArgs};
use super::prompt::{build_prompt_parts, clean_response_schema};
use super::types::{GenerationRequest, RequestVariant};

use axum::{
    body::{Body, Bytes},
    extract::rejection::BytesRejection,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use super::super::manager::GatewayAppState;
use super::super::response_envelope::{finalize_answer, AnswerAccumulator, FinalAnswer};
use super::super::streams::EventSink;
use super::super::upstream::PromptPart;
use super::super::util::{new_trace_id, sanitize_model};
use crate::shared::stream_ext::next_item;
use crate::shared::time::now_unix_seconds;
use failover_loop::{CascadeInput, CascadeReport, RelayTimeouts};

/// Everything the cascade needs, resolved before the first byte is streamed.
struct PreparedRequest {
    trace_id: String,
    variant: RequestVariant,
    requested_model: Option<String>,
    parts: Arc<Vec<PromptPart>>,
    response_schema: Option<Arc<Value>>,
    api_key: String,
    queue: ModelQueue,
    recovery: RecitationRecovery,
    timeouts: RelayTimeouts,
    started: Instant,
    created_at: i64,
}

struct RequestEnd {
    trace_id: String,
    variant: RequestVariant,
    requested_model: Option<String>,
    started: Instant,
    created_at: i64,
}

impl PreparedRequest {
    fn into_cascade(self, state: &GatewayAppState, sink: EventSink) -> (CascadeInput, RequestEnd) {
        let end = RequestEnd {
            trace_id: self.trace_id.clone(),
            variant: self.variant,
            requested_model: self.requested_model,
            started: self.started,
            created_at: self.created_at,
        };
        let input = CascadeInput {
            backend: Arc::clone(&state.backend),
            sink,
            trace_id: self.trace_id,
            config: self.variant.config(),
            parts: self.parts,
            response_schema: self.response_schema,
            api_key: self.api_key,
            queue: self.queue,
            recovery: self.recovery,
            timeouts: self.timeouts,
            started: self.started,
        };
        (input, end)
    }
}

fn body_rejection_response(trace_id: String, rejection: BytesRejection) -> Response {
    let (status, code) = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        (StatusCode::PAYLOAD_TOO_LARGE, "GW_BODY_TOO_LARGE")
    } else {
        (StatusCode::BAD_REQUEST, "GW_INVALID_REQUEST")
    };
    error_response(status, trace_id, code, rejection.body_text(), vec![])
}

/// Synchronous validation. Any failure here is returned before streaming starts.
fn prepare(
    state: &GatewayAppState,
    variant: RequestVariant,
    body: Result<Bytes, BytesRejection>,
) -> Result<PreparedRequest, Response> {
    let started = Instant::now();
    let trace_id = new_trace_id();
    let created_at = now_unix_seconds();
    let config = variant.config();

    let body = match body {
        Ok(body) => body,
        Err(rejection) => return Err(body_rejection_response(trace_id, rejection)),
    };

    let request: GenerationRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                trace_id,
                "GW_INVALID_REQUEST",
                format!("invalid JSON body: {err}"),
                vec![],
            ))
        }
    };

    let parts = match build_prompt_parts(&request, config) {
        Ok(parts) => parts,
        Err(invalid) => {
            tracing::warn!(
                trace_id = %trace_id,
                variant = variant.as_str(),
                error_code = invalid.error_code,
                "rejected request: {}",
                invalid.message
            );
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                trace_id,
                invalid.error_code,
                invalid.message,
                vec![],
            ));
        }
    };

    let Some(api_key) = state.settings.resolve_api_key(request.api_key.as_deref()) else {
        tracing::error!(trace_id = %trace_id, error_code = "GW_MISSING_CREDENTIALS", "no upstream API key configured");
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            trace_id,
            "GW_MISSING_CREDENTIALS",
            "no upstream API key: set api_key in settings, GEMINI_API_KEY, or send apiKey".to_string(),
            vec![],
        ));
    };

    let requested_model = request.model.as_deref().and_then(sanitize_model);
    let response_schema = if config.allow_schema {
        request
            .schema
            .as_ref()
            .filter(|schema| !schema.is_null())
            .map(|schema| Arc::new(clean_response_schema(schema)))
    } else {
        None
    };

    let settings = state.settings.as_ref();
    Ok(PreparedRequest {
        trace_id,
        variant,
        queue: ModelQueue::for_request(requested_model.as_deref(), &settings.default_models),
        requested_model,
        parts: Arc::new(parts),
        response_schema,
        api_key,
        recovery: RecitationRecovery::new(&settings.recitation_fallback_models),
        timeouts: RelayTimeouts::from_seconds(
            settings.upstream_first_byte_timeout_seconds,
            settings.upstream_stream_idle_timeout_seconds,
        ),
        started,
        created_at,
    })
}

async fn run_and_record(state: GatewayAppState, input: CascadeInput, end: RequestEnd) {
    let report = failover_loop::run(input).await;
    record_request_end(&state, end, report).await;
}

async fn record_request_end(state: &GatewayAppState, end: RequestEnd, report: CascadeReport) {
    let duration_ms = end.started.elapsed().as_millis();
    tracing::info!(
        trace_id = %end.trace_id,
        variant = end.variant.as_str(),
        outcome = report.outcome.as_str(),
        attempts = report.attempts.len(),
        model = report.final_model.as_deref().unwrap_or(""),
        duration_ms = duration_ms as u64,
        "request finished"
    );

    let (Some(db), Some(log_tx)) = (state.db.as_ref(), state.log_tx.as_ref()) else {
        return;
    };
    let args = RequestLogEnqueueArgs {
        trace_id: end.trace_id,
        variant: end.variant,
        requested_model: end.requested_model,
        outcome: report.outcome.as_str(),
        error_code: report.last_error_code,
        attempts: report.attempts,
        final_model: report.final_model,
        duration_ms,
        ttfb_ms: report.first_output_ms,
        created_at: end.created_at,
    };
    enqueue_request_log_with_backpressure(db, log_tx, args).await;
}

/// Streams the cascade as NDJSON. The cascade runs in its own task and owns
/// the only sender of the response body.
pub(in crate::gateway) async fn stream_impl(
    state: GatewayAppState,
    variant: RequestVariant,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let prepared = match prepare(&state, variant, body) {
        Ok(prepared) => prepared,
        Err(resp) => return resp,
    };
    let trace_id = prepared.trace_id.clone();
    tracing::info!(
        trace_id = %trace_id,
        variant = variant.as_str(),
        model_override = prepared.requested_model.as_deref().unwrap_or(""),
        queue = prepared.queue.len(),
        "request accepted"
    );

    let (sink, body_stream) = EventSink::channel();
    let (input, end) = prepared.into_cascade(&state, sink);
    tokio::spawn(run_and_record(state, input, end));

    build_ndjson_response(&trace_id, Body::from_stream(body_stream))
}

/// Runs the plain-generation cascade, consumes its NDJSON in-process and
/// returns one finalized JSON body.
pub(in crate::gateway) async fn collect_json_impl(
    state: GatewayAppState,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let prepared = match prepare(&state, RequestVariant::Generate, body) {
        Ok(prepared) => prepared,
        Err(resp) => return resp,
    };
    let trace_id = prepared.trace_id.clone();
    let schema_constrained = prepared.response_schema.is_some();

    let (sink, mut lines) = EventSink::channel();
    let (input, end) = prepared.into_cascade(&state, sink);
    tokio::spawn(run_and_record(state, input, end));

    let mut accumulator = AnswerAccumulator::new();
    while let Some(frame) = next_item(&mut lines).await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(never) => match never {},
        };
        let line = String::from_utf8_lossy(&frame);
        if let Err(err) = accumulator.push_line(&line) {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                trace_id,
                err.error_code(),
                err.to_string(),
                vec![],
            );
        }
    }

    let answer = match accumulator.finish() {
        Ok(answer) => answer,
        Err(failure) => {
            return error_response_with_retryable(
                StatusCode::BAD_GATEWAY,
                trace_id,
                failure.code.as_str(),
                failure.message,
                failure.attempts,
                Some(failure.retryable),
            )
        }
    };

    let result = match finalize_answer(&answer.text, schema_constrained) {
        Ok(FinalAnswer::Json(value)) => value,
        Ok(FinalAnswer::Text(text)) => Value::String(text),
        Err(err) => {
            tracing::warn!(trace_id = %trace_id, error_code = err.error_code(), "{err}");
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                trace_id,
                err.error_code(),
                err.to_string(),
                vec![],
            );
        }
    };

    let payload = serde_json::json!({
        "trace_id": trace_id,
        "attempt": answer.attempt,
        "model": answer.model,
        "result": result,
    });
    let mut resp = (StatusCode::OK, Json(payload)).into_response();
    if let Ok(v) = HeaderValue::from_str(&trace_id) {
        resp.headers_mut().insert("x-trace-id", v);
    }
    resp
}
