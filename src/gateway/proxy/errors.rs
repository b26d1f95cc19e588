//! Usage: Standardized gateway error responses (pre-stream rejections and collected-mode failures).

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::types::ErrorCategory;
use crate::gateway::events::Attempt;

#[derive(Debug, Serialize)]
struct GatewayErrorResponse {
    trace_id: String,
    error_code: &'static str,
    category: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attempts: Vec<Attempt>,
}

pub(super) fn category_for_code(error_code: &str) -> ErrorCategory {
    match error_code {
        "GW_INVALID_REQUEST" | "GW_INVALID_IMAGE" | "GW_BODY_TOO_LARGE" => {
            ErrorCategory::InvalidRequest
        }
        "content-policy-exhausted" => ErrorCategory::ContentPolicy,
        "all-models-exhausted" | "GW_ANSWER_NOT_JSON" => ErrorCategory::ProviderError,
        _ => ErrorCategory::SystemError,
    }
}

pub(in crate::gateway) fn error_response(
    status: StatusCode,
    trace_id: String,
    error_code: &'static str,
    message: String,
    attempts: Vec<Attempt>,
) -> Response {
    error_response_with_retryable(status, trace_id, error_code, message, attempts, None)
}

/// Collected-mode terminal failures also report whether a fresh call may help.
pub(in crate::gateway) fn error_response_with_retryable(
    status: StatusCode,
    trace_id: String,
    error_code: &'static str,
    message: String,
    attempts: Vec<Attempt>,
    retryable: Option<bool>,
) -> Response {
    let payload = GatewayErrorResponse {
        trace_id: trace_id.clone(),
        error_code,
        category: category_for_code(error_code).as_str(),
        message,
        retryable,
        attempts,
    };

    let mut resp = (status, Json(payload)).into_response();

    if let Ok(v) = HeaderValue::from_str(&trace_id) {
        resp.headers_mut().insert("x-trace-id", v);
    }

    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_sets_trace_header_and_category() {
        let resp = error_response(
            StatusCode::BAD_REQUEST,
            "t-1".to_string(),
            "GW_INVALID_IMAGE",
            "images[0]: bad".to_string(),
            Vec::new(),
        );
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get("x-trace-id").and_then(|v| v.to_str().ok()),
            Some("t-1")
        );
    }

    #[test]
    fn categories_follow_error_codes() {
        assert_eq!(
            category_for_code("GW_INVALID_REQUEST").as_str(),
            "INVALID_REQUEST"
        );
        assert_eq!(
            category_for_code("content-policy-exhausted").as_str(),
            "CONTENT_POLICY"
        );
        assert_eq!(
            category_for_code("GW_MISSING_CREDENTIALS").as_str(),
            "SYSTEM_ERROR"
        );
    }
}
