//! Usage: Response building for the NDJSON relay.

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

pub(super) const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub(super) fn build_ndjson_response(trace_id: &str, body: Body) -> Response {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-trace-id", trace_id);

    match builder.body(body) {
        Ok(r) => r,
        Err(_) => {
            let mut fallback =
                (StatusCode::INTERNAL_SERVER_ERROR, "GW_RESPONSE_BUILD_ERROR").into_response();
            fallback.headers_mut().insert(
                "x-trace-id",
                HeaderValue::from_str(trace_id).unwrap_or(HeaderValue::from_static("unknown")),
            );
            fallback
        }
    }
}
