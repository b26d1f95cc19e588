use crate::shared::time::now_unix_seconds;
use axum::http::{header, HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicU64, Ordering};

const MAX_MODEL_CHARS: usize = 200;

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(super) fn new_trace_id() -> String {
    let ts = now_unix_seconds();
    let seq = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{ts}-{seq}")
}

pub(super) fn sanitize_model(model: &str) -> Option<String> {
    let model = model.trim();
    if model.is_empty() {
        return None;
    }
    Some(model.chars().take(MAX_MODEL_CHARS).collect())
}

pub(super) fn encode_url_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len().saturating_mul(3));
    for b in input.as_bytes() {
        let c = *b as char;
        let is_unreserved = matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~');
        if is_unreserved {
            out.push(c);
            continue;
        }
        out.push('%');
        out.push_str(&format!("{:02X}", b));
    }
    out
}

pub(super) fn has_gzip_content_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .any(|enc| enc.eq_ignore_ascii_case("gzip"))
        })
        .unwrap_or(false)
}

pub(super) fn inject_gemini_auth(api_key: &str, headers: &mut HeaderMap) {
    headers.remove("x-goog-api-key");
    if let Ok(header_value) = HeaderValue::from_str(api_key.trim()) {
        headers.insert("x-goog-api-key", header_value);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum DataUri<'a> {
    /// `data:<mime>;base64,<payload>`; `mime` may be empty.
    Inline { mime: &'a str, payload: &'a str },
    /// Not a data URI at all; the caller treats it as bare base64.
    Bare(&'a str),
}

pub(super) fn split_data_uri(input: &str) -> Result<DataUri<'_>, String> {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Ok(DataUri::Bare(trimmed));
    };
    let Some((header, payload)) = rest.split_once(',') else {
        return Err("data URI is missing the ',' separator".to_string());
    };
    let Some(mime) = header.strip_suffix(";base64") else {
        return Err("data URI must be base64 encoded".to_string());
    };
    Ok(DataUri::Inline {
        mime: mime.trim(),
        payload: payload.trim(),
    })
}
