//! Usage: Request preparation (prompt parts, inline image decoding, schema cleanup).

use super::types::{GenerationRequest, InlineImage, VariantConfig};
use crate::gateway::upstream::PromptPart;
use crate::gateway::util::{split_data_uri, DataUri};
use base64::Engine;
use serde_json::{Map, Value};

const DEFAULT_IMAGE_MIME: &str = "image/jpeg";
// Keywords the upstream schema dialect rejects.
const STRIPPED_SCHEMA_KEYS: [&str; 6] = [
    "$schema",
    "$id",
    "$comment",
    "additionalProperties",
    "default",
    "examples",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct InvalidInput {
    pub(super) error_code: &'static str,
    pub(super) message: String,
}

impl InvalidInput {
    fn request(message: impl Into<String>) -> Self {
        Self {
            error_code: "GW_INVALID_REQUEST",
            message: message.into(),
        }
    }

    fn image(index: usize, message: impl std::fmt::Display) -> Self {
        Self {
            error_code: "GW_INVALID_IMAGE",
            message: format!("images[{index}]: {message}"),
        }
    }
}

/// Text part first, then one inline part per image. Built once per request and
/// shared by every attempt.
pub(super) fn build_prompt_parts(
    request: &GenerationRequest,
    config: VariantConfig,
) -> Result<Vec<PromptPart>, InvalidInput> {
    if request.text.trim().is_empty() {
        return Err(InvalidInput::request("text is required"));
    }

    let request_mime = if config.use_request_mime_type {
        request
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    } else {
        None
    };

    let mut parts = Vec::with_capacity(1 + request.images.len());
    parts.push(PromptPart::Text(request.text.clone()));

    for (index, image) in request.images.iter().enumerate() {
        let (explicit_mime, encoded) = match image {
            InlineImage::Encoded(encoded) => (None, encoded.as_str()),
            InlineImage::Object { mime_type, data } => (
                mime_type.as_deref().map(str::trim).filter(|v| !v.is_empty()),
                data.as_str(),
            ),
        };

        let (uri_mime, payload) = match split_data_uri(encoded) {
            Ok(DataUri::Inline { mime, payload }) => (Some(mime).filter(|v| !v.is_empty()), payload),
            Ok(DataUri::Bare(payload)) => (None, payload),
            Err(err) => return Err(InvalidInput::image(index, err)),
        };

        if payload.is_empty() {
            return Err(InvalidInput::image(index, "image data is empty"));
        }
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| InvalidInput::image(index, format!("invalid base64: {e}")))?;

        let mime_type = explicit_mime
            .or(uri_mime)
            .or(request_mime)
            .unwrap_or(DEFAULT_IMAGE_MIME);

        parts.push(PromptPart::InlineImage {
            mime_type: mime_type.to_string(),
            data: payload.to_string(),
        });
    }

    Ok(parts)
}

pub(super) fn clean_response_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                if STRIPPED_SCHEMA_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let cleaned = if key == "properties" {
                    clean_properties(value)
                } else {
                    clean_response_schema(value)
                };
                out.insert(key.clone(), cleaned);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_response_schema).collect()),
        other => other.clone(),
    }
}

// Keys of `properties` are field names, never keywords.
fn clean_properties(value: &Value) -> Value {
    match value {
        Value::Object(props) => Value::Object(
            props
                .iter()
                .map(|(name, schema)| (name.clone(), clean_response_schema(schema)))
                .collect(),
        ),
        other => clean_response_schema(other),
    }
}
