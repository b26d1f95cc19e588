//! Usage: Upstream generation backend seam (chunk model, errors, trait).

mod gemini;
#[cfg(test)]
pub(in crate::gateway) mod testing;

pub(crate) use gemini::GeminiBackend;

use futures_core::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartTag {
    Thought,
    Answer,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TaggedText {
    pub(crate) tag: PartTag,
    pub(crate) text: String,
}

impl TaggedText {
    pub(crate) fn answer(text: impl Into<String>) -> Self {
        Self {
            tag: PartTag::Answer,
            text: text.into(),
        }
    }

    pub(crate) fn thought(text: impl Into<String>) -> Self {
        Self {
            tag: PartTag::Thought,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FinishSignal {
    Stop,
    Recitation,
    Other(String),
}

impl FinishSignal {
    /// `None` for an unspecified/absent reason.
    pub(crate) fn from_upstream(reason: &str) -> Option<Self> {
        match reason.trim() {
            "" | "FINISH_REASON_UNSPECIFIED" => None,
            "STOP" => Some(Self::Stop),
            "RECITATION" => Some(Self::Recitation),
            other => Some(Self::Other(other.to_string())),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Stop => "STOP",
            Self::Recitation => "RECITATION",
            Self::Other(reason) => reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct UpstreamChunk {
    pub(crate) parts: Vec<TaggedText>,
    pub(crate) grounding: Option<Value>,
    pub(crate) finish: Option<FinishSignal>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream stream read failed: {0}")]
    Stream(String),
    #[error("upstream chunk decode failed: {0}")]
    Decode(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
}

impl UpstreamError {
    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "GW_UPSTREAM_CONNECT_FAILED",
            Self::Status { status, .. } if *status == 429 => "GW_UPSTREAM_RATE_LIMITED",
            Self::Status { status, .. } if *status >= 500 => "GW_UPSTREAM_5XX",
            Self::Status { .. } => "GW_UPSTREAM_4XX",
            Self::Stream(_) => "GW_STREAM_ERROR",
            Self::Decode(_) => "GW_UPSTREAM_DECODE_FAILED",
            Self::Timeout(_) => "GW_UPSTREAM_TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PromptPart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

/// One attempt's view of the request. Prompt parts and schema are shared across
/// every attempt of the same request.
#[derive(Debug, Clone)]
pub(crate) struct UpstreamRequest {
    pub(crate) model: String,
    pub(crate) api_key: String,
    pub(crate) parts: Arc<Vec<PromptPart>>,
    pub(crate) response_schema: Option<Arc<Value>>,
    pub(crate) enable_search: bool,
}

pub(crate) type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<UpstreamChunk, UpstreamError>> + Send>>;

#[async_trait::async_trait]
pub(crate) trait GenerationBackend: Send + Sync {
    async fn open_stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_signal_parses_upstream_reasons() {
        assert_eq!(FinishSignal::from_upstream("STOP"), Some(FinishSignal::Stop));
        assert_eq!(
            FinishSignal::from_upstream("RECITATION"),
            Some(FinishSignal::Recitation)
        );
        assert_eq!(FinishSignal::from_upstream("FINISH_REASON_UNSPECIFIED"), None);
        assert_eq!(FinishSignal::from_upstream(""), None);
        assert_eq!(
            FinishSignal::from_upstream("SAFETY"),
            Some(FinishSignal::Other("SAFETY".to_string()))
        );
        assert_eq!(FinishSignal::Other("MAX_TOKENS".to_string()).as_str(), "MAX_TOKENS");
    }

    #[test]
    fn upstream_error_codes_are_stable() {
        assert_eq!(
            UpstreamError::Status {
                status: 503,
                body: String::new()
            }
            .error_code(),
            "GW_UPSTREAM_5XX"
        );
        assert_eq!(
            UpstreamError::Status {
                status: 429,
                body: String::new()
            }
            .error_code(),
            "GW_UPSTREAM_RATE_LIMITED"
        );
        assert_eq!(
            UpstreamError::Timeout("idle".to_string()).error_code(),
            "GW_UPSTREAM_TIMEOUT"
        );
    }
}
