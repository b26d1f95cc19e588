//! Usage: Gemini `streamGenerateContent` backend (request body, SSE chunk decoding).

use super::{
    ChunkStream, FinishSignal, GenerationBackend, PromptPart, TaggedText, UpstreamChunk,
    UpstreamError, UpstreamRequest,
};
use crate::gateway::streams::{GunzipStream, SseDataStream};
use crate::gateway::util::{encode_url_component, has_gzip_content_encoding, inject_gemini_auth};
use crate::settings::GatewaySettings;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        if err.is_connect() || err.is_request() || err.is_builder() {
            return Self::Request(err.to_string());
        }
        Self::Stream(err.to_string())
    }
}

pub(crate) struct GeminiBackend {
    client: reqwest::Client,
    base_url: String,
    safety_threshold: String,
    include_thoughts: bool,
}

impl GeminiBackend {
    pub(crate) fn new(settings: &GatewaySettings) -> Result<Self, String> {
        // No overall timeout: streams are long-lived and bounded by the relay.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| format!("SYSTEM_ERROR: failed to build upstream http client: {e}"))?;
        Ok(Self {
            client,
            base_url: settings.upstream_base_url.trim_end_matches('/').to_string(),
            safety_threshold: settings.safety_threshold.clone(),
            include_thoughts: settings.include_thoughts,
        })
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url,
            encode_url_component(model)
        )
    }

    fn build_body<'a>(&'a self, request: &'a UpstreamRequest) -> GeminiRequest<'a> {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => GeminiRequestPart::Text { text },
                PromptPart::InlineImage { mime_type, data } => GeminiRequestPart::InlineData {
                    inline_data: GeminiInlineData { mime_type, data },
                },
            })
            .collect();

        let safety_settings = HARM_CATEGORIES
            .into_iter()
            .map(|category| GeminiSafetySetting {
                category,
                threshold: &self.safety_threshold,
            })
            .collect();

        let response_schema = request.response_schema.as_deref();
        GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts,
            }],
            safety_settings,
            generation_config: GeminiGenerationConfig {
                thinking_config: GeminiThinkingConfig {
                    include_thoughts: self.include_thoughts,
                },
                response_mime_type: response_schema.map(|_| "application/json"),
                response_schema,
            },
            tools: request
                .enable_search
                .then(|| vec![serde_json::json!({ "googleSearch": {} })]),
        }
    }
}

#[async_trait::async_trait]
impl GenerationBackend for GeminiBackend {
    async fn open_stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, UpstreamError> {
        let body = serde_json::to_vec(&self.build_body(request))
            .map_err(|e| UpstreamError::Request(format!("failed to encode request body: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // Decoded by `GunzipStream`; reqwest is built without its own decompression.
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        inject_gemini_auth(&request.api_key, &mut headers);

        let resp = self
            .client
            .post(self.stream_url(&request.model))
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let gzip = has_gzip_content_encoding(resp.headers());
        let raw: ByteStream = Box::pin(resp.bytes_stream());
        let bytes: ByteStream = if gzip {
            Box::pin(GunzipStream::new(raw))
        } else {
            raw
        };

        Ok(Box::pin(GeminiChunkStream {
            events: SseDataStream::new(bytes),
        }))
    }
}

struct GeminiChunkStream<S> {
    events: SseDataStream<S>,
}

impl<S> Stream for GeminiChunkStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<UpstreamChunk, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.events).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(Some(Ok(data))) => Poll::Ready(Some(parse_chunk(&data))),
        }
    }
}

pub(super) fn parse_chunk(data: &str) -> Result<UpstreamChunk, UpstreamError> {
    let response: GeminiStreamResponse = serde_json::from_str(data)
        .map_err(|e| UpstreamError::Decode(format!("invalid chunk json: {e}")))?;

    let Some(candidate) = response.candidates.into_iter().next() else {
        let block_reason = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .filter(|reason| !reason.trim().is_empty());
        return Ok(UpstreamChunk {
            finish: block_reason.map(|reason| FinishSignal::Other(format!("PROMPT_BLOCKED:{reason}"))),
            ..UpstreamChunk::default()
        });
    };

    let parts = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| {
            let text = part.text.filter(|t| !t.is_empty())?;
            Some(if part.thought {
                TaggedText::thought(text)
            } else {
                TaggedText::answer(text)
            })
        })
        .collect();

    Ok(UpstreamChunk {
        parts,
        grounding: candidate.grounding_metadata.filter(|v| !v.is_null()),
        finish: candidate
            .finish_reason
            .as_deref()
            .and_then(FinishSignal::from_upstream),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    safety_settings: Vec<GeminiSafetySetting<'a>>,
    generation_config: GeminiGenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiRequestPart<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData<'a>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiSafetySetting<'a> {
    category: &'a str,
    threshold: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig<'a> {
    thinking_config: GeminiThinkingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    include_thoughts: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
    grounding_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::upstream::PartTag;
    use crate::shared::stream_ext::next_item;
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::Router;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured {
        inner: Arc<Mutex<Option<(Uri, HeaderMap, Value)>>>,
    }

    #[derive(Clone)]
    struct UpstreamScript {
        captured: Captured,
        status: StatusCode,
        body: Vec<u8>,
        gzip: bool,
    }

    async fn fake_upstream(
        State(script): State<UpstreamScript>,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let mut resp = (script.status, script.body.clone()).into_response();
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        let accepts_gzip = headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("gzip"));
        let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        *script.captured.inner.lock().expect("lock") = Some((uri, headers, json));

        if script.gzip && accepts_gzip {
            resp.headers_mut()
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        resp
    }

    async fn spawn_upstream(script: UpstreamScript) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new().fallback(fake_upstream).with_state(script);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/v1beta")
    }

    fn backend(base_url: String) -> GeminiBackend {
        let settings = GatewaySettings {
            upstream_base_url: base_url,
            ..GatewaySettings::default()
        };
        GeminiBackend::new(&settings).expect("backend")
    }

    fn request(model: &str, schema: Option<Value>, enable_search: bool) -> UpstreamRequest {
        UpstreamRequest {
            model: model.to_string(),
            api_key: "test-key".to_string(),
            parts: Arc::new(vec![
                PromptPart::Text("2+2?".to_string()),
                PromptPart::InlineImage {
                    mime_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
            ]),
            response_schema: schema.map(Arc::new),
            enable_search,
        }
    }

    const SSE_BODY: &str = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"thinking\",\"thought\":true},{\"text\":\"4\"}]}}]}\n\n\
data: {\"candidates\":[{\"content\":{\"parts\":[]},\"finishReason\":\"STOP\"}]}\n\n";

    #[test]
    fn parse_chunk_tags_thoughts_and_finish() {
        let chunk = parse_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"hmm","thought":true},{"text":"ok"}]},"finishReason":"RECITATION"}]}"#,
        )
        .expect("chunk");
        assert_eq!(chunk.parts.len(), 2);
        assert_eq!(chunk.parts[0].tag, PartTag::Thought);
        assert_eq!(chunk.parts[1].tag, PartTag::Answer);
        assert_eq!(chunk.finish, Some(FinishSignal::Recitation));
        assert!(chunk.grounding.is_none());
    }

    #[test]
    fn parse_chunk_reads_grounding_and_prompt_block() {
        let chunk = parse_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"}]},"groundingMetadata":{"webSearchQueries":["q"]}}]}"#,
        )
        .expect("chunk");
        assert_eq!(chunk.grounding.expect("grounding")["webSearchQueries"][0], "q");
        assert_eq!(chunk.finish, None);

        let blocked = parse_chunk(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).expect("chunk");
        assert_eq!(
            blocked.finish,
            Some(FinishSignal::Other("PROMPT_BLOCKED:SAFETY".to_string()))
        );
    }

    #[test]
    fn parse_chunk_rejects_malformed_json() {
        let err = parse_chunk("{not json").unwrap_err();
        assert_eq!(err.error_code(), "GW_UPSTREAM_DECODE_FAILED");
    }

    #[test]
    fn build_body_switches_schema_and_search_tool() {
        let backend = backend("http://localhost/v1beta".to_string());

        let schema = serde_json::json!({"type": "object"});
        let constrained = request("m", Some(schema.clone()), false);
        let body = serde_json::to_value(backend.build_body(&constrained)).expect("json");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"], schema);
        assert_eq!(body["generationConfig"]["thinkingConfig"]["includeThoughts"], true);
        assert_eq!(body["safetySettings"].as_array().map(Vec::len), Some(4));
        assert_eq!(body["safetySettings"][0]["threshold"], "BLOCK_NONE");
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert!(body.get("tools").is_none());

        let search = request("m", None, true);
        let body = serde_json::to_value(backend.build_body(&search)).expect("json");
        assert_eq!(body["tools"][0], serde_json::json!({"googleSearch": {}}));
        assert!(body["generationConfig"].get("responseSchema").is_none());
    }

    #[tokio::test]
    async fn open_stream_posts_to_model_endpoint_and_decodes_chunks() {
        let captured = Captured::default();
        let base = spawn_upstream(UpstreamScript {
            captured: captured.clone(),
            status: StatusCode::OK,
            body: SSE_BODY.as_bytes().to_vec(),
            gzip: false,
        })
        .await;

        let mut stream = backend(base)
            .open_stream(&request("gemini-2.5-pro", None, false))
            .await
            .expect("open");

        let first = next_item(&mut stream).await.expect("chunk").expect("ok");
        assert_eq!(first.parts[0], TaggedText::thought("thinking"));
        assert_eq!(first.parts[1], TaggedText::answer("4"));
        let second = next_item(&mut stream).await.expect("chunk").expect("ok");
        assert_eq!(second.finish, Some(FinishSignal::Stop));
        assert!(next_item(&mut stream).await.is_none());

        let (uri, headers, body) = captured
            .inner
            .lock()
            .expect("lock")
            .clone()
            .expect("request captured");
        assert_eq!(
            uri.path(),
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent"
        );
        assert_eq!(uri.query(), Some("alt=sse"));
        assert_eq!(
            headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()),
            Some("test-key")
        );
        assert_eq!(body["contents"][0]["parts"][0]["text"], "2+2?");
    }

    #[tokio::test]
    async fn open_stream_requests_and_decodes_gzip_bodies() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(SSE_BODY.as_bytes()).expect("gzip write");
        let gz = encoder.finish().expect("gzip finish");

        // The fake only labels the body gzip when the request offered it.
        let captured = Captured::default();
        let base = spawn_upstream(UpstreamScript {
            captured: captured.clone(),
            status: StatusCode::OK,
            body: gz,
            gzip: true,
        })
        .await;

        let mut stream = backend(base)
            .open_stream(&request("gemini-2.5-flash", None, false))
            .await
            .expect("open");
        let first = next_item(&mut stream).await.expect("chunk").expect("ok");
        assert_eq!(first.parts.len(), 2);
        let second = next_item(&mut stream).await.expect("chunk").expect("ok");
        assert_eq!(second.finish, Some(FinishSignal::Stop));

        let (_, headers, _) = captured
            .inner
            .lock()
            .expect("lock")
            .clone()
            .expect("request captured");
        assert_eq!(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
            Some("gzip")
        );
    }

    #[tokio::test]
    async fn open_stream_maps_error_status() {
        let base = spawn_upstream(UpstreamScript {
            captured: Captured::default(),
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: b"{\"error\":{\"status\":\"UNAVAILABLE\"}}".to_vec(),
            gzip: false,
        })
        .await;

        let err = match backend(base)
            .open_stream(&request("gemini-2.5-pro", None, false))
            .await
        {
            Ok(_) => panic!("expected status error"),
            Err(err) => err,
        };
        assert_eq!(err.error_code(), "GW_UPSTREAM_5XX");
        assert!(err.to_string().contains("UNAVAILABLE"));
    }
}
