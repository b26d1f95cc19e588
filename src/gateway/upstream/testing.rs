//! Usage: Scripted in-memory `GenerationBackend` for cascade and router tests.

use super::{
    ChunkStream, FinishSignal, GenerationBackend, TaggedText, UpstreamChunk, UpstreamError,
    UpstreamRequest,
};
use crate::shared::stream_ext::testing::VecStream;
use futures_core::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

#[derive(Debug, Clone)]
pub(in crate::gateway) enum Script {
    Chunks(Vec<Result<UpstreamChunk, UpstreamError>>),
    OpenError(UpstreamError),
    /// Opens, then never yields a chunk.
    Stall,
    /// Yields the given chunks, then goes silent without ending.
    ChunksThenStall(Vec<Result<UpstreamChunk, UpstreamError>>),
}

impl Script {
    pub(in crate::gateway) fn finish_with(texts: &[&str], finish: FinishSignal) -> Self {
        let mut chunks: Vec<Result<UpstreamChunk, UpstreamError>> = texts
            .iter()
            .map(|text| {
                Ok(UpstreamChunk {
                    parts: vec![TaggedText::answer(*text)],
                    ..UpstreamChunk::default()
                })
            })
            .collect();
        chunks.push(Ok(UpstreamChunk {
            finish: Some(finish),
            ..UpstreamChunk::default()
        }));
        Self::Chunks(chunks)
    }

    pub(in crate::gateway) fn stop(texts: &[&str]) -> Self {
        Self::finish_with(texts, FinishSignal::Stop)
    }

    pub(in crate::gateway) fn recitation(texts: &[&str]) -> Self {
        Self::finish_with(texts, FinishSignal::Recitation)
    }

    pub(in crate::gateway) fn transport_error() -> Self {
        Self::OpenError(UpstreamError::Request("connection refused".to_string()))
    }
}

#[derive(Default)]
pub(in crate::gateway) struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    otherwise: Option<Script>,
    opened: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedBackend {
    pub(in crate::gateway) fn new() -> Self {
        Self::default()
    }

    /// Queues a script for `model`. The last queued script repeats.
    pub(in crate::gateway) fn on(self, model: &str, script: Script) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(model.to_string())
                .or_default()
                .push_back(script);
        }
        self
    }

    pub(in crate::gateway) fn otherwise(mut self, script: Script) -> Self {
        self.otherwise = Some(script);
        self
    }

    pub(in crate::gateway) fn opened_models(&self) -> Vec<String> {
        self.opened
            .lock()
            .map(|opened| opened.iter().map(|r| r.model.clone()).collect())
            .unwrap_or_default()
    }

    pub(in crate::gateway) fn opened_requests(&self) -> Vec<UpstreamRequest> {
        self.opened
            .lock()
            .map(|opened| opened.clone())
            .unwrap_or_default()
    }

    fn next_script(&self, model: &str) -> Option<Script> {
        let mut scripts = self.scripts.lock().ok()?;
        match scripts.get_mut(model) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => self.otherwise.clone(),
        }
    }
}

/// Drains its queued items, then stays pending forever.
struct StalledStream {
    items: VecDeque<Result<UpstreamChunk, UpstreamError>>,
}

impl Stream for StalledStream {
    type Item = Result<UpstreamChunk, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.items.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None => Poll::Pending,
        }
    }
}

#[async_trait::async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn open_stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, UpstreamError> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(request.clone());
        }
        match self.next_script(&request.model) {
            Some(Script::Chunks(chunks)) => Ok(Box::pin(VecStream::new(chunks))),
            Some(Script::OpenError(err)) => Err(err),
            Some(Script::Stall) => Ok(Box::pin(StalledStream {
                items: VecDeque::new(),
            })),
            Some(Script::ChunksThenStall(chunks)) => Ok(Box::pin(StalledStream {
                items: chunks.into_iter().collect(),
            })),
            None => Err(UpstreamError::Status {
                status: 404,
                body: format!("no script for model {}", request.model),
            }),
        }
    }
}
