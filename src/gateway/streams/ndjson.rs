//! Usage: NDJSON framing and the single-slot sink the cascade writes into.

use super::NdjsonBodyStream;
use crate::gateway::events::StreamMessage;
use axum::body::Bytes;
use std::future::Future;
use tokio::sync::mpsc;

/// One framed message in flight at most.
const SINK_CAPACITY: usize = 1;

/// Why a message could not be delivered. Either way the stream cannot carry
/// any further events for this request.
#[derive(Debug, thiserror::Error)]
pub(in crate::gateway) enum SinkError {
    /// The response body (or in-process consumer) was dropped.
    #[error("client disconnected")]
    ClientGone,
    #[error("failed to frame {kind} message: {source}")]
    Frame {
        kind: &'static str,
        source: serde_json::Error,
    },
}

impl SinkError {
    pub(in crate::gateway) fn error_code(&self) -> &'static str {
        match self {
            Self::ClientGone => "GW_CLIENT_GONE",
            Self::Frame { .. } => "GW_STREAM_FRAME_FAILED",
        }
    }
}

pub(in crate::gateway) fn frame(message: &StreamMessage) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

pub(in crate::gateway) struct EventSink {
    tx: mpsc::Sender<Bytes>,
}

impl EventSink {
    pub(in crate::gateway) fn channel() -> (Self, NdjsonBodyStream) {
        let (tx, rx) = mpsc::channel::<Bytes>(SINK_CAPACITY);
        (Self { tx }, NdjsonBodyStream::new(rx))
    }

    /// Frames and writes one message, waiting until the previous one was taken.
    pub(in crate::gateway) async fn emit(&self, message: &StreamMessage) -> Result<(), SinkError> {
        self.send_framed(message.kind(), frame(message)).await
    }

    async fn send_framed(
        &self,
        kind: &'static str,
        framed: Result<Bytes, serde_json::Error>,
    ) -> Result<(), SinkError> {
        let line = framed.map_err(|source| SinkError::Frame { kind, source })?;
        self.tx.send(line).await.map_err(|_| SinkError::ClientGone)
    }

    /// Runs `fut` unless the consumer goes away first, so a silent upstream
    /// never outlives the request that asked for it.
    pub(in crate::gateway) async fn unless_closed<F: Future>(
        &self,
        fut: F,
    ) -> Result<F::Output, SinkError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.tx.closed() => Err(SinkError::ClientGone),
        }
    }
}
