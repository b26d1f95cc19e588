//! Usage: Incremental SSE decoder yielding the `data` payload of each event.
//!
//! Bytes are split on `\n` only, so multi-byte UTF-8 sequences are never cut; a
//! blank line (with or without `\r`) dispatches the pending event. `[DONE]` ends
//! the stream and a trailing unterminated event is flushed at end of input.

use crate::gateway::upstream::UpstreamError;
use axum::body::Bytes;
use futures_core::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

pub(in crate::gateway) struct SseDataStream<S> {
    upstream: S,
    buf: Vec<u8>,
    data_lines: Vec<String>,
    ready: VecDeque<String>,
    pending_error: Option<UpstreamError>,
    upstream_done: bool,
    saw_done_marker: bool,
}

impl<S> SseDataStream<S> {
    pub(in crate::gateway) fn new(upstream: S) -> Self {
        Self {
            upstream,
            buf: Vec::new(),
            data_lines: Vec::new(),
            ready: VecDeque::new(),
            pending_error: None,
            upstream_done: false,
            saw_done_marker: false,
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), UpstreamError> {
        let line = line.strip_suffix(b"\r".as_slice()).unwrap_or(line);
        if line.is_empty() {
            self.dispatch();
            return Ok(());
        }
        if line.first() == Some(&b':') {
            return Ok(());
        }

        let text = std::str::from_utf8(line)
            .map_err(|e| UpstreamError::Decode(format!("invalid utf-8 in sse line: {e}")))?;
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        Ok(())
    }

    fn dispatch(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();

        if self.saw_done_marker {
            return;
        }
        if data.trim() == "[DONE]" {
            self.saw_done_marker = true;
            return;
        }
        self.ready.push_back(data);
    }

    fn consume_complete_lines(&mut self) -> Result<(), UpstreamError> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.process_line(&line[..pos])?;
        }
        Ok(())
    }

    fn finish_input(&mut self) -> Result<(), UpstreamError> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.process_line(&rest)?;
        }
        self.dispatch();
        Ok(())
    }
}

impl<S, E> Stream for SseDataStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<UpstreamError>,
{
    type Item = Result<String, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();

        loop {
            if let Some(data) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(data)));
            }

            if this.upstream_done || this.saw_done_marker {
                if let Some(err) = this.pending_error.take() {
                    return Poll::Ready(Some(Err(err)));
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.upstream_done = true;
                    if let Err(err) = this.finish_input() {
                        this.pending_error = Some(err);
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.upstream_done = true;
                    this.pending_error = Some(err.into());
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buf.extend_from_slice(chunk.as_ref());
                    if let Err(err) = this.consume_complete_lines() {
                        this.upstream_done = true;
                        this.pending_error = Some(err);
                    }
                }
            }
        }
    }
}
