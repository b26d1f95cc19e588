//! Usage: Incremental gunzip over an upstream byte stream, tolerant of a missing gzip trailer.

use axum::body::Bytes;
use flate2::write::GzDecoder;
use futures_core::Stream;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

enum Phase<E> {
    Reading,
    /// Upstream is finished: hand out what is left, then the upstream error if any.
    Draining(Option<E>),
    Done,
}

pub(in crate::gateway) struct GunzipStream<S, E> {
    inner: S,
    decoder: GzDecoder<Vec<u8>>,
    phase: Phase<E>,
}

impl<S, E> GunzipStream<S, E> {
    pub(in crate::gateway) fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: GzDecoder::new(Vec::new()),
            phase: Phase::Reading,
        }
    }

    /// `false` once the decoder rejects input (corrupt or truncated body).
    fn feed(&mut self, compressed: &[u8]) -> bool {
        self.decoder
            .write_all(compressed)
            .and_then(|()| self.decoder.flush())
            .is_ok()
    }

    fn take_output(&mut self) -> Option<Bytes> {
        let out = std::mem::take(self.decoder.get_mut());
        (!out.is_empty()).then(|| Bytes::from(out))
    }
}

impl<S, E> Stream for GunzipStream<S, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();

        loop {
            match this.phase {
                Phase::Done => return Poll::Ready(None),
                Phase::Draining(_) => {
                    if let Some(bytes) = this.take_output() {
                        return Poll::Ready(Some(Ok(bytes)));
                    }
                    let pending = match std::mem::replace(&mut this.phase, Phase::Done) {
                        Phase::Draining(pending) => pending,
                        _ => None,
                    };
                    return Poll::Ready(pending.map(Err));
                }
                Phase::Reading => {}
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    // A body cut before its trailer fails here; the decoded prefix stands.
                    if this.decoder.try_finish().is_err() {
                        tracing::debug!("gzip body ended before its trailer");
                    }
                    this.phase = Phase::Draining(None);
                }
                Poll::Ready(Some(Err(err))) => {
                    let _ = this.decoder.flush();
                    this.phase = Phase::Draining(Some(err));
                }
                Poll::Ready(Some(Ok(compressed))) => {
                    if !this.feed(&compressed) {
                        tracing::debug!("gzip decoder rejected input; ending body early");
                        this.phase = Phase::Draining(None);
                        continue;
                    }
                    if let Some(bytes) = this.take_output() {
                        return Poll::Ready(Some(Ok(bytes)));
                    }
                }
            }
        }
    }
}
