//! Usage: Response body stream fed by the cascade task through a bounded channel.

use axum::body::Bytes;
use futures_core::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub(in crate::gateway) struct NdjsonBodyStream {
    rx: mpsc::Receiver<Bytes>,
}

impl NdjsonBodyStream {
    pub(in crate::gateway) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl Stream for NdjsonBodyStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        this.rx.poll_recv(cx).map(|item| item.map(Ok))
    }
}
