//! Usage: Minimal `Stream` polling helpers over `futures_core` (no `futures` combinators).

use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

struct NextFuture<'a, S: Stream + Unpin + ?Sized>(&'a mut S);

impl<'a, S: Stream + Unpin + ?Sized> Future for NextFuture<'a, S> {
    type Output = Option<S::Item>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.0).poll_next(cx)
    }
}

pub(crate) async fn next_item<S: Stream + Unpin + ?Sized>(stream: &mut S) -> Option<S::Item> {
    NextFuture(stream).await
}

#[derive(Debug)]
pub(crate) struct Elapsed;

/// `next_item` bounded by an optional deadline; `None` waits forever.
pub(crate) async fn next_item_within<S: Stream + Unpin + ?Sized>(
    stream: &mut S,
    limit: Option<Duration>,
) -> Result<Option<S::Item>, Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, next_item(stream))
            .await
            .map_err(|_| Elapsed),
        None => Ok(next_item(stream).await),
    }
}
